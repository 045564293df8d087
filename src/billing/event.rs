//! Provider event payloads
//!
//! Events arrive as `{id, type, data: {object}}`. Only the fields the
//! reconciler reads are modelled; everything else is ignored.

use json::Value;
use serde::{Deserialize, de::DeserializeOwned};

use crate::{
  entity::{BillingType, LicenseStatus, Plan},
  prelude::*,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Event {
  pub id: String,
  #[serde(rename = "type")]
  pub event_type: String,
  pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
  pub object: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  CheckoutCompleted,
  SubscriptionCreated,
  SubscriptionUpdated,
  SubscriptionDeleted,
  InvoicePaid,
  InvoicePaymentFailed,
  CustomerDeleted,
  /// Acknowledged and logged, never applied.
  Unhandled,
}

impl From<&str> for EventKind {
  fn from(event_type: &str) -> Self {
    match event_type {
      "checkout.session.completed" => EventKind::CheckoutCompleted,
      "customer.subscription.created" => EventKind::SubscriptionCreated,
      "customer.subscription.updated" => EventKind::SubscriptionUpdated,
      "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
      "invoice.paid" => EventKind::InvoicePaid,
      "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
      "customer.deleted" => EventKind::CustomerDeleted,
      _ => EventKind::Unhandled,
    }
  }
}

impl Event {
  pub fn kind(&self) -> EventKind {
    EventKind::from(self.event_type.as_str())
  }

  pub fn object<T: DeserializeOwned>(&self) -> Result<T> {
    json::from_value(self.data.object.clone()).map_err(|err| {
      Error::InvalidRequest(format!("`{}` payload: {err}", self.event_type))
    })
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct List<T> {
  #[serde(default = "Vec::new")]
  pub data: Vec<T>,
}

impl<T> Default for List<T> {
  fn default() -> Self {
    Self { data: Vec::new() }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
  pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
  pub id: String,
  pub mode: String,
  pub customer: Option<String>,
  pub customer_email: Option<String>,
  #[serde(default)]
  pub customer_details: Option<CustomerDetails>,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
  pub fn email(&self) -> Option<&str> {
    self
      .customer_details
      .as_ref()
      .and_then(|details| details.email.as_deref())
      .or(self.customer_email.as_deref())
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recurring {
  pub interval: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
  pub id: String,
  pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
  pub price: Price,
  pub current_period_start: Option<i64>,
  pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
  pub id: String,
  pub customer: String,
  pub status: String,
  pub current_period_start: Option<i64>,
  pub current_period_end: Option<i64>,
  #[serde(default)]
  pub items: List<SubscriptionItem>,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

fn period(start: Option<i64>, end: Option<i64>) -> Option<(DateTime, DateTime)> {
  Some((utils::from_unix(start?)?, utils::from_unix(end?)?))
}

impl Subscription {
  fn item(&self) -> Option<&SubscriptionItem> {
    self.items.data.first()
  }

  pub fn price_id(&self) -> Option<&str> {
    self.item().map(|item| item.price.id.as_str())
  }

  /// Billing period, read from the subscription or from its first item.
  pub fn period(&self) -> Option<(DateTime, DateTime)> {
    period(self.current_period_start, self.current_period_end).or_else(|| {
      let item = self.item()?;
      period(item.current_period_start, item.current_period_end)
    })
  }

  pub fn billing_type(&self) -> Option<BillingType> {
    let recurring = self.item()?.price.recurring.as_ref()?;
    match recurring.interval.as_str() {
      "year" => Some(BillingType::Annual),
      "month" => Some(BillingType::Monthly),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinePeriod {
  pub start: i64,
  pub end: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLine {
  pub period: Option<LinePeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
  pub id: String,
  pub subscription: Option<String>,
  pub customer: Option<String>,
  pub period_start: Option<i64>,
  pub period_end: Option<i64>,
  #[serde(default)]
  pub lines: List<InvoiceLine>,
}

impl Invoice {
  /// Service period being paid for. Line items carry the upcoming period,
  /// the invoice header only the one just billed.
  pub fn period(&self) -> Option<(DateTime, DateTime)> {
    self
      .lines
      .data
      .iter()
      .find_map(|line| line.period.as_ref())
      .and_then(|p| period(Some(p.start), Some(p.end)))
      .or_else(|| period(self.period_start, self.period_end))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
  pub id: String,
}

/// Provider subscription status to license status. `None` leaves the stored
/// status unchanged.
pub fn map_status(status: &str) -> Option<LicenseStatus> {
  match status {
    "active" | "trialing" => Some(LicenseStatus::Active),
    "past_due" => Some(LicenseStatus::PastDue),
    "canceled" | "unpaid" => Some(LicenseStatus::Canceled),
    "incomplete" | "incomplete_expired" => Some(LicenseStatus::Expired),
    _ => None,
  }
}

/// Price id through the configured table, then `metadata.plan`.
pub fn resolve_plan(
  price_plans: &HashMap<String, Plan>,
  price_id: Option<&str>,
  metadata: &HashMap<String, String>,
) -> Option<Plan> {
  price_id
    .and_then(|price| price_plans.get(price).copied())
    .or_else(|| metadata.get("plan").and_then(|plan| plan.parse().ok()))
}

#[cfg(test)]
mod tests {
  use json::json;

  use super::*;

  #[test]
  fn status_vocabulary() {
    assert_eq!(map_status("trialing"), Some(LicenseStatus::Active));
    assert_eq!(map_status("unpaid"), Some(LicenseStatus::Canceled));
    assert_eq!(map_status("incomplete_expired"), Some(LicenseStatus::Expired));
    assert_eq!(map_status("paused"), None);
  }

  #[test]
  fn event_kinds() {
    assert_eq!(EventKind::from("invoice.paid"), EventKind::InvoicePaid);
    assert_eq!(EventKind::from("charge.refunded"), EventKind::Unhandled);
  }

  #[test]
  fn subscription_period_falls_back_to_items() {
    let event: Event = json::from_value(json!({
      "id": "evt_1",
      "type": "customer.subscription.created",
      "data": { "object": {
        "id": "sub_1",
        "customer": "cus_1",
        "status": "active",
        "items": { "data": [{
          "price": { "id": "price_pro", "recurring": { "interval": "year" } },
          "current_period_start": 1_700_000_000,
          "current_period_end": 1_731_536_000,
        }]},
      }},
    }))
    .unwrap();

    let sub: Subscription = event.object().unwrap();
    assert_eq!(sub.price_id(), Some("price_pro"));
    assert_eq!(sub.billing_type(), Some(BillingType::Annual));
    let (start, end) = sub.period().unwrap();
    assert_eq!(utils::unix(start), 1_700_000_000);
    assert_eq!(utils::unix(end), 1_731_536_000);
  }

  #[test]
  fn plan_resolution_order() {
    let prices = HashMap::from([("price_team".to_string(), Plan::Team)]);
    let metadata = HashMap::from([("plan".to_string(), "pro".to_string())]);

    assert_eq!(
      resolve_plan(&prices, Some("price_team"), &metadata),
      Some(Plan::Team)
    );
    assert_eq!(resolve_plan(&prices, Some("price_x"), &metadata), Some(Plan::Pro));
    assert_eq!(resolve_plan(&prices, None, &HashMap::new()), None);
  }
}
