//! Replays billing events into license state
//!
//! Delivery is at-least-once and unordered. The processed-event ledger makes
//! replays no-ops, and ordering races (a subscription event arriving before
//! its checkout) are answered with [`Webhook::Retry`] so the provider
//! re-delivers later.

use sea_orm::DatabaseTransaction;

use super::event::{
  CheckoutSession, Customer, Event, EventKind, Invoice, Subscription,
  map_status, resolve_plan,
};

use crate::{
  config::Config,
  entity::{BillingType, LicenseStatus},
  prelude::*,
  sv::{self, Anchor, Change, NewLicense},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
  pub duplicate: bool,
}

pub struct Reconciler<'a> {
  db: &'a DatabaseConnection,
  config: &'a Config,
}

impl<'a> Reconciler<'a> {
  pub fn new(db: &'a DatabaseConnection, config: &'a Config) -> Self {
    Self { db, config }
  }

  /// Applies `event` at most once. The ledger claim and every write of the
  /// handler share one transaction, so a failed handler releases the claim
  /// and a concurrent delivery of the same event comes back as a duplicate.
  pub async fn process(&self, event: &Event, now: DateTime) -> Result<Receipt> {
    if sv::Events::new(self.db).is_processed(&event.id).await? {
      info!(event_id = %event.id, "Duplicate event skipped");
      return Ok(Receipt { duplicate: true });
    }

    let txn = self.db.begin().await?;
    if !sv::Events::new(&txn)
      .claim(&event.id, &event.event_type, now)
      .await?
    {
      txn.rollback().await?;
      info!(event_id = %event.id, "Event applied by a concurrent delivery");
      return Ok(Receipt { duplicate: true });
    }

    info!(
      event_id = %event.id,
      event_type = %event.event_type,
      "Processing billing event"
    );
    let applied =
      Apply { db: &txn, config: self.config }.dispatch(event, now).await;
    if let Err(err) = applied {
      txn.rollback().await?;
      return Err(err);
    }
    txn.commit().await?;

    Ok(Receipt { duplicate: false })
  }
}

/// Event handlers bound to the transaction of one delivery.
struct Apply<'a> {
  db: &'a DatabaseTransaction,
  config: &'a Config,
}

impl Apply<'_> {
  async fn dispatch(&self, event: &Event, now: DateTime) -> Result<()> {
    match event.kind() {
      EventKind::CheckoutCompleted => {
        self.checkout_completed(event.object()?, now).await
      }
      EventKind::SubscriptionCreated => {
        self.subscription_created(event.object()?).await
      }
      EventKind::SubscriptionUpdated => {
        self.subscription_updated(event.object()?, now).await
      }
      EventKind::SubscriptionDeleted => {
        self.subscription_deleted(event.object()?).await
      }
      EventKind::InvoicePaid => self.invoice_paid(event.object()?).await,
      EventKind::InvoicePaymentFailed => {
        self.invoice_payment_failed(event.object()?).await
      }
      EventKind::CustomerDeleted => {
        self.customer_deleted(event.object()?).await
      }
      EventKind::Unhandled => {
        debug!(event_type = %event.event_type, "Unhandled event acknowledged");
        Ok(())
      }
    }
  }

  async fn checkout_completed(
    &self,
    session: CheckoutSession,
    now: DateTime,
  ) -> Result<()> {
    let Some(customer_id) = session.customer.as_deref() else {
      warn!(session = %session.id, "Checkout without customer ignored");
      return Ok(());
    };
    let email = session.email().unwrap_or_default();

    match session.mode.as_str() {
      "subscription" => {
        sv::User::new(self.db).get_or_create(customer_id, email).await?;
        Ok(())
      }
      "payment" => {
        let Some(plan) =
          resolve_plan(&self.config.price_plans, None, &session.metadata)
        else {
          warn!(session = %session.id, "One-time checkout without a plan");
          return Ok(());
        };

        let user =
          sv::User::new(self.db).get_or_create(customer_id, email).await?;
        let (license, created) = sv::License::new(self.db)
          .create(NewLicense {
            user_id: user.id,
            plan,
            billing_type: BillingType::Lifetime,
            status: LicenseStatus::Active,
            period_start: now,
            period_end: utils::lifetime_end(),
            anchor: Anchor::Session(session.id.clone()),
          })
          .await?;

        if created {
          info!(
            key = %utils::truncate_id(&license.key),
            %plan,
            "Lifetime license issued"
          );
        }
        Ok(())
      }
      mode => {
        debug!(mode, "Checkout mode ignored");
        Ok(())
      }
    }
  }

  async fn subscription_created(&self, sub: Subscription) -> Result<()> {
    let licenses = sv::License::new(self.db);
    if licenses.by_subscription(&sub.id).await?.is_some() {
      return Ok(());
    }

    let Some(user) = sv::User::new(self.db).by_customer(&sub.customer).await?
    else {
      return Err(
        Webhook::Retry(format!("customer {} not yet known", sub.customer))
          .into(),
      );
    };

    let Some(plan) =
      resolve_plan(&self.config.price_plans, sub.price_id(), &sub.metadata)
    else {
      warn!(subscription = %sub.id, "Subscription plan unresolved, ignored");
      return Ok(());
    };

    let (period_start, period_end) = sub.period().ok_or_else(|| {
      Error::InvalidRequest(format!("subscription {} has no period", sub.id))
    })?;

    licenses
      .create(NewLicense {
        user_id: user.id,
        plan,
        billing_type: sub.billing_type().unwrap_or(BillingType::Monthly),
        status: map_status(&sub.status).unwrap_or(LicenseStatus::Active),
        period_start,
        period_end,
        anchor: Anchor::Subscription(sub.id.clone()),
      })
      .await?;
    Ok(())
  }

  async fn subscription_updated(
    &self,
    sub: Subscription,
    now: DateTime,
  ) -> Result<()> {
    let licenses = sv::License::new(self.db);
    let Some(license) = licenses.by_subscription(&sub.id).await? else {
      return Err(
        Webhook::Retry(format!("subscription {} not yet known", sub.id)).into(),
      );
    };

    let plan =
      resolve_plan(&self.config.price_plans, sub.price_id(), &sub.metadata);

    if let Some(plan) = plan
      && plan.rank() < license.plan.rank()
    {
      let reset = sv::Machine::new(self.db).reset_all(license.id, now).await?;
      info!(
        key = %utils::truncate_id(&license.key),
        from = %license.plan,
        to = %plan,
        bindings = reset,
        "Plan downgraded, machine bindings reset"
      );
    }

    let status = map_status(&sub.status);
    if status.is_none() {
      debug!(status = %sub.status, "Unrecognized subscription status kept");
    }

    licenses
      .apply(license, Change {
        plan,
        billing_type: sub.billing_type(),
        status,
        period: sub.period(),
      })
      .await?;
    Ok(())
  }

  async fn subscription_deleted(&self, sub: Subscription) -> Result<()> {
    let licenses = sv::License::new(self.db);
    let Some(license) = licenses.by_subscription(&sub.id).await? else {
      warn!(subscription = %sub.id, "Deleted subscription has no license");
      return Ok(());
    };

    licenses.set_status(license, LicenseStatus::Canceled).await?;
    Ok(())
  }

  async fn invoice_paid(&self, invoice: Invoice) -> Result<()> {
    let Some(subscription) = invoice.subscription.as_deref() else {
      debug!(invoice = %invoice.id, "One-off invoice ignored");
      return Ok(());
    };

    let licenses = sv::License::new(self.db);
    let Some(license) = licenses.by_subscription(subscription).await? else {
      return Err(
        Webhook::Retry(format!("subscription {subscription} not yet known"))
          .into(),
      );
    };

    licenses
      .apply(license, Change {
        status: Some(LicenseStatus::Active),
        period: invoice.period(),
        ..Default::default()
      })
      .await?;
    Ok(())
  }

  async fn invoice_payment_failed(&self, invoice: Invoice) -> Result<()> {
    let Some(subscription) = invoice.subscription.as_deref() else {
      return Ok(());
    };

    let licenses = sv::License::new(self.db);
    let Some(license) = licenses.by_subscription(subscription).await? else {
      warn!(invoice = %invoice.id, "Failed invoice has no license");
      return Ok(());
    };

    licenses.set_status(license, LicenseStatus::PastDue).await?;
    Ok(())
  }

  async fn customer_deleted(&self, customer: Customer) -> Result<()> {
    let Some(user) = sv::User::new(self.db).by_customer(&customer.id).await?
    else {
      return Ok(());
    };

    let licenses = sv::License::new(self.db);
    let active = licenses.active_for_user(user.id).await?;
    let count = active.len();
    for license in active {
      licenses.set_status(license, LicenseStatus::Expired).await?;
    }

    info!(customer = %customer.id, licenses = count, "Customer deleted");
    Ok(())
  }
}
