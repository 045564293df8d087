use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::HeaderMap};
use json::{Value, json};

use super::extract::{ClientAddr, Json};
use crate::{
  billing::Event,
  limits::{Endpoint, RateLimitHeaders},
  prelude::*,
  state::AppState,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// The raw body is verified before anything is parsed.
pub async fn billing(
  State(app): State<Arc<AppState>>,
  ClientAddr(client): ClientAddr,
  headers: HeaderMap,
  body: Bytes,
) -> Result<(RateLimitHeaders, Json<Value>)> {
  let now = utils::now();
  let limits =
    app.limiter().allow(Endpoint::Webhook, &client, utils::unix(now)).await?;

  let signature = headers
    .get(SIGNATURE_HEADER)
    .and_then(|value| value.to_str().ok())
    .ok_or(Webhook::Signature)?;
  app.webhook.verify(&body, signature, utils::unix(now))?;

  let event: Event = json::from_slice(&body)
    .map_err(|err| Error::InvalidRequest(format!("event body: {err}")))?;
  let receipt = app.reconciler().process(&event, now).await?;

  let mut response = json!({ "received": true });
  if receipt.duplicate {
    response["duplicate"] = json!(true);
  }
  Ok((limits, Json(response)))
}
