mod admin;
mod extract;
mod license;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
  Router,
  routing::{get, post},
};
use tower::ServiceBuilder;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

use crate::{prelude::*, state::AppState};

/// API routes. The per-endpoint budgets are enforced inside the handlers;
/// admin routes only exist when an admin key is configured.
pub fn router(app: Arc<AppState>) -> Router {
  let mut router = Router::new()
    .route("/health", get(admin::health))
    .route("/v1/license/validate", post(license::validate))
    .route("/v1/license/activate", post(license::activate))
    .route("/v1/license/deactivate", post(license::deactivate))
    .route("/v1/webhooks/billing", post(webhook::billing));

  if app.admin_key.is_some() {
    router = router.route("/v1/admin/licenses/{key}", get(admin::license));
  }

  router
    .layer(
      ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
          .allow_origin(Any)
          .allow_methods(Any)
          .allow_headers(Any),
      ),
    )
    .with_state(app)
}

pub struct Plugin;

#[async_trait]
impl super::Plugin for Plugin {
  async fn start(&self, app: Arc<AppState>) -> anyhow::Result<()> {
    // coarse per-IP burst guard in front of the per-endpoint windows
    let governor_conf = Arc::new(
      GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(100)
        .finish()
        .context("Failed to build rate limiter config")?,
    );

    let limiter = governor_conf.limiter().clone();

    let router = router(app)
      .layer(GovernorLayer::new(governor_conf))
      .into_make_service_with_connect_info::<SocketAddr>();

    let port: u16 =
      std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
      .await
      .with_context(|| format!("Failed to bind {addr}"))?;
    info!("HTTP Server listening on {addr}");

    let limiter = async {
      loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        limiter.retain_recent();
      }
    };

    let server = async {
      axum::serve(listener, router).await.context("Axum server error")
    };

    tokio::select! {
      result = server => {
        match &result {
          Ok(_) => info!("Server stopped gracefully"),
          Err(err) => error!("Server stopped with error: {err}"),
        }
        result
      }
      _ = limiter => {
        error!("Rate limiter cleaner stopped unexpectedly!");
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
  };
  use json::{Value, json};
  use tokio_test::assert_ok;
  use tower::ServiceExt;

  use super::*;
  use crate::{
    config::{Budget, Config},
    entity::{LicenseStatus, Plan, license as license_entity},
    keys,
    sign::{self, blob, webhook::sign_header},
    state::testing,
    sv,
  };

  async fn send(
    app: &Arc<AppState>,
    request: Request<Body>,
  ) -> (StatusCode, Value) {
    let response: Response =
      router(app.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes =
      axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
      Value::Null
    } else {
      json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
  }

  fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
      .header(header::CONTENT_TYPE, "application/json")
      .body(Body::from(body.to_string()))
      .unwrap()
  }

  async fn license(app: &AppState, plan: Plan) -> license_entity::Model {
    let end = utils::now() + TimeDelta::days(30);
    sv::testing::license(&app.db, plan, LicenseStatus::Active, end).await
  }

  fn validate(key: &str, seed: &str) -> Request<Body> {
    post(
      "/v1/license/validate",
      json!({
        "license_key": key,
        "machine_id": keys::machine_id(seed),
        "cli_version": "1.4.0",
      }),
    )
  }

  fn activate(key: &str, seed: &str) -> Request<Body> {
    post(
      "/v1/license/activate",
      json!({
        "license_key": key,
        "machine_fingerprint": keys::machine_id(seed),
        "machine_name": seed,
      }),
    )
  }

  #[tokio::test]
  async fn validate_issues_verifiable_artifacts() {
    let app = testing::app().await;
    let license = license(&app, Plan::Pro).await;

    let response =
      router(app.clone()).oneshot(validate(&license.key, "m1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "60");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "59");

    let bytes =
      axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = json::from_slice(&bytes).unwrap();
    assert_eq!(body["valid"], true);
    assert_eq!(body["plan"], "pro");
    assert_eq!(body["usage"]["machines_used"], 1);
    assert_eq!(body["usage"]["machines_limit"], 3);
    assert!(body["lease_token"].is_string());
    assert!(body.get("warning").is_none());

    let blob = body["license_blob"].as_str().unwrap();
    let payload = assert_ok!(blob::verify(
      blob,
      &app.signer.verifying_key(),
      utils::unix(utils::now()),
    ));
    assert_eq!(payload.license_key, license.key);
    assert_eq!(payload.machine, utils::truncate_id(&keys::machine_id("m1")));

    let issuer = app.lease.as_ref().unwrap();
    let token = body["lease_token"].as_str().unwrap();
    let claims = assert_ok!(issuer.verify(token));
    assert_eq!(claims.mid, payload.machine);
  }

  #[tokio::test]
  async fn fourth_machine_is_rejected_without_mutation() {
    let app = testing::app().await;
    let license = license(&app, Plan::Pro).await;

    for seed in ["m1", "m2", "m3"] {
      let (status, body) = send(&app, activate(&license.key, seed)).await;
      assert_eq!(status, StatusCode::OK, "{body}");
      assert_eq!(body["activated"], true);
    }

    let (status, body) = send(&app, validate(&license.key, "m4")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "MACHINE_LIMIT_EXCEEDED");
    assert_eq!(body["details"]["machines_limit"], 3);

    let listed = body["details"]["active_machines"].as_array().unwrap();
    assert_eq!(listed.len(), 3);
    for id in listed {
      let id = id.as_str().unwrap();
      assert_eq!(id.chars().count(), 9);
      assert!(id.ends_with('…'));
    }

    assert_eq!(app.sv().machine.active_count(license.id).await.unwrap(), 3);
  }

  /// Binds `count` devices directly, as if they were first seen at `at`.
  async fn seed(
    app: &AppState,
    license: &license_entity::Model,
    count: usize,
    at: DateTime,
  ) {
    let rules = app.rules(license.plan);
    for i in 0..count {
      let device = sv::Device {
        machine_id: keys::machine_id(&format!("seeded{i}")),
        ..Default::default()
      };
      app.sv().machine.bind(license, &device, &rules, at).await.unwrap();
    }
  }

  #[tokio::test]
  async fn elevated_activity_is_a_warning() {
    let app = testing::app().await;
    let license = license(&app, Plan::Team).await;

    for seed in ["m1", "m2"] {
      let (status, body) = send(&app, validate(&license.key, seed)).await;
      assert_eq!(status, StatusCode::OK);
      assert!(body.get("warning").is_none(), "{body}");
    }

    // third device first seen within a day
    let (status, body) = send(&app, validate(&license.key, "m3")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["valid"], true);
    let warning = body["warning"].as_str().unwrap();
    assert!(warning.contains("3 new"), "{warning}");
    assert_eq!(body["usage"]["machines_used"], 3);
  }

  #[tokio::test]
  async fn device_burst_is_rejected_before_binding() {
    let app = testing::app().await;
    let license = license(&app, Plan::Enterprise).await;

    for i in 0..5 {
      let (status, _) =
        send(&app, validate(&license.key, &format!("m{i}"))).await;
      assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(&app, validate(&license.key, "m5")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "ABUSE_DETECTED");
    assert!(body["message"].as_str().unwrap().contains("6 new devices"));
    let hint = body["details"]["hint"].as_str().unwrap();
    assert!(hint.contains(crate::limits::MACHINE_ID_ENV));

    let sv = app.sv();
    let now = utils::now();
    assert_eq!(sv.machine.active_count(license.id).await.unwrap(), 5);
    assert_eq!(sv.usage.monthly_changes(license.id, now).await.unwrap(), 5);
    assert!(matches!(
      sv.machine.binding(license.id, &keys::machine_id("m5")).await.unwrap(),
      sv::machine::Binding::Unknown
    ));

    // known devices keep working
    let (status, _) = send(&app, validate(&license.key, "m0")).await;
    assert_eq!(status, StatusCode::OK);
  }

  #[tokio::test]
  async fn sharing_is_rejected_with_guidance() {
    let app = testing::app().await;
    let license = license(&app, Plan::Enterprise).await;
    seed(&app, &license, 10, utils::now() - TimeDelta::days(3)).await;

    let (status, body) = send(&app, validate(&license.key, "m11")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "ABUSE_DETECTED");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("11 devices in the last 7 days"), "{message}");
    assert!(message.contains(crate::limits::MACHINE_ID_ENV));
    assert_eq!(app.sv().machine.active_count(license.id).await.unwrap(), 10);
  }

  #[tokio::test]
  async fn downgrade_keeps_known_machines_usable() {
    let app = testing::app().await;
    let license = license(&app, Plan::Enterprise).await;
    seed(&app, &license, 7, utils::now() - TimeDelta::days(60)).await;

    let sv = app.sv();
    sv.machine.reset_all(license.id, utils::now()).await.unwrap();
    let license = sv
      .license
      .apply(license, sv::Change {
        plan: Some(Plan::Team),
        ..Default::default()
      })
      .await
      .unwrap();

    for i in 0..7 {
      let request = post(
        "/v1/license/validate",
        json!({
          "license_key": license.key,
          "machine_id": keys::machine_id(&format!("seeded{i}")),
        }),
      );
      let (status, body) = send(&app, request).await;
      assert_eq!(status, StatusCode::OK, "machine {i}: {body}");
    }

    assert_eq!(sv.machine.active_count(license.id).await.unwrap(), 7);
    let now = utils::now();
    assert_eq!(sv.usage.monthly_changes(license.id, now).await.unwrap(), 7);
  }

  #[tokio::test]
  async fn deactivation_frees_a_slot() {
    let app = testing::app().await;
    let license = license(&app, Plan::Free).await;

    let (status, _) = send(&app, activate(&license.key, "m1")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, activate(&license.key, "m2")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
      &app,
      post(
        "/v1/license/deactivate",
        json!({
          "license_key": license.key,
          "machine_fingerprint": keys::machine_id("m1"),
        }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "deactivated": true, "machines_remaining": 0 }));

    let (status, body) = send(&app, activate(&license.key, "m2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["machines_used"], 1);
  }

  #[tokio::test]
  async fn malformed_input_is_rejected_early() {
    let app = testing::app().await;

    let (status, body) = send(&app, validate("NOT-A-KEY", "m1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_LICENSE_KEY");

    let key = keys::generate_license_key();
    let (status, body) = send(
      &app,
      post(
        "/v1/license/validate",
        json!({ "license_key": key, "machine_id": "xyz" }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_MACHINE_ID");

    let (status, body) =
      send(&app, post("/v1/license/validate", json!({ "license_key": key })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert!(body["message"].as_str().unwrap().contains("machine_id"));

    let (status, body) = send(&app, validate(&key, "m1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "LICENSE_NOT_FOUND");
  }

  #[tokio::test]
  async fn lapsed_license_is_expired_on_validate() {
    let app = testing::app().await;
    let end = utils::now() - TimeDelta::days(8);
    let license =
      sv::testing::license(&app.db, Plan::Pro, LicenseStatus::Active, end).await;

    let (status, body) = send(&app, validate(&license.key, "m1")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "LICENSE_EXPIRED");

    let stored = app.sv().license.by_key(&license.key).await.unwrap().unwrap();
    assert_eq!(stored.status, LicenseStatus::Expired);
  }

  #[tokio::test]
  async fn grace_shortens_cache_window() {
    let app = testing::app().await;
    let end = utils::now() - TimeDelta::days(6) - TimeDelta::hours(23);
    let license =
      sv::testing::license(&app.db, Plan::Pro, LicenseStatus::Active, end).await;

    let (status, body) = send(&app, validate(&license.key, "m1")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(
      body["cache_until"],
      utils::rfc3339(end + app.config.grace_period)
    );
  }

  #[tokio::test]
  async fn machine_signature_is_checked() {
    let app = testing::app().await;
    let license = license(&app, Plan::Pro).await;
    let machine = keys::machine_id("m1");
    let ts = utils::unix(utils::now());

    let signed = |signature: String| {
      post(
        "/v1/license/validate",
        json!({
          "license_key": license.key,
          "machine_id": machine,
          "machine_signature": signature,
          "timestamp": ts,
        }),
      )
    };

    let good = sign::hmac_hex(
      testing::MACHINE_SECRET,
      format!("{machine}:{ts}").as_bytes(),
    );
    let (status, _) = send(&app, signed(good)).await;
    assert_eq!(status, StatusCode::OK);

    let bad = sign::hmac_hex("other", format!("{machine}:{ts}").as_bytes());
    let (status, body) = send(&app, signed(bad)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "MACHINE_SIGNATURE_INVALID");
  }

  #[tokio::test]
  async fn budgets_are_per_endpoint() {
    let db = sv::testing::db().await;
    let mut config = testing::config();
    config.rate_limits.validate = Budget::per_minute(2);
    config.trust_proxy = true;
    let app = Arc::new(AppState::with_db(db, config, testing::secrets()));
    let license = license(&app, Plan::Pro).await;

    for _ in 0..2 {
      let (status, _) = send(&app, validate(&license.key, "m1")).await;
      assert_eq!(status, StatusCode::OK);
    }

    let response =
      router(app.clone()).oneshot(validate(&license.key, "m1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

    // another client address has its own window
    let mut request = validate(&license.key, "m1");
    request
      .headers_mut()
      .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, activate(&license.key, "m1")).await;
    assert_eq!(status, StatusCode::OK);
  }

  #[tokio::test]
  async fn forwarded_for_is_ignored_without_trusted_proxy() {
    let db = sv::testing::db().await;
    let mut config = testing::config();
    config.rate_limits.validate = Budget::per_minute(1);
    let app = Arc::new(AppState::with_db(db, config, testing::secrets()));
    let license = license(&app, Plan::Pro).await;

    for (i, hop) in ["198.51.100.1", "198.51.100.2"].into_iter().enumerate() {
      let mut request = validate(&license.key, "m1");
      request.headers_mut().insert("x-forwarded-for", hop.parse().unwrap());
      let (status, _) = send(&app, request).await;
      let expected =
        if i == 0 { StatusCode::OK } else { StatusCode::TOO_MANY_REQUESTS };
      assert_eq!(status, expected, "{hop}");
    }
  }

  fn signed_event(body: &Value) -> Request<Body> {
    let raw = body.to_string();
    let header = sign_header(
      testing::WEBHOOK_SECRET,
      raw.as_bytes(),
      utils::unix(utils::now()),
    );
    Request::post("/v1/webhooks/billing")
      .header(webhook::SIGNATURE_HEADER, header)
      .body(Body::from(raw))
      .unwrap()
  }

  #[tokio::test]
  async fn webhook_replays_are_acknowledged_once() {
    let app = testing::app().await;
    let checkout = json!({
      "id": "evt_1",
      "type": "checkout.session.completed",
      "data": { "object": {
        "id": "cs_1",
        "mode": "payment",
        "customer": "cus_1",
        "customer_email": "dev@example.com",
        "metadata": { "plan": "pro" },
      }},
    });

    let (status, body) = send(&app, signed_event(&checkout)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));

    for _ in 0..2 {
      let (status, body) = send(&app, signed_event(&checkout)).await;
      assert_eq!(status, StatusCode::OK);
      assert_eq!(body, json!({ "received": true, "duplicate": true }));
    }

    let licenses = license_entity::Entity::find().all(&app.db).await.unwrap();
    assert_eq!(licenses.len(), 1);
  }

  #[tokio::test]
  async fn webhook_signature_and_retry_statuses() {
    let app = testing::app().await;
    let event = json!({
      "id": "evt_9",
      "type": "customer.subscription.created",
      "data": { "object": {
        "id": "sub_9",
        "customer": "cus_unknown",
        "status": "active",
        "current_period_start": 1_767_225_600,
        "current_period_end": 1_769_904_000,
        "items": { "data": [{ "price": { "id": "price_pro" } }] },
      }},
    });

    let unsigned = Request::post("/v1/webhooks/billing")
      .body(Body::from(event.to_string()))
      .unwrap();
    let (status, body) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "WEBHOOK_SIGNATURE_INVALID");

    let mut forged = signed_event(&event);
    *forged.body_mut() = Body::from(event.to_string().replace("sub_9", "sub_0"));
    let (status, _) = send(&app, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, signed_event(&event)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error_code"], "WEBHOOK_RETRY");
  }

  #[tokio::test]
  async fn admin_view_requires_key() {
    let app = testing::app().await;
    let license = license(&app, Plan::Team).await;
    send(&app, activate(&license.key, "m1")).await;

    let uri = format!("/v1/admin/licenses/{}", license.key);
    let (status, _) =
      send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::get(&uri)
      .header(header::AUTHORIZATION, format!("Bearer {}", testing::ADMIN_KEY))
      .body(Body::empty())
      .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "team");
    assert_eq!(body["changes_this_month"], 1);
    assert_eq!(
      body["machines"][0]["machine"],
      utils::truncate_id(&keys::machine_id("m1"))
    );

    let mut secrets = testing::secrets();
    secrets.admin_key = None;
    let closed = Arc::new(AppState::with_db(
      sv::testing::db().await,
      Config::default(),
      secrets,
    ));
    let (status, _) =
      send(&closed, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) =
      send(&closed, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
  }
}
