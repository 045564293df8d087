//! Request extractors with the crate's error envelope

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
  extract::{
    ConnectInfo, FromRequest, FromRequestParts, Request,
    rejection::JsonRejection,
  },
  http::{header::AUTHORIZATION, request::Parts},
  response::{IntoResponse, Response},
};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::{prelude::*, state::AppState};

/// `axum::Json` whose rejection renders as `INVALID_REQUEST`.
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
  axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
  S: Send + Sync,
{
  type Rejection = Error;

  async fn from_request(req: Request, state: &S) -> Result<Self> {
    match axum::Json::<T>::from_request(req, state).await {
      Ok(axum::Json(value)) => Ok(Json(value)),
      Err(rejection) => Err(Error::InvalidRequest(rejection.body_text())),
    }
  }
}

impl<T: Serialize> IntoResponse for Json<T> {
  fn into_response(self) -> Response {
    axum::Json(self.0).into_response()
  }
}

/// Client address used as the rate-limit key: the peer address, or the
/// first `X-Forwarded-For` hop when the deployment trusts its proxy.
pub struct ClientAddr(pub String);

impl FromRequestParts<Arc<AppState>> for ClientAddr {
  type Rejection = Infallible;

  async fn from_request_parts(
    parts: &mut Parts,
    app: &Arc<AppState>,
  ) -> Result<Self, Self::Rejection> {
    let forwarded = app
      .config
      .trust_proxy
      .then(|| parts.headers.get("x-forwarded-for"))
      .flatten()
      .and_then(|value| value.to_str().ok())
      .and_then(|value| value.split(',').next())
      .map(str::trim)
      .filter(|value| !value.is_empty());

    if let Some(addr) = forwarded {
      return Ok(Self(addr.to_string()));
    }

    let peer = parts
      .extensions
      .get::<ConnectInfo<SocketAddr>>()
      .map(|ConnectInfo(addr)| addr.ip().to_string());
    Ok(Self(peer.unwrap_or_else(|| "unknown".into())))
  }
}

/// Bearer-token guard for the admin routes.
pub struct Admin;

impl FromRequestParts<Arc<AppState>> for Admin {
  type Rejection = Error;

  async fn from_request_parts(
    parts: &mut Parts,
    app: &Arc<AppState>,
  ) -> Result<Self> {
    let expected = app.admin_key.as_deref().ok_or(Error::Unauthorized)?;
    let provided = parts
      .headers
      .get(AUTHORIZATION)
      .and_then(|value| value.to_str().ok())
      .and_then(|value| value.strip_prefix("Bearer "))
      .ok_or(Error::Unauthorized)?;

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
      Ok(Admin)
    } else {
      warn!("Admin request with a wrong key");
      Err(Error::Unauthorized)
    }
  }
}
