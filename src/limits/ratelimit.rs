//! Fixed-window request throttle keyed by endpoint and client address
//!
//! One read and one write against the [`KvStore`] per call. The write is
//! best-effort: concurrent callers may overwrite each other's increment,
//! which only makes the limit slightly looser.

use std::convert::Infallible;

use axum::{
  http::{HeaderMap, HeaderValue},
  response::{IntoResponseParts, ResponseParts},
};

use super::KvStore;
use crate::{
  config::{Budget, RateLimits},
  prelude::*,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
  Validate,
  Activate,
  Deactivate,
  Webhook,
}

impl Endpoint {
  pub fn as_str(self) -> &'static str {
    match self {
      Endpoint::Validate => "validate",
      Endpoint::Activate => "activate",
      Endpoint::Deactivate => "deactivate",
      Endpoint::Webhook => "webhook",
    }
  }

  fn budget(self, limits: &RateLimits) -> Budget {
    match self {
      Endpoint::Validate => limits.validate,
      Endpoint::Activate => limits.activate,
      Endpoint::Deactivate => limits.deactivate,
      Endpoint::Webhook => limits.webhook,
    }
  }
}

/// `X-RateLimit-*` values attached to every throttled response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
  pub limit: u32,
  pub remaining: u32,
  /// Unix seconds at which the current window closes.
  pub reset: i64,
}

impl RateLimitHeaders {
  pub fn write(&self, headers: &mut HeaderMap) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset));
  }
}

impl IntoResponseParts for RateLimitHeaders {
  type Error = Infallible;

  fn into_response_parts(
    self,
    mut res: ResponseParts,
  ) -> Result<ResponseParts, Self::Error> {
    self.write(res.headers_mut());
    Ok(res)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
  count: u32,
  reset: i64,
}

impl Window {
  fn parse(raw: &str) -> Option<Self> {
    let (count, reset) = raw.split_once(':')?;
    Some(Self { count: count.parse().ok()?, reset: reset.parse().ok()? })
  }

  fn encode(&self) -> String {
    format!("{}:{}", self.count, self.reset)
  }
}

pub struct RateLimiter<'a> {
  kv: &'a dyn KvStore,
  limits: &'a RateLimits,
}

impl<'a> RateLimiter<'a> {
  pub fn new(kv: &'a dyn KvStore, limits: &'a RateLimits) -> Self {
    Self { kv, limits }
  }

  pub async fn allow(
    &self,
    endpoint: Endpoint,
    client: &str,
    now: i64,
  ) -> Result<RateLimitHeaders> {
    let budget = endpoint.budget(self.limits);
    let key = format!("rl:{}:{}", endpoint.as_str(), client);
    let window_secs = budget.window.as_secs() as i64;

    let current = match self.kv.get(&key).await {
      Ok(raw) => raw.as_deref().and_then(Window::parse),
      Err(err) => {
        // fail open: a store outage must not lock out paying users
        warn!(endpoint = endpoint.as_str(), "Rate limit read failed: {err}");
        return Ok(RateLimitHeaders {
          limit: budget.requests,
          remaining: budget.requests,
          reset: now + window_secs,
        });
      }
    };

    let window = match current.filter(|window| window.reset > now) {
      None => Window { count: 1, reset: now + window_secs },
      Some(window) if window.count >= budget.requests => {
        debug!(endpoint = endpoint.as_str(), client, "Rate limited");
        return Err(Error::RateLimited {
          headers: RateLimitHeaders {
            limit: budget.requests,
            remaining: 0,
            reset: window.reset,
          },
          retry_after: (window.reset - now).max(1) as u64,
        });
      }
      Some(window) => Window { count: window.count + 1, ..window },
    };

    let ttl = Duration::from_secs((window.reset - now).max(0) as u64)
      + self.limits.ttl_buffer;
    if let Err(err) = self.kv.put(&key, window.encode(), ttl).await {
      warn!(endpoint = endpoint.as_str(), "Rate limit write failed: {err}");
    }

    Ok(RateLimitHeaders {
      limit: budget.requests,
      remaining: budget.requests.saturating_sub(window.count),
      reset: window.reset,
    })
  }
}
