use std::future::Future;

use chrono::NaiveDate;
use sea_orm::{DbErr, SqlErr};

use crate::prelude::*;

pub fn now() -> DateTime {
  Utc::now().naive_utc()
}

pub fn rfc3339(date: DateTime) -> String {
  date.and_utc().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn unix(date: DateTime) -> i64 {
  date.and_utc().timestamp()
}

pub fn from_unix(secs: i64) -> Option<DateTime> {
  chrono::DateTime::from_timestamp(secs, 0).map(|date| date.naive_utc())
}

/// Sentinel period end of lifetime licenses.
pub fn lifetime_end() -> DateTime {
  NaiveDate::from_ymd_opt(9999, 12, 31)
    .and_then(|date| date.and_hms_opt(23, 59, 59))
    .unwrap_or(DateTime::MAX)
}

pub fn is_lifetime(date: DateTime) -> bool {
  date >= lifetime_end()
}

/// First instant of the calendar month containing `now` (UTC).
pub fn month_start(now: DateTime) -> DateTime {
  now
    .date()
    .with_day(1)
    .and_then(|date| date.and_hms_opt(0, 0, 0))
    .unwrap_or(now)
}

/// First instant of the following calendar month (UTC).
pub fn next_month_start(now: DateTime) -> DateTime {
  let (year, month) = match now.month() {
    12 => (now.year() + 1, 1),
    month => (now.year(), month + 1),
  };
  NaiveDate::from_ymd_opt(year, month, 1)
    .and_then(|date| date.and_hms_opt(0, 0, 0))
    .unwrap_or(now)
}

/// Public form of a machine or license identifier: 8 chars + ellipsis.
pub fn truncate_id(id: &str) -> String {
  let head: String = id.chars().take(8).collect();
  format!("{head}…")
}

pub fn is_unique_violation(err: &DbErr) -> bool {
  matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Runs non-essential work off the request path. The caller never awaits it
/// and a failure only reaches the log.
pub fn detach<F>(label: &'static str, work: F)
where
  F: Future<Output = Result<()>> + Send + 'static,
{
  tokio::spawn(async move {
    if let Err(err) = work.await {
      warn!("Detached task `{label}` failed: {err}");
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime {
    NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
  }

  #[test]
  fn month_bounds() {
    assert_eq!(month_start(at(2026, 3, 17, 9)), at(2026, 3, 1, 0));
    assert_eq!(next_month_start(at(2026, 3, 17, 9)), at(2026, 4, 1, 0));
    assert_eq!(next_month_start(at(2026, 12, 31, 23)), at(2027, 1, 1, 0));
  }

  #[test]
  fn truncation_never_leaks_full_id() {
    let id = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    assert_eq!(truncate_id(id), "01234567…");
    assert_eq!(truncate_id("abc"), "abc…");
  }

  #[test]
  fn lifetime_sentinel() {
    assert!(is_lifetime(lifetime_end()));
    assert!(!is_lifetime(at(2099, 1, 1, 0)));
    assert_eq!(from_unix(unix(at(2026, 5, 1, 12))), Some(at(2026, 5, 1, 12)));
  }
}
