use crate::prelude::*;

/// Bounds how often "last seen" writes reach the single-writer store.
#[derive(Debug, Clone, Copy)]
pub struct UsageThrottle {
  interval: TimeDelta,
}

impl UsageThrottle {
  pub fn new(interval: TimeDelta) -> Self {
    Self { interval }
  }

  /// A write is due when nothing was recorded yet, when the recorded stamp
  /// is unusable (ahead of `now`), or when it is older than the interval.
  pub fn should_write(&self, last: Option<DateTime>, now: DateTime) -> bool {
    match last {
      None => true,
      Some(last) if last > now => true,
      Some(last) => now - last >= self.interval,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn writes_at_most_once_per_interval() {
    let throttle = UsageThrottle::new(TimeDelta::hours(1));
    let now = Utc::now().naive_utc();

    assert!(throttle.should_write(None, now));
    assert!(!throttle.should_write(Some(now - TimeDelta::minutes(59)), now));
    assert!(throttle.should_write(Some(now - TimeDelta::hours(1)), now));
    assert!(throttle.should_write(Some(now + TimeDelta::days(3)), now));
  }
}
