//! Request throttling, write throttling and abuse heuristics

pub mod abuse;
pub mod kv;
pub mod ratelimit;
pub mod throttle;

pub use abuse::{AbuseDetector, DeviceCounts, MACHINE_ID_ENV};
pub use kv::{KvStore, MemoryKv};
pub use ratelimit::{Endpoint, RateLimitHeaders, RateLimiter};
pub use throttle::UsageThrottle;
