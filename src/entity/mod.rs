//! SeaORM entity definitions

pub mod license;
pub mod machine;
pub mod processed_event;
pub mod usage_log;
pub mod user;

pub use license::{BillingType, LicenseStatus, Plan};
pub use machine::FingerprintType;
pub use usage_log::UsageAction;
