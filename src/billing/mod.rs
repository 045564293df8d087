//! Billing-provider event reconciliation

pub mod event;
pub mod reconciler;

pub use event::Event;
pub use reconciler::Reconciler;
