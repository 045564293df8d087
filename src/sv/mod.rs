pub mod events;
pub mod license;
pub mod machine;
pub mod usage;
pub mod user;

pub use events::Events;
pub use license::{Anchor, Change, License, NewLicense, Standing};
pub use machine::{Device, Machine, Rules, Transition};
pub use usage::Usage;
pub use user::User;
