mod frame;
mod messages;
mod permissions;

pub use frame::{MessageStream, WireError};
pub use messages::*;
pub use permissions::{required_permission, Permission, RiskLevel};
