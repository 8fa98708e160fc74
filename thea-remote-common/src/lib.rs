mod config;
mod consts;
mod error;
mod eventhub;
mod types;

pub mod crypto;
pub mod helpers;
pub mod tls;

pub use config::*;
pub use consts::*;
pub use error::TheaError;
pub use eventhub::{EventHub, EventSender, EventSubscription};
pub use types::*;
