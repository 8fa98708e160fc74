pub mod audit;
pub mod auth;
pub mod encoder;
pub mod events;
pub mod files;
pub mod input;
pub mod platform;
pub mod recordings;
pub mod screen;
pub mod server;
pub mod services;
pub mod state;
pub mod system;

pub use events::ServerEvent;
pub use server::RemoteServer;
pub use services::Services;
pub use state::{SessionHandle, SessionState, State};
