/// Maximum size of a single wire frame. Anything larger terminates the
/// session.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 9847;

/// HKDF info string binding derived session keys to this protocol.
pub const SESSION_KEY_INFO: &[u8] = b"thea.remote.session";

pub const SECRET_STORE_SERVICE: &str = "app.thea.remote";
pub const SECRET_STORE_TOTP_SERVICE: &str = "app.thea.remote.totp";
pub const SERVER_KEY_ACCOUNT: &str = "thea.remote.server.privatekey";
pub const UNATTENDED_PASSWORD_ACCOUNT: &str = "thea.remote.unattended";

pub const TOTP_ISSUER: &str = "Thea Remote Desktop";

pub const MDNS_SERVICE_TYPE: &str = "_thea-remote._tcp";
pub const MDNS_SERVICE_TYPE_LEGACY: &str = "_thea._tcp";
