use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SessionId = Uuid;

/// Credential material handled by the session engine: pairing codes, the
/// shared secret, TOTP key bytes, recovery codes.
///
/// The wrapper exists so none of these can reach a log line, an audit
/// detail string or an error reply by accident: `Debug` prints a fixed
/// marker and the value is only reachable through [Sensitive::reveal].
/// Serialization stays transparent because the secret store and the
/// config file persist the raw value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Deliberately loud name; call sites show up in review.
    pub fn reveal(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_shows_the_value() {
        let code = Sensitive::new("482193".to_owned());
        assert_eq!(format!("{code:?}"), "[redacted]");
        assert_eq!(format!("{:?}", Sensitive::new(vec![1u8, 2, 3])), "[redacted]");
    }

    #[test]
    fn test_serde_is_transparent() {
        let code = Sensitive::new("482193".to_owned());
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"482193\"");
        let back: Sensitive<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }
}
