use std::time::Duration;

pub(crate) const fn _default_true() -> bool {
    true
}

pub(crate) const fn _default_false() -> bool {
    false
}

#[inline]
pub(crate) fn _default_server_name() -> String {
    "Thea Remote".to_owned()
}

pub(crate) const fn _default_port() -> u16 {
    crate::consts::DEFAULT_PORT
}

pub(crate) const fn _default_max_sessions() -> usize {
    5
}

#[inline]
pub(crate) fn _default_auth_timeout() -> Duration {
    Duration::from_secs(30)
}

#[inline]
pub(crate) fn _default_session_timeout() -> Duration {
    Duration::from_secs(3600)
}

#[inline]
pub(crate) fn _default_pairing_code_validity() -> Duration {
    Duration::from_secs(300)
}

#[inline]
pub(crate) fn _default_confirmation_timeout() -> Duration {
    Duration::from_secs(60)
}

pub(crate) const fn _default_max_file_transfer_size() -> u64 {
    100 * 1024 * 1024
}

pub(crate) const fn _default_audit_retention_days() -> u32 {
    30
}

pub(crate) const fn _default_rate_limit_per_minute() -> usize {
    10
}

pub(crate) const fn _default_max_audit_entries_in_memory() -> usize {
    1000
}
