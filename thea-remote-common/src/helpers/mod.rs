pub mod fs;
pub mod hash;
pub mod otp;
pub mod rng;
pub mod serde_base64;
