//! Memory protection key backend.
//!
//! Every group of packages that all domains see alike gets one hardware key.
//! Memory is tagged once at start-up and whenever it changes owner; entering
//! a domain is a single PKRU write.
mod backend;
mod group;

pub use backend::{HostKeys, KeyHardware, MpkBackend};
pub use group::{KeyGroups, ProtectionKeyGroup};
