//! The abyss of the isolation engine that talks to the hardware.
//!
//! This crate contains the unsafe boundary of the engine: the KVM ABI,
//! protection-key registers, raw signal contexts and host memory mappings.
//! Everything above it is written against typed, mostly safe wrappers.

#![allow(clippy::missing_safety_doc)]

pub mod addressing;
pub mod kvm;
pub mod mm;
pub mod signal;
pub mod trampoline;
pub mod x86_64;
