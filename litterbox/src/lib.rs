//! LitterBox: language-level isolation of packages inside one process.
//!
//! A program is split into packages, and every sandboxed call runs in a
//! domain that sees only some of them, with some of its system calls. The
//! engine turns the package and domain lists emitted at build time into
//! hardware enforcement with one of two backends:
//!
//! - [`pkey`]: packages that every domain sees alike share a protection key,
//!   and entering a domain is a single PKRU write.
//! - [`kvm`]: every domain is a VM whose page tables hold only what the
//!   domain may touch. Threads slip into the guest through a faulting
//!   `cli` and back out through a reserved system call.
//!
//! A [`Baseline`](backend::Baseline) backend does the bookkeeping without
//! enforcing anything.
//!
//! ## Layout
//! The memory model is built bottom-up:
//!
//! 1. [`interval`]: canonical lists of page ranges with a protection.
//! 2. [`free_space`]: the guest physical window and its best-fit allocator.
//! 3. [`page_table`]: arena backed 4-level page tables and their walker.
//! 4. [`address_space`]: regions of a domain, materialized into page tables.
//!
//! [`engine`] holds the packages and domains, and [`backend`] exposes the
//! operations the instrumented program calls at every boundary.
//!
//! ## Errors
//! Every failure is a [`Error`]. The plain facade operations abort the
//! process through [`fatal`]; the `try_` forms hand the error back.
//!
//! ## Logging
//! The engine emits [`tracing`] events and never installs a subscriber.

pub mod address_space;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod free_space;
pub mod interval;
pub mod kvm;
pub mod package;
pub mod page_table;
pub mod pkey;
pub mod prot;
pub mod section;
pub mod syscall;

pub use backend::{Backend, Litterbox};
pub use config::Config;
pub use error::{fatal, Error, Result};
