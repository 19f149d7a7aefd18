//! Errors of the isolation engine.
//!
//! Every variant is fatal to the process once it reaches the facade: the
//! engine cannot keep a half-enforced isolation state. Deliberate skips are
//! not errors and never show up here.
use crate::kvm::{ExitReason, GuestContext};
use crate::package::{DomainId, PackageId};
use crate::prot::Prot;

/// Result alias of the engine.
pub type Result<T> = core::result::Result<T, Error>;

/// Possible errors of the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two overlapping areas disagree on their protection.
    #[error("overlapping areas with different protection: [{a_start:#x}, {a_end:#x}) {a_prot:?} vs [{b_start:#x}, {b_end:#x}) {b_prot:?}")]
    InconsistentOverlap {
        a_start: usize,
        a_end: usize,
        a_prot: Prot,
        b_start: usize,
        b_end: usize,
        b_prot: Prot,
    },
    /// An interval list lost its canonical form.
    #[error("interval list is not canonical at {0:#x}")]
    NotCanonical(usize),
    /// The guest-physical window has no free range large enough.
    #[error("out of guest physical memory for {0:#x} bytes")]
    OutOfGuestPhysical(usize),
    /// More key groups than usable hardware keys.
    #[error("{groups} key groups exceed the budget of {budget} protection keys")]
    KeyExhaustion { groups: usize, budget: usize },
    /// A name that no package is bound to.
    #[error("unknown package {0:?}")]
    UnknownPackage(String),
    /// An id that no package carries.
    #[error("unknown package {0}")]
    UnknownPackageId(PackageId),
    /// An id that no domain carries.
    #[error("unknown domain {0}")]
    UnknownDomain(DomainId),
    /// Two packages share an id.
    #[error("duplicate package {0}")]
    DuplicatePackage(PackageId),
    /// Two domains share an id.
    #[error("duplicate domain {0}")]
    DuplicateDomain(DomainId),
    /// A thread entered a domain while already inside one.
    #[error("thread entered {entering} while inside {active}")]
    NestedEntry { active: DomainId, entering: DomainId },
    /// A thread left a domain it is not inside.
    #[error("thread left {leaving} while inside {active:?}")]
    UnbalancedEpilog {
        active: Option<DomainId>,
        leaving: DomainId,
    },
    /// An extent was transferred to the package that already owns it.
    #[error("extent [{start:#x}, +{size:#x}) already belongs to {owner}")]
    SelfTransfer {
        owner: PackageId,
        start: usize,
        size: usize,
    },
    /// An extent that its supposed owner does not track.
    #[error("extent [{start:#x}, +{size:#x}) is not tracked by {owner}")]
    UntrackedExtent {
        owner: PackageId,
        start: usize,
        size: usize,
    },
    /// An address outside every region of an address space.
    #[error("address {0:#x} is not mapped")]
    Unmapped(usize),
    /// An address or size that must be page aligned.
    #[error("{0:#x} is not page aligned")]
    Unaligned(usize),
    /// Section payload that could not be decoded.
    #[error("malformed section payload: {0}")]
    Section(#[from] serde_json::Error),
    /// Host system failure.
    #[error("host failure: {0}")]
    Os(#[from] std::io::Error),
    /// The guest stopped for a reason the engine does not handle.
    #[error("fatal guest exit {reason:?}\n{context}")]
    FatalExit {
        reason: ExitReason,
        context: Box<GuestContext>,
    },
    /// No exit controller took the exit. Turned into [`Error::FatalExit`]
    /// by the guest loop.
    #[error("unhandled guest exit {0:?}")]
    UnhandledExit(ExitReason),
    /// Guest code issued a system call its domain does not allow.
    #[error("{domain} is not allowed to issue system call {nr}")]
    SyscallDenied { domain: DomainId, nr: u64 },
    /// The facade was used before `init`.
    #[error("isolation engine is not initialized")]
    NotInitialized,
    /// A configuration value out of its valid range.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The configured backend is not available on this host.
    #[error("backend unavailable: {0}")]
    Unsupported(&'static str),
}

/// Log `err` and abort the process.
#[cold]
pub fn fatal(err: Error) -> ! {
    tracing::error!(error = %err, "fatal isolation error");
    std::process::abort()
}
