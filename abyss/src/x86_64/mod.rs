//! x86_64 registers a guest domain is set up with.

pub mod intrinsics;
pub mod msr;
pub mod pkru;
pub mod segmentation;

/// Privilege levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring3 = 3,
}

bitflags::bitflags! {
    /// rflags bits the engine touches on entry and in the syscall mask.
    #[repr(transparent)]
    pub struct Rflags: u64 {
        /// Reserved, reads as 1.
        const _1 = 1 << 1;
        /// Single step.
        const TF = 1 << 8;
        /// Interrupt enable. Cleared while the guest runs the bluepill
        /// continuation.
        const IF = 1 << 9;
        /// String direction.
        const DF = 1 << 10;
        /// Alignment check.
        const AC = 1 << 18;
    }
}

bitflags::bitflags! {
    /// Cr0 bits of a paged long mode guest.
    #[repr(transparent)]
    pub struct Cr0: u64 {
        /// Protected mode.
        const PE = 1 << 0;
        /// Monitor co-processor.
        const MP = 1 << 1;
        /// Extension type.
        const ET = 1 << 4;
        /// Native x87 error reporting.
        const NE = 1 << 5;
        /// Ring 0 honours read-only pages.
        const WP = 1 << 16;
        /// Paging.
        const PG = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Cr4 bits of a paged long mode guest.
    #[repr(transparent)]
    pub struct Cr4: u64 {
        /// Physical address extension, required by long mode.
        const PAE = 1 << 5;
        /// fxsave and fxrstor.
        const OSFXSR = 1 << 9;
        /// Unmasked SIMD floating point exceptions.
        const OSXMMEXCPT = 1 << 10;
        /// rdfsbase, rdgsbase, wrfsbase and wrgsbase.
        const FSGSBASE = 1 << 16;
        /// xsave and extended states.
        const OSXSAVE = 1 << 18;
        /// Protection keys for user pages.
        const PKE = 1 << 22;
    }
}

bitflags::bitflags! {
    /// Extended feature enable register (IA32_EFER).
    #[repr(transparent)]
    pub struct Efer: u64 {
        /// syscall and sysret.
        const SCE = 1 << 0;
        /// Long mode enable.
        const LME = 1 << 8;
        /// Long mode active.
        const LMA = 1 << 10;
        /// No-execute pages.
        const NXE = 1 << 11;
    }
}
