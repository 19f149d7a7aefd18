//! Model-specific register (MSR) indices loaded into a guest vcpu.
//!
//! The host process runs in ring 3 and can never touch these registers itself;
//! they only travel through the hypervisor's `KVM_SET_MSRS`.

/// Extended feature enable register.
pub const IA32_EFER: u32 = 0xc000_0080;
/// Segment selectors loaded by `syscall` and `sysret`.
pub const IA32_STAR: u32 = 0xc000_0081;
/// Target rip of the 64-bit `syscall` instruction.
pub const IA32_LSTAR: u32 = 0xc000_0082;
/// Target rip of the compatibility-mode `syscall` instruction.
pub const IA32_CSTAR: u32 = 0xc000_0083;
/// Rflags bits cleared by `syscall`.
pub const IA32_FMASK: u32 = 0xc000_0084;
/// Base of the fs segment.
pub const IA32_FS_BASE: u32 = 0xc000_0100;
/// Base of the gs segment.
pub const IA32_GS_BASE: u32 = 0xc000_0101;
/// Base swapped in by `swapgs`.
pub const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
/// Page attribute table.
pub const IA32_PAT: u32 = 0x0000_0277;

/// MSR entry as consumed by `KVM_SET_MSRS`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsrEntry {
    /// MSR index
    pub index: u32,
    #[doc(hidden)]
    pub _rsv: u32,
    /// MSR value
    pub data: u64,
}

impl MsrEntry {
    /// Create a new entry.
    pub const fn new(index: u32, data: u64) -> Self {
        Self {
            index,
            _rsv: 0,
            data,
        }
    }
}
