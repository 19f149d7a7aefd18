//! Hardware virtualization backend.
//!
//! Every domain gets a VM whose page tables are the domain's address space.
//! Threads move between host and guest mode through the bluepill and
//! redpill trampolines; inside the guest, system calls trap to a `hlt` stub
//! and are replayed on the host after a mask check. Every other exit is
//! fatal.
mod backend;
mod context;
mod exit;
mod machine;
mod vcpu;

pub use backend::{KvmBackend, LiveSpace, Spaces};
pub use context::{GuestContext, MAX_INSN_LEN};
pub use exit::{
    guest_loop, ExitAction, ExitController, ExitReason, HostSyscalls, RawSyscalls, Rearm,
    SyscallGate, VcpuIo,
};
pub use machine::{guest_sregs, GuestMemory, Machine};
pub use vcpu::{in_guest, with_host, Vcpu, VcpuState};
