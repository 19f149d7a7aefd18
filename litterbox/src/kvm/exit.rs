//! Interface to play with guest exits.
use super::GuestContext;
use crate::{package::DomainId, syscall::SyscallClass, Error, Result};
use abyss::{
    kvm::KvmRegs,
    trampoline::{raw_syscall, REDPILL_NR},
};
use num_enum::TryFromPrimitive;
use std::io;

/// Reason of a `KVM_RUN` return (`KVM_EXIT_*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum ExitReason {
    Unknown = 0,
    Exception = 1,
    Io = 2,
    Hypercall = 3,
    Debug = 4,
    Hlt = 5,
    Mmio = 6,
    IrqWindowOpen = 7,
    Shutdown = 8,
    FailEntry = 9,
    Intr = 10,
    InternalError = 17,
}

impl ExitReason {
    /// Decode a raw exit reason. Values the engine does not know are
    /// [`ExitReason::Unknown`].
    pub fn from_raw(raw: u32) -> Self {
        Self::try_from(raw).unwrap_or(Self::Unknown)
    }
}

/// What the guest loop does after an exit was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Run the guest again.
    Resume,
    /// Return to the host with these registers.
    Leave(KvmRegs),
}

/// Register access to a vcpu stopped on an exit.
pub trait VcpuIo {
    /// Run until the next exit and return its raw reason.
    fn run(&mut self) -> io::Result<u32>;
    fn regs(&self) -> io::Result<KvmRegs>;
    fn set_regs(&mut self, regs: &KvmRegs) -> io::Result<()>;
    /// Let the next run proceed after a bounce.
    fn rearm(&mut self) {}
    /// Snapshot of the guest for a fatal report.
    fn context(&self, reason: ExitReason) -> GuestContext;
}

/// Executes system calls on behalf of the guest.
pub trait HostSyscalls {
    /// Issue `nr` and return the raw kernel result.
    fn syscall(&mut self, nr: u64, args: [u64; 6]) -> i64;
}

/// System calls of the calling thread.
pub struct RawSyscalls;

impl HostSyscalls for RawSyscalls {
    fn syscall(&mut self, nr: u64, args: [u64; 6]) -> i64 {
        // The mask check happened in the gate.
        unsafe { raw_syscall(nr, args) }
    }
}

/// Controller that defines action on a guest exit.
pub trait ExitController {
    /// Handle the exit on this controller.
    ///
    /// Returns [`Error::UnhandledExit`] when this controller does not handle
    /// `reason`.
    fn handle<V: VcpuIo>(&mut self, reason: ExitReason, vcpu: &mut V) -> Result<ExitAction>;
}

impl ExitController for () {
    fn handle<V: VcpuIo>(&mut self, reason: ExitReason, _vcpu: &mut V) -> Result<ExitAction> {
        Err(Error::UnhandledExit(reason))
    }
}

impl<A: ExitController, B: ExitController> ExitController for (A, B) {
    fn handle<V: VcpuIo>(&mut self, reason: ExitReason, vcpu: &mut V) -> Result<ExitAction> {
        let (a, b) = self;
        match a.handle(reason, vcpu) {
            Err(Error::UnhandledExit(reason)) => b.handle(reason, vcpu),
            r => r,
        }
    }
}

/// Turns a guest `syscall` into a host one.
///
/// LSTAR points to a `hlt` stub, so a guest system call stops the vcpu with
/// rip right after the stub's `hlt`, the number in rax, the arguments in
/// rdi, rsi, rdx, r10, r8, r9 and the return address in rcx. The redpill
/// number leaves guest mode instead.
pub struct SyscallGate<H: HostSyscalls> {
    pub domain: DomainId,
    pub mask: SyscallClass,
    /// Guest address of the stub.
    pub stub: u64,
    pub host: H,
}

impl<H: HostSyscalls> SyscallGate<H> {
    fn sysret(regs: &mut KvmRegs) {
        regs.rip = regs.rcx;
        regs.rflags = regs.r11;
    }
}

impl<H: HostSyscalls> ExitController for SyscallGate<H> {
    fn handle<V: VcpuIo>(&mut self, reason: ExitReason, vcpu: &mut V) -> Result<ExitAction> {
        if reason != ExitReason::Hlt {
            return Err(Error::UnhandledExit(reason));
        }
        let mut regs = vcpu.regs()?;
        if regs.rip != self.stub + 1 {
            return Err(Error::UnhandledExit(reason));
        }
        Self::sysret(&mut regs);
        if regs.rax == REDPILL_NR {
            regs.rax = 0;
            return Ok(ExitAction::Leave(regs));
        }
        let nr = regs.rax;
        if !crate::syscall::allowed(self.mask, nr) {
            return Err(Error::SyscallDenied {
                domain: self.domain,
                nr,
            });
        }
        let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
        regs.rax = self.host.syscall(nr, args) as u64;
        vcpu.set_regs(&regs)?;
        Ok(ExitAction::Resume)
    }
}

/// Re-enters after interrupt windows and signal bounces.
pub struct Rearm;

impl ExitController for Rearm {
    fn handle<V: VcpuIo>(&mut self, reason: ExitReason, vcpu: &mut V) -> Result<ExitAction> {
        match reason {
            ExitReason::IrqWindowOpen | ExitReason::Intr => {
                vcpu.rearm();
                Ok(ExitAction::Resume)
            }
            _ => Err(Error::UnhandledExit(reason)),
        }
    }
}

/// Run `vcpu` until a controller asks to leave.
///
/// A run interrupted by a signal is an [`ExitReason::Intr`] exit. An exit no
/// controller handles becomes [`Error::FatalExit`] with the guest context.
pub fn guest_loop<V: VcpuIo, C: ExitController>(vcpu: &mut V, controller: &mut C) -> Result<KvmRegs> {
    loop {
        let reason = match vcpu.run() {
            Ok(raw) => ExitReason::from_raw(raw),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ExitReason::Intr,
            Err(e) => return Err(e.into()),
        };
        match controller.handle(reason, vcpu) {
            Ok(ExitAction::Resume) => continue,
            Ok(ExitAction::Leave(regs)) => return Ok(regs),
            Err(Error::UnhandledExit(reason)) => {
                return Err(Error::FatalExit {
                    reason,
                    context: Box::new(vcpu.context(reason)),
                })
            }
            Err(e) => return Err(e),
        }
    }
}
