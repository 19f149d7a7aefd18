//! Virtual CPU implementation.
//!
//! Each thread gets its own vcpu per machine. Guest entry happens inside the
//! SIGSEGV handler: the bluepill `cli` faults, the handler moves the
//! interrupted context into the vcpu and runs it until the guest asks to
//! leave, then writes the guest state back into the context it returns to.
use super::{
    context::MAX_INSN_LEN,
    exit::{guest_loop, ExitReason, Rearm, RawSyscalls, SyscallGate, VcpuIo},
    machine::{guest_sregs, Machine},
    GuestContext,
};
use crate::{fatal, Result};
use abyss::{
    kvm::{KvmFpu, KvmRegs, KvmSregs, KvmXcr, KvmXcrs, KvmXsave, VcpuFd},
    signal::{self, AltStack, PreviousAction, UContext},
    trampoline::{bluepill, redpill, BLUEPILL_MAGIC, CLI_OPCODE},
    x86_64::{
        msr::{self, MsrEntry},
        segmentation::Segment,
        Rflags,
    },
};
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    sync::{Arc, OnceLock},
};

/// Default page attribute table.
const PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;

/// Page-level write-through bit of cr3.
const CR3_PWT: u64 = 1 << 3;

/// Lifecycle of a vcpu. It is destroyed with its thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    /// Registers and page tables are loaded.
    Initialized,
    /// The owning thread runs inside the guest.
    Guest,
    /// The owning thread left the guest.
    Host,
}

/// A vcpu bound to the thread that created it.
pub struct Vcpu {
    machine: Arc<Machine>,
    fd: VcpuFd,
    sregs: KvmSregs,
    state: AtomicCell<VcpuState>,
    /// Memory generation the guest translations were last flushed at.
    generation: u64,
    _alt: AltStack,
}

impl Vcpu {
    pub(super) fn new(machine: Arc<Machine>, fd: VcpuFd) -> Result<Self> {
        fd.set_cpuid2(machine.cpuid())?;
        let sregs = guest_sregs(machine.root()?);
        fd.set_sregs(&sregs)?;
        let fmask = Rflags::IF | Rflags::TF | Rflags::DF | Rflags::AC;
        fd.set_msrs([
            MsrEntry::new(msr::IA32_STAR, (Segment::KernelCode.selector() as u64) << 32),
            MsrEntry::new(msr::IA32_LSTAR, machine.stub()),
            MsrEntry::new(msr::IA32_CSTAR, 0),
            MsrEntry::new(msr::IA32_FMASK, fmask.bits()),
            MsrEntry::new(msr::IA32_KERNEL_GS_BASE, 0),
            MsrEntry::new(msr::IA32_PAT, PAT_DEFAULT),
        ])?;
        if let Some(xcr0) = machine.xcr0() {
            let mut xcrs = KvmXcrs {
                nr_xcrs: 1,
                ..Default::default()
            };
            xcrs.xcrs[0] = KvmXcr {
                xcr: 0,
                reserved: 0,
                value: xcr0,
            };
            fd.set_xcrs(&xcrs)?;
        }
        fd.set_fpu(&KvmFpu::default())?;
        let generation = machine.memory().generation();
        Ok(Self {
            machine,
            fd,
            sregs,
            state: AtomicCell::new(VcpuState::Initialized),
            generation,
            _alt: AltStack::install()?,
        })
    }

    pub fn state(&self) -> VcpuState {
        self.state.load()
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Move the bluepill context `uc` into the guest, run it, and move the
    /// guest state back when it leaves.
    fn enter(&mut self, uc: &mut UContext<'_>) -> Result<()> {
        let mut regs = uc.regs();
        regs.rip += 1;
        regs.rax = 0;
        regs.rflags = (regs.rflags & !Rflags::IF.bits()) | Rflags::_1.bits();

        let mut sregs = self.sregs;
        sregs.fs = Segment::data_with_base(signal::fs_base()?);
        sregs.gs = Segment::data_with_base(signal::gs_base()?);
        {
            // Slots and page tables must not change until the vcpu runs.
            let memory = self.machine.memory();
            if memory.generation() != self.generation {
                // A different cr3 makes the hypervisor drop cached
                // translations of the guest.
                let mut reload = sregs;
                reload.cr3 ^= CR3_PWT;
                self.fd.set_sregs(&reload)?;
                self.generation = memory.generation();
            }
            self.fd.set_sregs(&sregs)?;
            self.fd.set_regs(&regs)?;
            self.load_vector_state(uc)?;
        }

        let domain = self.machine.domain();
        let mut controller = (
            SyscallGate {
                domain: domain.id,
                mask: domain.syscalls,
                stub: self.machine.stub(),
                host: RawSyscalls,
            },
            (Rearm, ()),
        );
        self.state.store(VcpuState::Guest);
        let left = guest_loop(
            &mut GuestIo {
                fd: &mut self.fd,
                machine: &self.machine,
            },
            &mut controller,
        );
        self.state.store(VcpuState::Host);
        let regs = left?;
        self.store_vector_state(uc)?;
        uc.set_regs(&regs);
        Ok(())
    }

    /// Load the x87, vector and extended registers of `uc`.
    fn load_vector_state(&self, uc: &UContext<'_>) -> Result<()> {
        match (uc.xsave(), self.machine.xcr0()) {
            (Some(area), Some(xcr0)) => self.fd.set_xsave(&KvmXsave::from_area(area, xcr0))?,
            _ => self.fd.set_fpu(&uc.fpu())?,
        }
        Ok(())
    }

    /// Hand the x87, vector and extended registers back to `uc`.
    fn store_vector_state(&self, uc: &mut UContext<'_>) -> Result<()> {
        if self.machine.xcr0().is_some() {
            if let Some(area) = uc.xsave_mut() {
                self.fd.get_xsave()?.write_area(area);
                return Ok(());
            }
        }
        uc.set_fpu(&self.fd.get_fpu()?);
        Ok(())
    }
}

/// [`VcpuIo`] over a real vcpu.
struct GuestIo<'a> {
    fd: &'a mut VcpuFd,
    machine: &'a Machine,
}

impl GuestIo<'_> {
    /// Bytes at `rip` when the guest can read them.
    fn code(&self, rip: usize) -> Option<&'static [u8]> {
        let memory = self.machine.try_memory()?;
        let readable = memory.space.valid_address(rip)
            && memory.space.valid_address(rip + MAX_INSN_LEN - 1);
        // Guest virtual addresses are host addresses.
        readable.then(|| unsafe { core::slice::from_raw_parts(rip as *const u8, MAX_INSN_LEN) })
    }
}

impl VcpuIo for GuestIo<'_> {
    fn run(&mut self) -> io::Result<u32> {
        self.fd.run()
    }

    fn regs(&self) -> io::Result<KvmRegs> {
        self.fd.get_regs()
    }

    fn set_regs(&mut self, regs: &KvmRegs) -> io::Result<()> {
        self.fd.set_regs(regs)
    }

    fn rearm(&mut self) {
        self.fd.run_area_mut().immediate_exit = 0;
    }

    fn context(&self, reason: ExitReason) -> GuestContext {
        let regs = self.fd.get_regs().unwrap_or_default();
        let sregs = self.fd.get_sregs().unwrap_or_default();
        let run = self.fd.run_area();
        let hardware = match reason {
            ExitReason::Unknown | ExitReason::FailEntry => run.hardware_reason(),
            ExitReason::InternalError => run.internal_suberror() as u64,
            _ => 0,
        };
        GuestContext::new(reason, hardware, regs, sregs, self.code(regs.rip as usize))
    }
}

thread_local! {
    /// Vcpu the bluepill handler enters on this thread.
    static ACTIVE: Cell<*mut Vcpu> = const { Cell::new(core::ptr::null_mut()) };
    /// Vcpus of this thread, by machine.
    static VCPUS: RefCell<HashMap<usize, Box<Vcpu>>> = RefCell::new(HashMap::new());
}

static PREVIOUS: OnceLock<PreviousAction> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());

/// Install the bluepill handler once per process.
pub fn install_handler() -> Result<()> {
    let _guard = INSTALL.lock();
    if PREVIOUS.get().is_none() {
        let previous = unsafe { signal::install(libc::SIGSEGV, on_sigsegv)? };
        PREVIOUS.get_or_init(|| previous);
        tracing::debug!("bluepill handler installed");
    }
    Ok(())
}

fn is_bluepill(uc: &UContext<'_>) -> bool {
    // rip faulted on its own fetch, so it is readable.
    uc.rax() == BLUEPILL_MAGIC && unsafe { *(uc.rip() as *const u8) } == CLI_OPCODE
}

extern "C" fn on_sigsegv(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let vcpu = ACTIVE
        .try_with(|active| active.get())
        .unwrap_or(core::ptr::null_mut());
    match unsafe { UContext::from_raw(ctx) } {
        Some(mut uc) if !vcpu.is_null() && is_bluepill(&uc) => {
            // Set by `enter` on this very thread and alive until its exit.
            let vcpu = unsafe { &mut *vcpu };
            if let Err(e) = vcpu.enter(&mut uc) {
                fatal(e);
            }
        }
        _ => {
            if let Some(previous) = PREVIOUS.get() {
                unsafe { previous.forward(sig, info, ctx) };
            }
        }
    }
}

/// Enter the guest of `machine` on the calling thread, creating the thread's
/// vcpu on first use.
pub fn enter(machine: &Arc<Machine>) -> Result<()> {
    let key = Arc::as_ptr(machine) as usize;
    let vcpu = VCPUS.with(|vcpus| -> Result<*mut Vcpu> {
        let mut vcpus = vcpus.borrow_mut();
        let vcpu = match vcpus.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(Box::new(machine.create_vcpu()?)),
        };
        Ok(&mut **vcpu as *mut Vcpu)
    })?;
    ACTIVE.with(|active| active.set(vcpu));
    unsafe { bluepill() };
    Ok(())
}

/// Leave the guest on the calling thread, if inside one.
pub fn leave() {
    if in_guest() {
        redpill();
    }
    ACTIVE.with(|active| active.set(core::ptr::null_mut()));
}

/// Whether the calling thread runs inside a guest.
pub fn in_guest() -> bool {
    ACTIVE
        .try_with(|active| {
            let vcpu = active.get();
            !vcpu.is_null() && unsafe { (*vcpu).state() } == VcpuState::Guest
        })
        .unwrap_or(false)
}

/// Run `f` on the host. A thread inside a guest leaves it for the duration
/// of `f` and enters again afterwards.
pub fn with_host<R>(f: impl FnOnce() -> R) -> R {
    if !in_guest() {
        return f();
    }
    redpill();
    let r = f();
    // The handler is installed, or the thread could not be in a guest.
    unsafe { bluepill() };
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_thread_is_not_in_guest() {
        assert!(!in_guest());
        assert_eq!(with_host(|| 7), 7);
        leave();
        assert!(!in_guest());
    }
}
