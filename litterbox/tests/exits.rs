//! Exit triage through a scripted vcpu.
use abyss::kvm::{KvmRegs, KvmSregs};
use litterbox::{
    kvm::{
        guest_loop, ExitAction, ExitController, ExitReason, GuestContext, HostSyscalls, Rearm,
        SyscallGate, VcpuIo,
    },
    package::DomainId,
    syscall::SyscallClass,
    Error, Result,
};
use std::{collections::VecDeque, io};

const STUB: u64 = 0x9000;

struct Scripted {
    exits: VecDeque<(u32, KvmRegs)>,
    regs: KvmRegs,
    code: Vec<u8>,
}

impl Scripted {
    fn new(exits: Vec<(ExitReason, KvmRegs)>, code: &[u8]) -> Self {
        Self {
            exits: exits.into_iter().map(|(r, regs)| (r as u32, regs)).collect(),
            regs: KvmRegs::default(),
            code: code.to_vec(),
        }
    }
}

impl VcpuIo for Scripted {
    fn run(&mut self) -> io::Result<u32> {
        let (reason, regs) = self
            .exits
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.regs = regs;
        Ok(reason)
    }

    fn regs(&self) -> io::Result<KvmRegs> {
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: &KvmRegs) -> io::Result<()> {
        self.regs = *regs;
        Ok(())
    }

    fn context(&self, reason: ExitReason) -> GuestContext {
        GuestContext::new(reason, 0, self.regs, KvmSregs::default(), Some(&self.code))
    }
}

struct Nothing;

impl HostSyscalls for Nothing {
    fn syscall(&mut self, _nr: u64, _args: [u64; 6]) -> i64 {
        0
    }
}

/// Skips port writes, as a device model would.
struct SkipIo(usize);

impl ExitController for SkipIo {
    fn handle<V: VcpuIo>(&mut self, reason: ExitReason, _vcpu: &mut V) -> Result<ExitAction> {
        match reason {
            ExitReason::Io => {
                self.0 += 1;
                Ok(ExitAction::Resume)
            }
            _ => Err(Error::UnhandledExit(reason)),
        }
    }
}

fn gate() -> SyscallGate<Nothing> {
    SyscallGate {
        domain: DomainId(3),
        mask: SyscallClass::all(),
        stub: STUB,
        host: Nothing,
    }
}

#[test]
fn triple_fault_reports_the_faulting_instruction() {
    let regs = KvmRegs {
        rip: 0x40_0000,
        rbx: 0,
        ..Default::default()
    };
    // mov rax, [rbx]
    let mut vcpu = Scripted::new(vec![(ExitReason::Shutdown, regs)], &[0x48, 0x8b, 0x03]);
    let err = guest_loop(&mut vcpu, &mut (gate(), (Rearm, ()))).unwrap_err();

    let report = err.to_string();
    match err {
        Error::FatalExit { reason, context } => {
            assert_eq!(reason, ExitReason::Shutdown);
            assert_eq!(context.regs.rip, 0x40_0000);
            assert_eq!(context.instruction.as_deref(), Some("mov rax,[rbx]"));
        }
        other => panic!("unexpected {}", other),
    }
    assert!(report.contains("RIP: 0000000000400000"));
    assert!(report.contains("mov rax,[rbx]"));
}

#[test]
fn extra_controllers_chain_before_the_fallback() {
    let leave = KvmRegs {
        rax: abyss::trampoline::REDPILL_NR,
        rcx: 0x40_1234,
        r11: 0x246,
        rip: STUB + 1,
        ..Default::default()
    };
    let mut vcpu = Scripted::new(
        vec![
            (ExitReason::Io, KvmRegs::default()),
            (ExitReason::Io, KvmRegs::default()),
            (ExitReason::Hlt, leave),
        ],
        &[],
    );
    let mut controller = (SkipIo(0), (gate(), (Rearm, ())));
    let regs = guest_loop(&mut vcpu, &mut controller).unwrap();
    assert_eq!(controller.0 .0, 2);
    assert_eq!(regs.rip, 0x40_1234);
    assert_eq!(regs.rflags, 0x246);
}

#[test]
fn unclaimed_exit_is_fatal() {
    let mut vcpu = Scripted::new(vec![(ExitReason::Mmio, KvmRegs::default())], &[0xff]);
    let err = guest_loop(&mut vcpu, &mut (gate(), ())).unwrap_err();
    assert!(matches!(
        err,
        Error::FatalExit {
            reason: ExitReason::Mmio,
            ..
        }
    ));
}
