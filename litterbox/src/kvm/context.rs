//! Guest state captured on a fatal exit.
use super::ExitReason;
use abyss::kvm::{KvmRegs, KvmSregs};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

/// Longest x86_64 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Registers and faulting instruction of a stopped guest.
#[derive(Clone, Debug)]
pub struct GuestContext {
    pub reason: ExitReason,
    /// Hardware reason or sub-error reported with the exit, if any.
    pub hardware: u64,
    pub regs: KvmRegs,
    pub sregs: KvmSregs,
    /// Instruction at rip, in Intel syntax.
    pub instruction: Option<String>,
}

impl GuestContext {
    /// Capture a context. `code` holds the bytes at rip when they are
    /// readable.
    pub fn new(
        reason: ExitReason,
        hardware: u64,
        regs: KvmRegs,
        sregs: KvmSregs,
        code: Option<&[u8]>,
    ) -> Self {
        Self {
            reason,
            hardware,
            regs,
            sregs,
            instruction: code.and_then(|code| decode(regs.rip, code)),
        }
    }
}

fn decode(rip: u64, bytes: &[u8]) -> Option<String> {
    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    let mut insn = Instruction::default();
    if !decoder.can_decode() {
        return None;
    }
    decoder.decode_out(&mut insn);
    if insn.is_invalid() {
        return None;
    }
    let mut out = String::new();
    IntelFormatter::new().format(&insn, &mut out);
    Some(out)
}

impl core::fmt::Display for GuestContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let r = &self.regs;
        let s = &self.sregs;
        writeln!(f, "exit: {:?} (hardware {:#x})", self.reason, self.hardware)?;
        writeln!(
            f,
            "RIP: {:016x}  RSP: {:016x}  RFLAGS: {:08x}",
            r.rip, r.rsp, r.rflags
        )?;
        writeln!(
            f,
            "RAX: {:016x}  RBX: {:016x}  RCX: {:016x}  RDX: {:016x}",
            r.rax, r.rbx, r.rcx, r.rdx
        )?;
        writeln!(
            f,
            "RSI: {:016x}  RDI: {:016x}  RBP: {:016x}  R8:  {:016x}",
            r.rsi, r.rdi, r.rbp, r.r8
        )?;
        writeln!(
            f,
            "R9:  {:016x}  R10: {:016x}  R11: {:016x}  R12: {:016x}",
            r.r9, r.r10, r.r11, r.r12
        )?;
        writeln!(
            f,
            "R13: {:016x}  R14: {:016x}  R15: {:016x}",
            r.r13, r.r14, r.r15
        )?;
        writeln!(
            f,
            "CR0: {:016x}  CR2: {:016x}  CR3: {:016x}  CR4: {:016x}  EFER: {:x}",
            s.cr0, s.cr2, s.cr3, s.cr4, s.efer
        )?;
        writeln!(
            f,
            "CS: {:04x}  SS: {:04x}  FS base: {:016x}  GS base: {:016x}",
            s.cs.selector, s.ss.selector, s.fs.base, s.gs.base
        )?;
        match &self.instruction {
            Some(insn) => write!(f, "instruction: {}", insn),
            None => write!(f, "instruction: <unreadable>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_decodes_instruction() {
        let regs = KvmRegs {
            rip: 0x40_1000,
            rax: 0x1122,
            ..Default::default()
        };
        // mov rax, [rbx]
        let ctx = GuestContext::new(
            ExitReason::Shutdown,
            0,
            regs,
            KvmSregs::default(),
            Some(&[0x48, 0x8b, 0x03]),
        );
        assert_eq!(ctx.instruction.as_deref(), Some("mov rax,[rbx]"));
        let dump = ctx.to_string();
        assert!(dump.contains("Shutdown"));
        assert!(dump.contains("RIP: 0000000000401000"));
        assert!(dump.contains("RAX: 0000000000001122"));
    }

    #[test]
    fn garbage_is_not_decoded() {
        let ctx = GuestContext::new(
            ExitReason::Unknown,
            0,
            KvmRegs::default(),
            KvmSregs::default(),
            Some(&[0x0f]),
        );
        assert_eq!(ctx.instruction, None);
    }
}
