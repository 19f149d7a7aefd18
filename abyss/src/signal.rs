//! Signal plumbing for guest entry.
//!
//! Everything reachable from a handler here is async-signal-safe: no
//! allocation, no locks, no formatting.

use crate::kvm::{KvmFpu, KvmRegs};
use std::io;

/// Handler signature for `SA_SIGINFO` actions.
pub type SigInfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Previously installed action, used for chaining.
#[derive(Clone, Copy)]
pub struct PreviousAction(libc::sigaction);

unsafe impl Send for PreviousAction {}
unsafe impl Sync for PreviousAction {}

impl PreviousAction {
    /// Forward a signal this crate does not own to the previous action.
    ///
    /// # Safety
    /// Must be called from the signal handler with its original arguments.
    pub unsafe fn forward(
        &self,
        sig: libc::c_int,
        info: *mut libc::siginfo_t,
        ctx: *mut libc::c_void,
    ) {
        let act = &self.0;
        if act.sa_sigaction == libc::SIG_IGN {
            return;
        }
        if act.sa_sigaction == libc::SIG_DFL {
            // Restore the default action and let the fault happen again.
            libc::signal(sig, libc::SIG_DFL);
            return;
        }
        if act.sa_flags & libc::SA_SIGINFO != 0 {
            let f: SigInfoHandler = core::mem::transmute(act.sa_sigaction);
            f(sig, info, ctx);
        } else {
            let f: extern "C" fn(libc::c_int) = core::mem::transmute(act.sa_sigaction);
            f(sig);
        }
    }
}

/// Install `handler` for `sig` and return the action it replaced.
///
/// # Safety
/// `handler` must be async-signal-safe.
pub unsafe fn install(sig: libc::c_int, handler: SigInfoHandler) -> io::Result<PreviousAction> {
    let mut act: libc::sigaction = core::mem::zeroed();
    act.sa_sigaction = handler as usize;
    act.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
    libc::sigemptyset(&mut act.sa_mask);
    let mut old: libc::sigaction = core::mem::zeroed();
    if libc::sigaction(sig, &act, &mut old) < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PreviousAction(old))
}

/// Alternate signal stack of the calling thread.
///
/// The guest keeps running on the interrupted stack, so the handler frame
/// must live elsewhere. Dropping the value disables the stack again.
pub struct AltStack {
    pages: crate::mm::Pages,
}

impl AltStack {
    /// Pages of each alternate stack.
    pub const PAGES: usize = 16;

    /// Allocate a stack and install it for the calling thread.
    pub fn install() -> io::Result<Self> {
        let pages = crate::mm::Pages::new(Self::PAGES)?;
        let stack = libc::stack_t {
            ss_sp: pages.va().into_usize() as *mut libc::c_void,
            ss_flags: 0,
            ss_size: pages.len(),
        };
        if unsafe { libc::sigaltstack(&stack, core::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { pages })
    }

    /// Base of the stack.
    pub fn base(&self) -> crate::addressing::Va {
        self.pages.va()
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let stack = libc::stack_t {
            ss_sp: core::ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        unsafe {
            libc::sigaltstack(&stack, core::ptr::null_mut());
        }
    }
}

/// Interrupted user context handed to a `SA_SIGINFO` handler.
pub struct UContext<'a>(&'a mut libc::ucontext_t);

macro_rules! gregs {
    ($($field: ident => $reg: ident),* $(,)?) => {
        /// Copy the general purpose registers out of the context.
        pub fn regs(&self) -> KvmRegs {
            let g = &self.0.uc_mcontext.gregs;
            KvmRegs {
                $($field: g[libc::$reg as usize] as u64,)*
            }
        }

        /// Overwrite the general purpose registers of the context.
        pub fn set_regs(&mut self, regs: &KvmRegs) {
            let g = &mut self.0.uc_mcontext.gregs;
            $(g[libc::$reg as usize] = regs.$field as i64;)*
        }
    };
}

impl<'a> UContext<'a> {
    /// Wrap the raw context argument.
    ///
    /// # Safety
    /// `ctx` must be the third argument of a `SA_SIGINFO` handler.
    pub unsafe fn from_raw(ctx: *mut libc::c_void) -> Option<Self> {
        (ctx as *mut libc::ucontext_t).as_mut().map(Self)
    }

    gregs! {
        rax => REG_RAX, rbx => REG_RBX, rcx => REG_RCX, rdx => REG_RDX,
        rsi => REG_RSI, rdi => REG_RDI, rsp => REG_RSP, rbp => REG_RBP,
        r8 => REG_R8, r9 => REG_R9, r10 => REG_R10, r11 => REG_R11,
        r12 => REG_R12, r13 => REG_R13, r14 => REG_R14, r15 => REG_R15,
        rip => REG_RIP, rflags => REG_EFL,
    }

    /// Interrupted instruction pointer.
    #[inline]
    pub fn rip(&self) -> u64 {
        self.0.uc_mcontext.gregs[libc::REG_RIP as usize] as u64
    }

    /// Interrupted rax.
    #[inline]
    pub fn rax(&self) -> u64 {
        self.0.uc_mcontext.gregs[libc::REG_RAX as usize] as u64
    }

    fn fxsave(&self) -> Option<&[u8; 512]> {
        unsafe { (self.0.uc_mcontext.fpregs as *const [u8; 512]).as_ref() }
    }

    fn fxsave_mut(&mut self) -> Option<&mut [u8; 512]> {
        unsafe { (self.0.uc_mcontext.fpregs as *mut [u8; 512]).as_mut() }
    }

    /// Length of the xsave area behind the legacy fxsave area, when the
    /// kernel saved the extended state (`struct _fpx_sw_bytes`).
    fn xsave_len(&self) -> Option<usize> {
        let area = self.fxsave()?;
        let magic = u32::from_ne_bytes([area[464], area[465], area[466], area[467]]);
        let size = u32::from_ne_bytes([area[480], area[481], area[482], area[483]]) as usize;
        (magic == FP_XSTATE_MAGIC1 && size >= XSAVE_HEADER_END).then_some(size)
    }

    /// Extended state of the interrupted context in the standard xsave
    /// layout.
    pub fn xsave(&self) -> Option<&[u8]> {
        let len = self.xsave_len()?;
        // The kernel laid out `len` bytes at fpregs.
        Some(unsafe { core::slice::from_raw_parts(self.0.uc_mcontext.fpregs as *const u8, len) })
    }

    /// Mutable [`UContext::xsave`].
    pub fn xsave_mut(&mut self) -> Option<&mut [u8]> {
        let len = self.xsave_len()?;
        Some(unsafe { core::slice::from_raw_parts_mut(self.0.uc_mcontext.fpregs as *mut u8, len) })
    }

    /// Copy the legacy fxsave area into a vcpu fpu image.
    pub fn fpu(&self) -> KvmFpu {
        let mut fpu = KvmFpu::default();
        if let Some(area) = self.fxsave() {
            fpu.fcw = u16::from_ne_bytes([area[0], area[1]]);
            fpu.fsw = u16::from_ne_bytes([area[2], area[3]]);
            fpu.ftwx = area[4];
            fpu.last_opcode = u16::from_ne_bytes([area[6], area[7]]);
            fpu.last_ip = read_u64(area, 8);
            fpu.last_dp = read_u64(area, 16);
            fpu.mxcsr = u32::from_ne_bytes([area[24], area[25], area[26], area[27]]);
            for (i, st) in fpu.fpr.iter_mut().enumerate() {
                st.copy_from_slice(&area[32 + i * 16..48 + i * 16]);
            }
            for (i, xmm) in fpu.xmm.iter_mut().enumerate() {
                xmm.copy_from_slice(&area[160 + i * 16..176 + i * 16]);
            }
        }
        fpu
    }

    /// Write a vcpu fpu image back into the legacy fxsave area.
    pub fn set_fpu(&mut self, fpu: &KvmFpu) {
        if let Some(area) = self.fxsave_mut() {
            area[0..2].copy_from_slice(&fpu.fcw.to_ne_bytes());
            area[2..4].copy_from_slice(&fpu.fsw.to_ne_bytes());
            area[4] = fpu.ftwx;
            area[6..8].copy_from_slice(&fpu.last_opcode.to_ne_bytes());
            area[8..16].copy_from_slice(&fpu.last_ip.to_ne_bytes());
            area[16..24].copy_from_slice(&fpu.last_dp.to_ne_bytes());
            area[24..28].copy_from_slice(&fpu.mxcsr.to_ne_bytes());
            for (i, st) in fpu.fpr.iter().enumerate() {
                area[32 + i * 16..48 + i * 16].copy_from_slice(st);
            }
            for (i, xmm) in fpu.xmm.iter().enumerate() {
                area[160 + i * 16..176 + i * 16].copy_from_slice(xmm);
            }
        }
    }
}

/// Marks a signal frame carrying extended state.
const FP_XSTATE_MAGIC1: u32 = 0x4650_5853;
/// End of the legacy area and the xsave header.
const XSAVE_HEADER_END: usize = 576;

fn read_u64(area: &[u8; 512], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&area[at..at + 8]);
    u64::from_ne_bytes(raw)
}

const ARCH_GET_FS: libc::c_int = 0x1003;
const ARCH_GET_GS: libc::c_int = 0x1004;

fn arch_prctl_get(code: libc::c_int) -> io::Result<u64> {
    let mut out: u64 = 0;
    let ret = unsafe { libc::syscall(libc::SYS_arch_prctl, code, &mut out as *mut u64) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(out)
    }
}

/// fs base of the calling thread.
pub fn fs_base() -> io::Result<u64> {
    arch_prctl_get(ARCH_GET_FS)
}

/// gs base of the calling thread.
pub fn gs_base() -> io::Result<u64> {
    arch_prctl_get(ARCH_GET_GS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_has_fs_base() {
        // Thread locals live behind fs on x86_64 linux.
        assert_ne!(fs_base().unwrap(), 0);
    }

    #[test]
    fn alt_stack_is_installed() {
        let alt = AltStack::install().unwrap();
        let mut cur: libc::stack_t = unsafe { core::mem::zeroed() };
        unsafe { libc::sigaltstack(core::ptr::null(), &mut cur) };
        assert_eq!(cur.ss_sp as usize, alt.base().into_usize());
        drop(alt);
        unsafe { libc::sigaltstack(core::ptr::null(), &mut cur) };
        assert_ne!(cur.ss_flags & libc::SS_DISABLE, 0);
    }
}
