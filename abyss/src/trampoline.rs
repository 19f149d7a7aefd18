//! Transitions between host mode and guest mode.
//!
//! `bluepill` executes `cli` with a reserved value in rax. In ring 3 this
//! raises a general protection fault, delivered as SIGSEGV, and the handler
//! moves the interrupted context into a vcpu. Execution continues on the next
//! instruction, now inside the guest.
//!
//! `redpill` issues a `syscall` with a reserved number. In the guest it lands
//! on the `hlt` stub behind LSTAR and the handler hands the context back to
//! the host. On the host it is an unknown syscall and returns `-ENOSYS`.
use core::arch::asm;

/// Value of rax that marks a bluepill fault.
pub const BLUEPILL_MAGIC: u64 = 0x6c69_7474_6572_626f;

/// Syscall number that asks to leave guest mode.
pub const REDPILL_NR: u64 = 0x1_0000_0b0c;

/// Opcode of `cli`.
pub const CLI_OPCODE: u8 = 0xfa;

/// Enter the guest.
///
/// # Safety
/// A SIGSEGV handler that recognizes [`BLUEPILL_MAGIC`] must be installed,
/// otherwise the process dies on the fault.
#[inline(never)]
pub unsafe fn bluepill() {
    asm!(
        "cli",
        inout("rax") BLUEPILL_MAGIC => _,
        options(nostack)
    );
}

/// Leave the guest. Harmless on the host.
#[inline(never)]
pub fn redpill() {
    unsafe {
        asm!(
            "syscall",
            inout("rax") REDPILL_NR => _,
            out("rcx") _,
            out("r11") _,
            options(nostack)
        );
    }
}

/// Code of the page LSTAR points to: `hlt; jmp -3`.
pub const SYSCALL_STUB: [u8; 3] = [0xf4, 0xeb, 0xfd];

/// Issue system call `nr` with `args` and return the raw kernel result,
/// `-errno` on failure. errno is left untouched.
///
/// # Safety
/// The call may do anything the kernel allows on behalf of the process.
#[inline]
pub unsafe fn raw_syscall(nr: u64, args: [u64; 6]) -> i64 {
    let ret: i64;
    asm!(
        "syscall",
        inlateout("rax") nr as i64 => ret,
        in("rdi") args[0],
        in("rsi") args[1],
        in("rdx") args[2],
        in("r10") args[3],
        in("r8") args[4],
        in("r9") args[5],
        out("rcx") _,
        out("r11") _,
        options(nostack)
    );
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpill_is_harmless_on_host() {
        redpill();
        let pid = unsafe { raw_syscall(libc::SYS_getpid as u64, [0; 6]) };
        assert_eq!(pid, std::process::id() as i64);
        let bad = unsafe { raw_syscall(REDPILL_NR, [0; 6]) };
        assert_eq!(bad, -(libc::ENOSYS as i64));
    }
}
