//! intrinsics of x86_64 not included in [`core::arch::x86_64`].
//!
//! [`core::arch::x86_64`]: https://doc.rust-lang.org/beta/core/arch/x86_64/index.html
use core::arch::asm;

/// Whether the cpu implements protection keys for user-mode pages and the
/// operating system enabled them (CPUID.(EAX=07H,ECX=0H):ECX.{PKU,OSPKE}).
pub fn has_pku() -> bool {
    let leaf = unsafe { core::arch::x86_64::__cpuid_count(7, 0) };
    leaf.ecx & (1 << 3) != 0 && leaf.ecx & (1 << 4) != 0
}

/// Whether the operating system enabled xsave (CPUID.01H:ECX.OSXSAVE).
pub fn has_osxsave() -> bool {
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.ecx & (1 << 27) != 0
}

/// Read the extended control register `xcr`.
///
/// Returns `None` when the operating system did not enable xsave.
pub fn xgetbv(xcr: u32) -> Option<u64> {
    if !has_osxsave() {
        return None;
    }
    let (hi, lo): (u32, u32);
    unsafe {
        asm!("xgetbv", in("ecx") xcr, out("edx") hi, out("eax") lo, options(nomem, nostack));
    }
    Some(((hi as u64) << 32) | lo as u64)
}
