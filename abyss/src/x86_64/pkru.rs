//! Protection-key rights register for user pages.
//!
//! PKRU holds two bits per protection key: bit `2k` is access-disable (AD)
//! and bit `2k + 1` is write-disable (WD). The register is per-thread and
//! writable from ring 3 through `wrpkru`, which is what makes protection keys
//! cheap to switch on every domain transition.
use core::arch::asm;

/// Number of protection keys the hardware offers.
pub const NR_PKEYS: u32 = 16;

/// Access a domain has to the pages tagged with a single key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyAccess {
    /// Loads and stores are allowed.
    ReadWrite,
    /// Only loads are allowed.
    ReadOnly,
    /// Neither loads nor stores are allowed.
    None,
}

impl KeyAccess {
    #[inline]
    const fn bits(self) -> u32 {
        match self {
            KeyAccess::ReadWrite => 0b00,
            KeyAccess::ReadOnly => 0b10,
            KeyAccess::None => 0b11,
        }
    }
}

/// Value of the PKRU register.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Pkru(u32);

impl Pkru {
    /// Every key is fully accessible.
    pub const ALLOW_ALL: Self = Self(0);
    /// Every key but the default key 0 is inaccessible.
    pub const DENY_ALL: Self = Self(0xffff_fffc);

    /// Wrap a raw register value.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Return a copy of this value with `key` set to `access`.
    #[inline]
    pub const fn with_access(self, key: u32, access: KeyAccess) -> Self {
        let shift = key * 2;
        Self((self.0 & !(0b11 << shift)) | (access.bits() << shift))
    }

    /// Access granted to `key`.
    #[inline]
    pub const fn access(self, key: u32) -> KeyAccess {
        match (self.0 >> (key * 2)) & 0b11 {
            0b00 => KeyAccess::ReadWrite,
            0b10 => KeyAccess::ReadOnly,
            _ => KeyAccess::None,
        }
    }

    /// Read the current value.
    ///
    /// # Safety
    /// The cpu must support protection keys; `rdpkru` raises #UD otherwise.
    #[inline(always)]
    pub unsafe fn current() -> Self {
        let eax: u32;
        asm!(
            "rdpkru",
            in("ecx") 0,
            out("eax") eax,
            out("edx") _,
            options(nomem, nostack, preserves_flags)
        );
        Self(eax)
    }

    /// Load this value into the register of the current thread.
    ///
    /// # Safety
    /// The cpu must support protection keys, and the caller must not revoke
    /// access to memory that the current stack frame still relies on.
    #[inline(always)]
    pub unsafe fn apply(self) {
        asm!(
            "wrpkru",
            in("eax") self.0,
            in("ecx") 0,
            in("edx") 0,
            options(nostack, preserves_flags)
        );
    }
}

impl core::fmt::Debug for Pkru {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pkru(0x{:08x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_two_bits_per_key() {
        let pkru = Pkru::DENY_ALL
            .with_access(3, KeyAccess::ReadWrite)
            .with_access(5, KeyAccess::ReadOnly);
        assert_eq!(pkru.access(0), KeyAccess::ReadWrite);
        assert_eq!(pkru.access(3), KeyAccess::ReadWrite);
        assert_eq!(pkru.access(5), KeyAccess::ReadOnly);
        assert_eq!(pkru.access(4), KeyAccess::None);
        assert_eq!(pkru.bits() & (0b11 << 6), 0);
        assert_eq!((pkru.bits() >> 10) & 0b11, 0b10);
    }
}
