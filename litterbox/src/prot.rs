//! Memory protection.

bitflags::bitflags! {
    /// Protection of a memory extent.
    #[derive(Default)]
    pub struct Prot: u8 {
        /// Readable.
        const R = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// Executable.
        const X = 1 << 2;
        /// Accessible from the sandboxed code.
        const USER = 1 << 3;
        /// Grown at runtime (heap, registered spans).
        const DYNAMIC = 1 << 4;
        /// Placeholder without backing memory.
        const FAKE = 1 << 5;

        const RW = Self::R.bits | Self::W.bits;
        const RX = Self::R.bits | Self::X.bits;
        const RWX = Self::R.bits | Self::W.bits | Self::X.bits;
        /// Everything a domain view may grant.
        const ALL = Self::RWX.bits | Self::USER.bits;
    }
}

impl Prot {
    /// Hardware access bits only.
    #[inline]
    pub const fn access(self) -> Self {
        Self::from_bits_truncate(self.bits & Self::RWX.bits)
    }

    /// Effective protection of memory whose native protection is `self`
    /// when seen through a view granting `grant`.
    ///
    /// Attribute bits of `self` are kept, access bits are intersected.
    #[inline]
    pub const fn restrict(self, grant: Prot) -> Self {
        Self::from_bits_truncate(
            (self.bits & !Self::ALL.bits) | (self.bits & grant.bits & Self::ALL.bits),
        )
    }

    /// Convert to `mprotect(2)` flags.
    pub const fn to_mprotect(self) -> i32 {
        let mut p = abyss::mm::prot::NONE;
        if self.contains(Self::R) {
            p |= abyss::mm::prot::READ;
        }
        if self.contains(Self::W) {
            p |= abyss::mm::prot::WRITE;
        }
        if self.contains(Self::X) {
            p |= abyss::mm::prot::EXEC;
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrict_keeps_attributes() {
        let native = Prot::RW | Prot::USER | Prot::DYNAMIC;
        let eff = native.restrict(Prot::R | Prot::USER);
        assert_eq!(eff, Prot::R | Prot::USER | Prot::DYNAMIC);
        assert_eq!(Prot::RX.restrict(Prot::empty()).access(), Prot::empty());
    }
}
