//! Address abstraction.
//!
//! The isolation engine juggles two address spaces at once: the host virtual
//! addresses ([`Va`]) that the process actually uses, and the guest physical
//! addresses ([`Gpa`]) that a hardware-virtualized domain sees behind its own
//! page tables. Keeping them as distinct types prevents the most common bug of
//! this layer, feeding a host pointer where a guest frame is expected.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Round `addr` down to its page boundary.
#[inline]
pub const fn page_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Round `addr` up to the next page boundary.
#[inline]
pub const fn page_up(addr: usize) -> usize {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Host virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Whether this address is page aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Get reference of T underlying the Va.
    ///
    /// # Safety
    ///
    /// The pointer must be properly aligned, dereferenceable and point to an
    /// initialized instance of `T`.
    #[inline]
    pub unsafe fn as_ref<'a, T>(&self) -> Option<&'a T> {
        (self.0 as *const T).as_ref()
    }

    /// Get mutable reference of T underlying the Va.
    ///
    /// # Safety
    ///
    /// Same as [`Va::as_ref`], plus no other reference to the pointee may be
    /// alive while the returned one is.
    #[inline]
    pub unsafe fn as_mut<'a, T>(&self) -> Option<&'a mut T> {
        (self.0 as *mut T).as_mut()
    }
}

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gpa(usize);

impl Gpa {
    /// GPA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new guest physical address with a check.
    ///
    /// x86_64 page tables can hold at most 52 bits of physical address.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < (1 << 52) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Whether this address is page aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = usize;

            fn sub(self, other: $t) -> usize {
                self.0 - other.0
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Gpa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_va() {
        assert!(Va::new(0x7fff_ffff_f000).is_some());
        assert!(Va::new(0xffff_8000_0000_0000).is_some());
        assert!(Va::new(0x0000_8000_0000_0000).is_none());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_down(0x1fff), 0x1000);
        assert_eq!(page_up(0x1001), 0x2000);
        assert_eq!(page_up(0x2000), 0x2000);
        assert_eq!(Gpa::new(0x3000).unwrap() - Gpa::new(0x1000).unwrap(), 0x2000);
    }
}
