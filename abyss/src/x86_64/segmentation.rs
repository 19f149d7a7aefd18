//! Segmentation.
//!
//! Long mode ignores almost everything a segment descriptor carries, but the
//! hypervisor still validates the hidden part of each segment register on
//! entry. A guest domain therefore runs on a fixed set of flat segments.

use super::PrivilegeLevel;
use crate::kvm::KvmSegment;

/// Segment type field of a code or data segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SegmentType {
    /// Read/write data, accessed.
    DataRwAccessed = 3,
    /// Execute/read code, accessed.
    CodeXrAccessed = 11,
}

/// Busy 64-bit task state segment.
const TSS_BUSY: u8 = 11;

/// Flat segments a guest domain runs on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    /// 64-bit kernel code.
    KernelCode,
    /// Kernel data, also used for the stack.
    KernelData,
    /// Task state segment.
    Task,
}

impl Segment {
    /// Segment selector of this segment.
    #[inline]
    pub const fn selector(self) -> u16 {
        match self {
            Segment::KernelCode => 0x08,
            Segment::KernelData => 0x10,
            Segment::Task => 0x18,
        }
    }

    /// Hidden segment register state of this segment.
    pub const fn register(self) -> KvmSegment {
        let dpl = PrivilegeLevel::Ring0 as u8;
        match self {
            Segment::KernelCode => KvmSegment {
                base: 0,
                limit: 0xffff_ffff,
                selector: self.selector(),
                type_: SegmentType::CodeXrAccessed as u8,
                present: 1,
                dpl,
                db: 0,
                s: 1,
                l: 1,
                g: 1,
                avl: 0,
                unusable: 0,
                padding: 0,
            },
            Segment::KernelData => KvmSegment {
                base: 0,
                limit: 0xffff_ffff,
                selector: self.selector(),
                type_: SegmentType::DataRwAccessed as u8,
                present: 1,
                dpl,
                db: 1,
                s: 1,
                l: 0,
                g: 1,
                avl: 0,
                unusable: 0,
                padding: 0,
            },
            Segment::Task => KvmSegment {
                base: 0,
                limit: 0x67,
                selector: self.selector(),
                type_: TSS_BUSY,
                present: 1,
                dpl,
                db: 0,
                s: 0,
                l: 0,
                g: 0,
                avl: 0,
                unusable: 0,
                padding: 0,
            },
        }
    }

    /// Data segment with `base`, used for fs and gs.
    pub const fn data_with_base(base: u64) -> KvmSegment {
        let mut seg = Segment::KernelData.register();
        seg.base = base;
        seg
    }
}
