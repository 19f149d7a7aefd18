//! Linux KVM interface.
//!
//! A thin, typed layer over `/dev/kvm` ioctls. Structures mirror the kernel
//! ABI in `<linux/kvm.h>` for x86_64 and are sized to match it exactly.

use crate::x86_64::msr::MsrEntry;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// The only stable KVM api version.
pub const KVM_API_VERSION: i32 = 12;

mod nr {
    pub const GET_API_VERSION: u64 = 0xae00;
    pub const CREATE_VM: u64 = 0xae01;
    pub const GET_VCPU_MMAP_SIZE: u64 = 0xae04;
    pub const GET_SUPPORTED_CPUID: u64 = 0xc008_ae05;
    pub const CREATE_VCPU: u64 = 0xae41;
    pub const SET_USER_MEMORY_REGION: u64 = 0x4020_ae46;
    pub const SET_TSS_ADDR: u64 = 0xae47;
    pub const RUN: u64 = 0xae80;
    pub const GET_REGS: u64 = 0x8090_ae81;
    pub const SET_REGS: u64 = 0x4090_ae82;
    pub const GET_SREGS: u64 = 0x8138_ae83;
    pub const SET_SREGS: u64 = 0x4138_ae84;
    pub const SET_MSRS: u64 = 0x4008_ae89;
    pub const GET_FPU: u64 = 0x81a0_ae8c;
    pub const SET_FPU: u64 = 0x41a0_ae8d;
    pub const SET_CPUID2: u64 = 0x4008_ae90;
    pub const GET_XSAVE: u64 = 0x9000_aea4;
    pub const SET_XSAVE: u64 = 0x5000_aea5;
    pub const SET_XCRS: u64 = 0x4188_aea7;
}

/// General purpose registers (`struct kvm_regs`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Hidden part of a segment register (`struct kvm_segment`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmSegment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

/// Descriptor table register (`struct kvm_dtable`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmDtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

/// Special registers (`struct kvm_sregs`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmSregs {
    pub cs: KvmSegment,
    pub ds: KvmSegment,
    pub es: KvmSegment,
    pub fs: KvmSegment,
    pub gs: KvmSegment,
    pub ss: KvmSegment,
    pub tr: KvmSegment,
    pub ldt: KvmSegment,
    pub gdt: KvmDtable,
    pub idt: KvmDtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

/// Floating point state (`struct kvm_fpu`).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KvmFpu {
    pub fpr: [[u8; 16]; 8],
    pub fcw: u16,
    pub fsw: u16,
    pub ftwx: u8,
    pub pad1: u8,
    pub last_opcode: u16,
    pub last_ip: u64,
    pub last_dp: u64,
    pub xmm: [[u8; 16]; 16],
    pub mxcsr: u32,
    pub pad2: u32,
}

impl Default for KvmFpu {
    fn default() -> Self {
        Self {
            fpr: [[0; 16]; 8],
            fcw: 0x37f,
            fsw: 0,
            ftwx: 0,
            pad1: 0,
            last_opcode: 0,
            last_ip: 0,
            last_dp: 0,
            xmm: [[0; 16]; 16],
            mxcsr: 0x1f80,
            pad2: 0,
        }
    }
}

/// Single extended control register (`struct kvm_xcr`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmXcr {
    pub xcr: u32,
    pub reserved: u32,
    pub value: u64,
}

/// Extended control registers (`struct kvm_xcrs`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmXcrs {
    pub nr_xcrs: u32,
    pub flags: u32,
    pub xcrs: [KvmXcr; 16],
    pub padding: [u64; 16],
}

/// Size of the image moved by `KVM_GET_XSAVE` and `KVM_SET_XSAVE`.
pub const XSAVE_SIZE: usize = 4096;

/// Extended processor state in the standard xsave layout (`struct kvm_xsave`).
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct KvmXsave {
    pub region: [u8; XSAVE_SIZE],
}

impl KvmXsave {
    /// Software reserved bytes of the legacy area.
    const SW_RESERVED: core::ops::Range<usize> = 464..512;
    /// XSTATE_BV of the xsave header.
    const XSTATE_BV: usize = 512;
    /// XCOMP_BV of the xsave header.
    const XCOMP_BV: usize = 520;

    /// Image of the standard format xsave area `area`, restricted to the
    /// components enabled in `xcr0`.
    pub fn from_area(area: &[u8], xcr0: u64) -> Self {
        let mut xsave = Self::default();
        let n = area.len().min(XSAVE_SIZE);
        xsave.region[..n].copy_from_slice(&area[..n]);
        xsave.region[Self::SW_RESERVED].fill(0);
        xsave.set_word(Self::XSTATE_BV, xsave.xstate_bv() & xcr0);
        xsave.set_word(Self::XCOMP_BV, 0);
        xsave
    }

    /// Copy the image back into the standard format xsave area `area`. The
    /// software reserved bytes of `area` are kept.
    pub fn write_area(&self, area: &mut [u8]) {
        let n = area.len().min(XSAVE_SIZE);
        let reserved = Self::SW_RESERVED;
        area[..reserved.start.min(n)].copy_from_slice(&self.region[..reserved.start.min(n)]);
        if n > reserved.end {
            area[reserved.end..n].copy_from_slice(&self.region[reserved.end..n]);
        }
    }

    /// Components whose state the image holds.
    pub fn xstate_bv(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.region[Self::XSTATE_BV..Self::XSTATE_BV + 8]);
        u64::from_le_bytes(raw)
    }

    fn set_word(&mut self, at: usize, value: u64) {
        self.region[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for KvmXsave {
    fn default() -> Self {
        Self {
            region: [0; XSAVE_SIZE],
        }
    }
}

/// A guest memory slot (`struct kvm_userspace_memory_region`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// One cpuid leaf (`struct kvm_cpuid_entry2`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmCpuidEntry2 {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub padding: [u32; 3],
}

/// Cpuid leaf enumerating the xsave components.
pub const CPUID_XSAVE_LEAF: u32 = 0xd;

/// XCR0 components a guest may enable, from the xsave leaf of `cpuid`.
pub fn supported_xcr0(cpuid: &[KvmCpuidEntry2]) -> u64 {
    cpuid
        .iter()
        .find(|e| e.function == CPUID_XSAVE_LEAF && e.index == 0)
        .map_or(0, |e| (e.edx as u64) << 32 | e.eax as u64)
}

/// Maximum number of cpuid leaves fetched from the host.
pub const MAX_CPUID_ENTRIES: usize = 256;

#[repr(C)]
struct KvmCpuid2 {
    nent: u32,
    padding: u32,
    entries: [KvmCpuidEntry2; MAX_CPUID_ENTRIES],
}

#[repr(C)]
struct KvmMsrs<const N: usize> {
    nmsrs: u32,
    pad: u32,
    entries: [MsrEntry; N],
}

/// Shared vcpu run area (`struct kvm_run`), as far as the engine reads it.
#[repr(C)]
pub struct KvmRun {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,
    pub cr8: u64,
    pub apic_base: u64,
    /// Exit-specific information.
    pub exit: [u8; 256],
}

impl KvmRun {
    /// `hardware_exit_reason` of a `KVM_EXIT_UNKNOWN` or
    /// `fail_entry_hardware_entry_failure_reason` of a `KVM_EXIT_FAIL_ENTRY`.
    pub fn hardware_reason(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.exit[..8]);
        u64::from_ne_bytes(raw)
    }

    /// `suberror` of a `KVM_EXIT_INTERNAL_ERROR`.
    pub fn internal_suberror(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.exit[..4]);
        u32::from_ne_bytes(raw)
    }
}

const _: () = {
    assert!(core::mem::size_of::<KvmRegs>() == 0x90);
    assert!(core::mem::size_of::<KvmSegment>() == 24);
    assert!(core::mem::size_of::<KvmSregs>() == 0x138);
    assert!(core::mem::size_of::<KvmFpu>() == 0x1a0);
    assert!(core::mem::size_of::<KvmXcrs>() == 0x188);
    assert!(core::mem::size_of::<KvmXsave>() == 0x1000);
    assert!(core::mem::size_of::<KvmUserspaceMemoryRegion>() == 0x20);
    assert!(core::mem::size_of::<KvmCpuidEntry2>() == 40);
};

#[inline]
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

unsafe fn ioctl_val(fd: RawFd, req: u64, arg: libc::c_ulong) -> io::Result<libc::c_int> {
    cvt(libc::ioctl(fd, req as _, arg))
}

unsafe fn ioctl_ptr<T>(fd: RawFd, req: u64, arg: *const T) -> io::Result<libc::c_int> {
    cvt(libc::ioctl(fd, req as _, arg))
}

unsafe fn ioctl_mut<T>(fd: RawFd, req: u64, arg: *mut T) -> io::Result<libc::c_int> {
    cvt(libc::ioctl(fd, req as _, arg))
}

/// Handle to `/dev/kvm`.
pub struct Kvm {
    file: File,
}

impl Kvm {
    /// Open `/dev/kvm` and check the api version.
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open("/dev/kvm")?;
        let kvm = Self { file };
        let version = unsafe { ioctl_val(kvm.as_raw_fd(), nr::GET_API_VERSION, 0)? };
        if version != KVM_API_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported kvm api version {}", version),
            ));
        }
        Ok(kvm)
    }

    /// Size of the shared run area of each vcpu.
    pub fn vcpu_mmap_size(&self) -> io::Result<usize> {
        unsafe { ioctl_val(self.as_raw_fd(), nr::GET_VCPU_MMAP_SIZE, 0).map(|s| s as usize) }
    }

    /// Cpuid leaves the host supports for guests.
    pub fn supported_cpuid(&self) -> io::Result<Vec<KvmCpuidEntry2>> {
        let mut cpuid = Box::new(KvmCpuid2 {
            nent: MAX_CPUID_ENTRIES as u32,
            padding: 0,
            entries: [KvmCpuidEntry2::default(); MAX_CPUID_ENTRIES],
        });
        unsafe {
            ioctl_mut(self.as_raw_fd(), nr::GET_SUPPORTED_CPUID, &mut *cpuid)?;
        }
        Ok(cpuid.entries[..cpuid.nent as usize].to_vec())
    }

    /// Create a new virtual machine.
    pub fn create_vm(&self) -> io::Result<VmFd> {
        let fd = unsafe { ioctl_val(self.as_raw_fd(), nr::CREATE_VM, 0)? };
        Ok(VmFd {
            file: unsafe { File::from_raw_fd(fd) },
            run_size: self.vcpu_mmap_size()?,
        })
    }
}

impl AsRawFd for Kvm {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// A virtual machine.
pub struct VmFd {
    file: File,
    run_size: usize,
}

impl VmFd {
    /// Install or replace guest memory slot `region.slot`.
    ///
    /// # Safety
    /// `region.userspace_addr` must stay mapped for `region.memory_size`
    /// bytes as long as the slot is installed.
    pub unsafe fn set_user_memory_region(
        &self,
        region: &KvmUserspaceMemoryRegion,
    ) -> io::Result<()> {
        ioctl_ptr(self.as_raw_fd(), nr::SET_USER_MEMORY_REGION, region).map(|_| ())
    }

    /// Place the three pages the hypervisor needs for its real-mode tss.
    pub fn set_tss_addr(&self, gpa: u64) -> io::Result<()> {
        unsafe { ioctl_val(self.as_raw_fd(), nr::SET_TSS_ADDR, gpa as libc::c_ulong).map(|_| ()) }
    }

    /// Create vcpu `id`.
    pub fn create_vcpu(&self, id: u32) -> io::Result<VcpuFd> {
        let fd = unsafe { ioctl_val(self.as_raw_fd(), nr::CREATE_VCPU, id as libc::c_ulong)? };
        let file = unsafe { File::from_raw_fd(fd) };
        let run = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                self.run_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if run == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(VcpuFd {
            file,
            run: run as *mut KvmRun,
            run_size: self.run_size,
        })
    }
}

impl AsRawFd for VmFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// A virtual cpu with its mapped run area.
pub struct VcpuFd {
    file: File,
    run: *mut KvmRun,
    run_size: usize,
}

unsafe impl Send for VcpuFd {}

impl VcpuFd {
    /// Run until the next exit, returning the raw exit reason.
    ///
    /// Signals that interrupt the run surface as `ErrorKind::Interrupted`.
    pub fn run(&mut self) -> io::Result<u32> {
        unsafe {
            ioctl_val(self.as_raw_fd(), nr::RUN, 0)?;
        }
        Ok(self.run_area().exit_reason)
    }

    /// Shared run area.
    pub fn run_area(&self) -> &KvmRun {
        unsafe { &*self.run }
    }

    pub fn run_area_mut(&mut self) -> &mut KvmRun {
        unsafe { &mut *self.run }
    }

    pub fn get_regs(&self) -> io::Result<KvmRegs> {
        let mut regs = KvmRegs::default();
        unsafe { ioctl_mut(self.as_raw_fd(), nr::GET_REGS, &mut regs)? };
        Ok(regs)
    }

    pub fn set_regs(&self, regs: &KvmRegs) -> io::Result<()> {
        unsafe { ioctl_ptr(self.as_raw_fd(), nr::SET_REGS, regs).map(|_| ()) }
    }

    pub fn get_sregs(&self) -> io::Result<KvmSregs> {
        let mut sregs = KvmSregs::default();
        unsafe { ioctl_mut(self.as_raw_fd(), nr::GET_SREGS, &mut sregs)? };
        Ok(sregs)
    }

    pub fn set_sregs(&self, sregs: &KvmSregs) -> io::Result<()> {
        unsafe { ioctl_ptr(self.as_raw_fd(), nr::SET_SREGS, sregs).map(|_| ()) }
    }

    pub fn get_fpu(&self) -> io::Result<KvmFpu> {
        let mut fpu = KvmFpu::default();
        unsafe { ioctl_mut(self.as_raw_fd(), nr::GET_FPU, &mut fpu)? };
        Ok(fpu)
    }

    pub fn set_fpu(&self, fpu: &KvmFpu) -> io::Result<()> {
        unsafe { ioctl_ptr(self.as_raw_fd(), nr::SET_FPU, fpu).map(|_| ()) }
    }

    pub fn get_xsave(&self) -> io::Result<KvmXsave> {
        let mut xsave = KvmXsave::default();
        unsafe { ioctl_mut(self.as_raw_fd(), nr::GET_XSAVE, &mut xsave)? };
        Ok(xsave)
    }

    pub fn set_xsave(&self, xsave: &KvmXsave) -> io::Result<()> {
        unsafe { ioctl_ptr(self.as_raw_fd(), nr::SET_XSAVE, xsave).map(|_| ()) }
    }

    pub fn set_xcrs(&self, xcrs: &KvmXcrs) -> io::Result<()> {
        unsafe { ioctl_ptr(self.as_raw_fd(), nr::SET_XCRS, xcrs).map(|_| ()) }
    }

    /// Load a fixed set of msrs.
    pub fn set_msrs<const N: usize>(&self, entries: [MsrEntry; N]) -> io::Result<()> {
        let msrs = KvmMsrs {
            nmsrs: N as u32,
            pad: 0,
            entries,
        };
        let written = unsafe { ioctl_ptr(self.as_raw_fd(), nr::SET_MSRS, &msrs)? };
        if written as usize != N {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("kvm accepted {} of {} msrs", written, N),
            ));
        }
        Ok(())
    }

    /// Expose `entries` as the guest's cpuid.
    pub fn set_cpuid2(&self, entries: &[KvmCpuidEntry2]) -> io::Result<()> {
        let n = entries.len().min(MAX_CPUID_ENTRIES);
        let mut cpuid = Box::new(KvmCpuid2 {
            nent: n as u32,
            padding: 0,
            entries: [KvmCpuidEntry2::default(); MAX_CPUID_ENTRIES],
        });
        cpuid.entries[..n].copy_from_slice(&entries[..n]);
        unsafe { ioctl_ptr(self.as_raw_fd(), nr::SET_CPUID2, &*cpuid).map(|_| ()) }
    }
}

impl AsRawFd for VcpuFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for VcpuFd {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.run as *mut libc::c_void, self.run_size);
        }
    }
}
