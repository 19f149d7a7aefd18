//! One virtual machine per sandbox domain.
use super::vcpu::Vcpu;
use crate::{
    address_space::{AddressSpace, Slot},
    engine::IsolationEngine,
    package::{MemoryExtent, PackageId, SandboxDomain},
    prot::Prot,
    Error, Result,
};
use abyss::{
    addressing::{Gpa, PAGE_SIZE},
    kvm::{
        supported_xcr0, Kvm, KvmCpuidEntry2, KvmSregs, KvmUserspaceMemoryRegion, VmFd,
        CPUID_XSAVE_LEAF,
    },
    x86_64::{
        intrinsics,
        segmentation::Segment,
        Cr0, Cr4, Efer,
    },
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// Pages the hypervisor keeps for its real-mode task state segment.
const TSS_PAGES: usize = 3;

/// x87 state, always enabled in XCR0.
const XCR0_X87: u64 = 1;

/// Address space of a machine with the slots already given to the
/// hypervisor.
pub struct GuestMemory {
    pub space: AddressSpace,
    /// Installed guest physical ranges, start to end.
    installed: BTreeMap<usize, usize>,
    next_slot: u32,
    /// Bumped whenever a mapping changes; vcpus drop cached translations
    /// when they see a new value.
    generation: u64,
}

impl GuestMemory {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_installed(&self, slot: &Slot) -> bool {
        let start = slot.gpa.into_usize();
        self.installed
            .range(..=start)
            .next_back()
            .map_or(false, |(_, end)| start + slot.size <= *end)
    }
}

/// A VM whose guest physical memory mirrors the address space of one domain.
pub struct Machine {
    domain: SandboxDomain,
    vm: VmFd,
    memory: Mutex<GuestMemory>,
    cpuid: Vec<KvmCpuidEntry2>,
    /// XCR0 of every vcpu, when the host enables xsave.
    xcr0: Option<u64>,
    /// Guest address of the syscall stub.
    stub: u64,
    next_vcpu: AtomicU32,
}

impl Machine {
    /// Create the VM of `domain`: narrow a copy of `template`, map the
    /// syscall stub, build the page tables and install every slot.
    pub fn new(
        kvm: &Kvm,
        template: &AddressSpace,
        engine: &IsolationEngine,
        domain: &SandboxDomain,
        stub: usize,
    ) -> Result<Arc<Self>> {
        let vm = kvm.create_vm()?;
        let mut space = template.copy();
        space.narrow(engine, domain)?;
        space.extend(stub, PAGE_SIZE, Prot::RX)?;
        let tss = space.free_space_mut().malloc(TSS_PAGES * PAGE_SIZE)?;
        vm.set_tss_addr(tss.into_usize() as u64)?;
        space.finalize()?;

        let supported = kvm.supported_cpuid()?;
        let xcr0 = intrinsics::xgetbv(0).map(|host| guest_xcr0(host, supported_xcr0(&supported)));
        let cpuid = match xcr0 {
            Some(xcr0) => guest_cpuid(supported, xcr0),
            None => supported,
        };
        let machine = Arc::new(Self {
            domain: domain.clone(),
            vm,
            memory: Mutex::new(GuestMemory {
                space,
                installed: BTreeMap::new(),
                next_slot: 0,
                generation: 0,
            }),
            cpuid,
            xcr0,
            stub: stub as u64,
            next_vcpu: AtomicU32::new(0),
        });
        {
            let mut memory = machine.memory.lock();
            machine.sync_slots(&mut memory)?;
            tracing::debug!(
                domain = %domain.id,
                slots = memory.next_slot,
                xcr0 = ?xcr0,
                "machine created"
            );
        }
        Ok(machine)
    }

    pub fn domain(&self) -> &SandboxDomain {
        &self.domain
    }

    pub fn stub(&self) -> u64 {
        self.stub
    }

    pub fn cpuid(&self) -> &[KvmCpuidEntry2] {
        &self.cpuid
    }

    pub fn xcr0(&self) -> Option<u64> {
        self.xcr0
    }

    pub fn vm(&self) -> &VmFd {
        &self.vm
    }

    /// Lock the guest memory of this machine.
    pub fn memory(&self) -> MutexGuard<'_, GuestMemory> {
        self.memory.lock()
    }

    /// Like [`Machine::memory`], without blocking.
    pub fn try_memory(&self) -> Option<MutexGuard<'_, GuestMemory>> {
        self.memory.try_lock()
    }

    /// Root of the guest page tables.
    pub fn root(&self) -> Result<Gpa> {
        self.memory
            .lock()
            .space
            .page_table()
            .map(|pt| pt.root_gpa())
            .ok_or(Error::NotInitialized)
    }

    /// Give the hypervisor every slot of the address space it does not back
    /// yet.
    fn sync_slots(&self, memory: &mut GuestMemory) -> Result<()> {
        for slot in memory.space.slots() {
            if slot.size == 0 || memory.is_installed(&slot) {
                continue;
            }
            let region = KvmUserspaceMemoryRegion {
                slot: memory.next_slot,
                flags: 0,
                guest_phys_addr: slot.gpa.into_usize() as u64,
                memory_size: slot.size as u64,
                userspace_addr: slot.va.into_usize() as u64,
            };
            // Regions mirror live mappings of this process and page table
            // arenas owned by the address space, which outlives the VM.
            unsafe { self.vm.set_user_memory_region(&region)? };
            memory.next_slot += 1;
            memory
                .installed
                .insert(slot.gpa.into_usize(), slot.gpa.into_usize() + slot.size);
        }
        Ok(())
    }

    /// Apply the current owner of `extent`, `pkg`, to this domain: map it
    /// with the effective protection or unmap it.
    pub fn assign(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
        let prot = self.domain.effective(pkg, extent.prot);
        let mut memory = self.memory.lock();
        memory.generation += 1;
        memory.space.assign(extent.start, extent.size, prot)?;
        self.sync_slots(&mut memory)
    }

    /// Add the heap growth `extent`, owned by `pkg`, to this domain.
    pub fn grow(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
        let prot = self.domain.effective(pkg, extent.prot);
        let mut memory = self.memory.lock();
        memory.generation += 1;
        memory.space.grow(extent.start, extent.size, prot)?;
        self.sync_slots(&mut memory)
    }

    /// Create the next vcpu of this machine, ready to run on the calling
    /// thread.
    pub fn create_vcpu(self: &Arc<Self>) -> Result<Vcpu> {
        let id = self.next_vcpu.fetch_add(1, Ordering::Relaxed);
        let fd = self.vm.create_vcpu(id)?;
        tracing::debug!(domain = %self.domain.id, vcpu = id, "vcpu created");
        Vcpu::new(Arc::clone(self), fd)
    }
}

/// XCR0 of a guest: the host components the hypervisor can virtualize.
pub fn guest_xcr0(host: u64, supported: u64) -> u64 {
    host & supported | XCR0_X87
}

/// `supported` cpuid with the xsave leaf narrowed to the components of
/// `xcr0`.
pub fn guest_cpuid(mut supported: Vec<KvmCpuidEntry2>, xcr0: u64) -> Vec<KvmCpuidEntry2> {
    // Sub-leaves 2..63 describe one component each.
    supported.retain(|e| {
        e.function != CPUID_XSAVE_LEAF || !(2..64).contains(&e.index) || xcr0 & (1u64 << e.index) != 0
    });
    for e in supported
        .iter_mut()
        .filter(|e| e.function == CPUID_XSAVE_LEAF && e.index == 0)
    {
        e.eax = xcr0 as u32;
        e.edx = (xcr0 >> 32) as u32;
    }
    supported
}

/// Special registers of a 64-bit ring 0 guest running on page tables at
/// `root`.
pub fn guest_sregs(root: Gpa) -> KvmSregs {
    let mut cr4 = Cr4::PAE | Cr4::OSFXSR | Cr4::OSXMMEXCPT | Cr4::FSGSBASE;
    if intrinsics::has_osxsave() {
        cr4 |= Cr4::OSXSAVE;
    }
    let data = Segment::KernelData.register();
    let mut ldt = Segment::KernelData.register();
    ldt.selector = 0;
    ldt.unusable = 1;
    ldt.present = 0;
    KvmSregs {
        cs: Segment::KernelCode.register(),
        ds: data,
        es: data,
        fs: data,
        gs: data,
        ss: data,
        tr: Segment::Task.register(),
        ldt,
        cr0: (Cr0::PE | Cr0::MP | Cr0::ET | Cr0::NE | Cr0::WP | Cr0::PG).bits(),
        cr3: root.into_usize() as u64,
        cr4: cr4.bits(),
        efer: (Efer::SCE | Efer::LME | Efer::LMA | Efer::NXE).bits(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sregs_enter_long_mode() {
        let sregs = guest_sregs(Gpa::new(0x5000).unwrap());
        assert_eq!(sregs.cr3, 0x5000);
        assert_ne!(sregs.cr0 & Cr0::PG.bits(), 0);
        assert_ne!(sregs.efer & Efer::LMA.bits(), 0);
        assert_eq!(sregs.cs.l, 1);
        assert_eq!(sregs.ldt.unusable, 1);
        assert_eq!(sregs.idt.limit, 0);
    }

    #[test]
    fn xsave_features_follow_the_hypervisor() {
        // Host with avx-512 and amx tiles; the hypervisor offers no tiles.
        let host = 0x6_02e7;
        let supported = 0x2e7;
        let xcr0 = guest_xcr0(host, supported);
        assert_eq!(xcr0, 0x2e7);
        assert_eq!(guest_xcr0(0, 0), XCR0_X87);

        let leaf = |function, index, eax| KvmCpuidEntry2 {
            function,
            index,
            eax,
            ..Default::default()
        };
        let cpuid = guest_cpuid(
            vec![
                leaf(1, 0, 0x806f8),
                leaf(CPUID_XSAVE_LEAF, 0, 0x6_02e7),
                leaf(CPUID_XSAVE_LEAF, 1, 0xf),
                leaf(CPUID_XSAVE_LEAF, 2, 0x100),
                leaf(CPUID_XSAVE_LEAF, 9, 0x8),
                leaf(CPUID_XSAVE_LEAF, 17, 0x40),
                leaf(CPUID_XSAVE_LEAF, 18, 0x2000),
            ],
            xcr0,
        );
        assert_eq!(supported_xcr0(&cpuid), xcr0);
        let sub: Vec<u32> = cpuid
            .iter()
            .filter(|e| e.function == CPUID_XSAVE_LEAF)
            .map(|e| e.index)
            .collect();
        assert_eq!(sub, vec![0, 1, 2, 9]);
        assert_eq!(cpuid[0].eax, 0x806f8);
    }
}
