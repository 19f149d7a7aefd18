use super::{vcpu, Machine};
use crate::{
    address_space::AddressSpace,
    backend::Backend,
    config::Config,
    engine::IsolationEngine,
    package::{DomainId, MemoryExtent, Package, PackageId, SandboxDomain},
    Result,
};
use abyss::{
    kvm::Kvm,
    mm::{self, MemoryMap, Pages},
    trampoline::SYSCALL_STUB,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// Guest memory of one domain that follows ownership changes.
pub trait LiveSpace: Send + Sync {
    /// `extent` now belongs to `pkg`.
    fn assign(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()>;

    /// The runtime heap grew by `extent` on behalf of `pkg`.
    fn grow(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()>;
}

impl LiveSpace for Machine {
    fn assign(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
        Machine::assign(self, pkg, extent)
    }

    fn grow(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
        Machine::grow(self, pkg, extent)
    }
}

/// The template space and the live space of every domain entered so far.
///
/// Changes land in the template first, so spaces created later start from
/// them, then in every live space.
pub struct Spaces<S> {
    template: Mutex<AddressSpace>,
    live: Mutex<HashMap<DomainId, Arc<S>>>,
}

impl<S: LiveSpace> Spaces<S> {
    pub fn new(template: AddressSpace) -> Self {
        Self {
            template: Mutex::new(template),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Live space of `domain`, built from the template by `create` on first
    /// use.
    pub fn get_or_create(
        &self,
        domain: DomainId,
        create: impl FnOnce(&AddressSpace) -> Result<Arc<S>>,
    ) -> Result<Arc<S>> {
        let mut live = self.live.lock();
        if let Some(space) = live.get(&domain) {
            return Ok(Arc::clone(space));
        }
        let space = create(&self.template.lock())?;
        live.insert(domain, Arc::clone(&space));
        Ok(space)
    }

    pub fn live(&self) -> Vec<Arc<S>> {
        self.live.lock().values().cloned().collect()
    }

    /// Record the new owner of `extent` everywhere.
    pub fn assign(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
        self.template
            .lock()
            .assign(extent.start, extent.size, extent.prot)?;
        for space in self.live() {
            space.assign(pkg, extent)?;
        }
        Ok(())
    }

    /// Add the heap growth `extent` everywhere.
    pub fn grow(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
        self.template
            .lock()
            .grow(extent.start, extent.size, extent.prot)?;
        for space in self.live() {
            space.grow(pkg, extent)?;
        }
        Ok(())
    }
}

/// Isolation through hardware virtualization.
///
/// Machines are built lazily, on the first `execute` or `prolog` of their
/// domain, from the template captured at start-up. Everything that touches
/// page tables or the hypervisor runs on the host, also when called from
/// inside a guest.
pub struct KvmBackend {
    kvm: Kvm,
    spaces: Spaces<Machine>,
    stub: Pages,
}

impl KvmBackend {
    pub fn new(config: &Config) -> Result<Self> {
        let kvm = Kvm::open()?;
        let mut stub = Pages::new(1)?;
        stub.as_mut_slice()[..SYSCALL_STUB.len()].copy_from_slice(&SYSCALL_STUB);
        // The page is private to the backend.
        unsafe { mm::mprotect(stub.va(), stub.len(), mm::prot::READ | mm::prot::EXEC)? };
        let template = AddressSpace::template(&MemoryMap::current()?, config)?;
        vcpu::install_handler()?;
        tracing::debug!(stub = %stub.va(), "kvm backend ready");
        Ok(Self {
            kvm,
            spaces: Spaces::new(template),
            stub,
        })
    }

    /// Machine of `domain`, created on first use.
    pub fn machine(&self, engine: &IsolationEngine, domain: &SandboxDomain) -> Result<Arc<Machine>> {
        vcpu::with_host(|| {
            self.spaces.get_or_create(domain.id, |template| {
                Machine::new(&self.kvm, template, engine, domain, self.stub.va().into_usize())
            })
        })
    }
}

impl Backend for KvmBackend {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn prolog(&self, engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()> {
        let machine = self.machine(engine, domain)?;
        vcpu::enter(&machine)
    }

    fn epilog(&self, _engine: &IsolationEngine, _domain: &SandboxDomain) -> Result<()> {
        vcpu::leave();
        Ok(())
    }

    fn execute(&self, engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()> {
        self.machine(engine, domain).map(|_| ())
    }

    fn register(&self, _engine: &IsolationEngine, pkg: &Package, extent: MemoryExtent) -> Result<()> {
        vcpu::with_host(|| self.spaces.assign(pkg.id, extent))
    }

    fn transfer(
        &self,
        _engine: &IsolationEngine,
        _from: &Package,
        to: &Package,
        extent: MemoryExtent,
    ) -> Result<()> {
        vcpu::with_host(|| self.spaces.assign(to.id, extent))
    }

    fn runtime_growth(
        &self,
        _engine: &IsolationEngine,
        is_heap: bool,
        pkg: &Package,
        extent: MemoryExtent,
    ) -> Result<()> {
        tracing::trace!(is_heap, owner = %pkg.id, start = extent.start, size = extent.size, "runtime growth");
        vcpu::with_host(|| {
            if is_heap {
                self.spaces.grow(pkg.id, extent)
            } else {
                self.spaces.assign(pkg.id, extent)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prot::Prot;
    use crate::page_table::PteFlags;

    const MAPS: &str = "\
00400000-00402000 r-xp 00000000 fd:01 1 /bin/app
00402000-00404000 rw-p 00002000 fd:01 1 /bin/app
00404000-00408000 rw-p 00000000 00:00 0
";

    /// Address space of one domain, kept up to date like a machine's.
    struct Space {
        domain: SandboxDomain,
        space: Mutex<AddressSpace>,
    }

    impl LiveSpace for Space {
        fn assign(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
            let prot = self.domain.effective(pkg, extent.prot);
            self.space.lock().assign(extent.start, extent.size, prot)
        }

        fn grow(&self, pkg: PackageId, extent: MemoryExtent) -> Result<()> {
            let prot = self.domain.effective(pkg, extent.prot);
            self.space.lock().grow(extent.start, extent.size, prot)
        }
    }

    fn setup() -> (IsolationEngine, Spaces<Space>) {
        let engine = IsolationEngine::from_json(
            r#"[{"name":"a","id":0,"sections":[{"addr":4202496,"size":4096,"prot":"rw"}]},
                {"name":"b","id":1,"sections":[{"addr":4210688,"size":8192,"prot":"rw"}]}]"#,
            r#"[{"id":1,"entry":"main.f","view":{"a":"rw"}},
                {"id":2,"entry":"main.g","view":{"b":"r"}},
                {"id":3,"entry":"main.h","view":{}}]"#,
        )
        .unwrap();
        let config = Config {
            arena_pages: 4,
            ..Config::default()
        };
        let template = AddressSpace::template(&MemoryMap::parse(MAPS).unwrap(), &config).unwrap();
        (engine, Spaces::new(template))
    }

    fn live(engine: &IsolationEngine, spaces: &Spaces<Space>, id: u32) -> Arc<Space> {
        let domain = engine.domain(DomainId(id)).unwrap();
        spaces
            .get_or_create(domain.id, |template| {
                Ok(Arc::new(Space {
                    domain: domain.clone(),
                    space: Mutex::new(AddressSpace::apply_domain(template, engine, domain)?),
                }))
            })
            .unwrap()
    }

    fn leaf(space: &Space, va: usize) -> Option<PteFlags> {
        let space = space.space.lock();
        space.page_table().unwrap().translate(va).map(|e| e.flags())
    }

    #[test]
    fn assignment_reaches_every_live_space() {
        let (engine, spaces) = setup();
        let (one, two) = (live(&engine, &spaces, 1), live(&engine, &spaces, 2));
        assert!(Arc::ptr_eq(&one, &live(&engine, &spaces, 1)));
        assert_eq!(spaces.live().len(), 2);

        let extent = MemoryExtent::new(0x40_6000, 0x1000, Prot::RW | Prot::USER | Prot::DYNAMIC);
        spaces.assign(PackageId(0), extent).unwrap();
        assert!(leaf(&one, 0x40_6000).unwrap().contains(PteFlags::RW));
        assert_eq!(leaf(&two, 0x40_6000), None);
        assert!(two.space.lock().valid_address(0x40_7000));

        spaces.assign(PackageId(1), extent).unwrap();
        assert_eq!(leaf(&one, 0x40_6000), None);
        let flags = leaf(&two, 0x40_6000).unwrap();
        assert!(flags.contains(PteFlags::P));
        assert!(!flags.contains(PteFlags::RW));
    }

    #[test]
    fn heap_growth_reaches_live_and_later_spaces() {
        let (engine, spaces) = setup();
        let (one, two) = (live(&engine, &spaces, 1), live(&engine, &spaces, 2));

        let extent = MemoryExtent::new(0x80_0000, 0x2000, Prot::RW | Prot::USER | Prot::DYNAMIC);
        spaces.grow(PackageId::RUNTIME, extent).unwrap();
        for space in [&one, &two] {
            assert!(space.space.lock().valid_address(0x80_1000));
            assert!(leaf(space, 0x80_1000).unwrap().contains(PteFlags::RW));
        }

        // Owned by a package the second domain cannot see: the region is
        // there, the pages are not.
        let owned = MemoryExtent::new(0x90_0000, 0x1000, Prot::RW | Prot::USER | Prot::DYNAMIC);
        spaces.grow(PackageId(0), owned).unwrap();
        assert!(leaf(&one, 0x90_0000).is_some());
        assert!(two.space.lock().covers(0x90_0000));
        assert_eq!(leaf(&two, 0x90_0000), None);

        let three = live(&engine, &spaces, 3);
        assert!(three.space.lock().valid_address(0x80_0000));
        assert!(leaf(&three, 0x80_0000).is_some());
    }
}
