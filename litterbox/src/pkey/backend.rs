use super::KeyGroups;
use crate::{
    backend::Backend,
    config::Config,
    engine::IsolationEngine,
    package::{DomainId, MemoryExtent, Package, SandboxDomain},
    prot::Prot,
    Error, Result,
};
use abyss::{
    addressing::{page_down, page_up, Va},
    mm,
    x86_64::{intrinsics, pkru::Pkru},
};
use std::{collections::BTreeMap, io};

/// Access to protection key hardware.
pub trait KeyHardware: Send + Sync {
    /// Allocate a fresh key.
    fn alloc_key(&self) -> io::Result<u32>;
    /// Release a key allocated by [`KeyHardware::alloc_key`].
    fn free_key(&self, key: u32) -> io::Result<()>;
    /// Tag `[start, start + size)` with `key` and protection `prot`.
    fn tag(&self, start: usize, size: usize, prot: Prot, key: u32) -> io::Result<()>;
    /// Load the PKRU of the current thread.
    fn write_pkru(&self, pkru: Pkru);
    /// Read the PKRU of the current thread.
    fn read_pkru(&self) -> Pkru;
}

/// Protection keys of the running cpu.
pub struct HostKeys(());

impl HostKeys {
    /// Fails unless the cpu and the kernel support protection keys.
    pub fn new() -> Result<Self> {
        if intrinsics::has_pku() {
            Ok(Self(()))
        } else {
            Err(Error::Unsupported("protection keys"))
        }
    }
}

impl KeyHardware for HostKeys {
    fn alloc_key(&self) -> io::Result<u32> {
        mm::pkey_alloc()
    }

    fn free_key(&self, key: u32) -> io::Result<()> {
        mm::pkey_free(key)
    }

    fn tag(&self, start: usize, size: usize, prot: Prot, key: u32) -> io::Result<()> {
        let (from, to) = (page_down(start), page_up(start + size));
        let va = Va::new(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-canonical extent"))?;
        // The engine only retags memory owned by packages, never its own.
        unsafe { mm::pkey_mprotect(va, to - from, prot.to_mprotect(), key) }
    }

    fn write_pkru(&self, pkru: Pkru) {
        // Presence of the feature is checked in `new`.
        unsafe { pkru.apply() }
    }

    fn read_pkru(&self) -> Pkru {
        unsafe { Pkru::current() }
    }
}

/// Isolation through memory protection keys.
pub struct MpkBackend<H: KeyHardware = HostKeys> {
    hw: H,
    groups: KeyGroups,
    keys: Vec<u32>,
    pkru: BTreeMap<DomainId, Pkru>,
}

impl<H: KeyHardware> MpkBackend<H> {
    /// Group the packages, allocate one key per group and tag every known
    /// extent.
    pub fn new(engine: &IsolationEngine, config: &Config, hw: H) -> Result<Self> {
        let groups = KeyGroups::compute(engine, config.key_budget)?;
        let keys = (0..groups.len())
            .map(|_| hw.alloc_key())
            .collect::<io::Result<Vec<_>>>()?;
        tracing::debug!(?keys, "protection keys allocated");

        let pkru = engine
            .domains()
            .map(|d| (d.id, groups.pkru(d.id, &keys)))
            .collect();
        let backend = Self {
            hw,
            groups,
            keys,
            pkru,
        };
        for pkg in engine.packages() {
            for extent in pkg.extents() {
                backend.tag(pkg, extent)?;
            }
        }
        Ok(backend)
    }

    /// Key of the group `pkg` belongs to.
    pub fn key_of(&self, pkg: &Package) -> Option<u32> {
        self.groups.group_of(pkg.id).map(|g| self.keys[g])
    }

    /// PKRU value loaded on entry to `domain`.
    pub fn pkru_of(&self, domain: DomainId) -> Option<Pkru> {
        self.pkru.get(&domain).copied()
    }

    pub fn groups(&self) -> &KeyGroups {
        &self.groups
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Load the permissions of `domain` into the calling thread.
    fn switch_to(&self, domain: &SandboxDomain) -> Result<()> {
        let pkru = self.pkru_of(domain.id).ok_or(Error::UnknownDomain(domain.id))?;
        self.hw.write_pkru(pkru);
        Ok(())
    }

    /// Tag `extent` with the key of `pkg`. Extents of ungrouped packages
    /// stay untagged.
    fn tag(&self, pkg: &Package, extent: MemoryExtent) -> Result<()> {
        match self.key_of(pkg) {
            Some(key) => Ok(self.hw.tag(extent.start, extent.size, extent.prot, key)?),
            None => Ok(()),
        }
    }
}

impl<H: KeyHardware> Drop for MpkBackend<H> {
    fn drop(&mut self) {
        for key in &self.keys {
            if let Err(e) = self.hw.free_key(*key) {
                tracing::warn!(key, error = %e, "failed to free protection key");
            }
        }
    }
}

impl<H: KeyHardware> Backend for MpkBackend<H> {
    fn name(&self) -> &'static str {
        "mpk"
    }

    fn prolog(&self, _engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()> {
        self.switch_to(domain)
    }

    fn epilog(&self, _engine: &IsolationEngine, _domain: &SandboxDomain) -> Result<()> {
        self.hw.write_pkru(Pkru::ALLOW_ALL);
        Ok(())
    }

    fn execute(&self, _engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()> {
        self.switch_to(domain)
    }

    fn register(&self, _engine: &IsolationEngine, pkg: &Package, extent: MemoryExtent) -> Result<()> {
        self.tag(pkg, extent)
    }

    fn transfer(
        &self,
        _engine: &IsolationEngine,
        _from: &Package,
        to: &Package,
        extent: MemoryExtent,
    ) -> Result<()> {
        match self.key_of(to) {
            Some(key) => Ok(self.hw.tag(extent.start, extent.size, extent.prot, key)?),
            None => Ok(self.hw.tag(extent.start, extent.size, extent.prot, 0)?),
        }
    }

    fn runtime_growth(
        &self,
        _engine: &IsolationEngine,
        _is_heap: bool,
        pkg: &Package,
        extent: MemoryExtent,
    ) -> Result<()> {
        self.tag(pkg, extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeKeys {
        next: AtomicU32,
        tags: Mutex<Vec<(usize, usize, u32)>>,
        pkru: Mutex<Option<Pkru>>,
    }

    impl KeyHardware for FakeKeys {
        fn alloc_key(&self) -> io::Result<u32> {
            Ok(self.next.fetch_add(1, Ordering::Relaxed) + 1)
        }
        fn free_key(&self, _key: u32) -> io::Result<()> {
            Ok(())
        }
        fn tag(&self, start: usize, size: usize, _prot: Prot, key: u32) -> io::Result<()> {
            self.tags.lock().push((start, size, key));
            Ok(())
        }
        fn write_pkru(&self, pkru: Pkru) {
            *self.pkru.lock() = Some(pkru);
        }
        fn read_pkru(&self) -> Pkru {
            self.pkru.lock().unwrap_or(Pkru::ALLOW_ALL)
        }
    }

    #[test]
    fn tags_at_start_and_switches_pkru() {
        let engine = IsolationEngine::from_json(
            r#"[{"name":"a","id":0,"sections":[{"addr":4096,"size":4096,"prot":"rw"}]},
                {"name":"b","id":1,"sections":[{"addr":8192,"size":4096,"prot":"r"}]},
                {"name":"runtime","id":-1,"sections":[{"addr":12288,"size":4096,"prot":"rw"}]}]"#,
            r#"[{"id":1,"entry":"f","packages":["a"]}]"#,
        )
        .unwrap();
        let mpk = MpkBackend::new(&engine, &Config::default(), FakeKeys::default()).unwrap();
        let a = engine.package_by_name("a").unwrap();
        let b = engine.package_by_name("b").unwrap();
        assert_eq!(mpk.key_of(a), Some(1));
        assert_eq!(mpk.key_of(b), Some(2));
        assert_eq!(*mpk.hardware().tags.lock(), vec![(4096, 4096, 1), (8192, 4096, 2)]);

        let domain = engine.domain(DomainId(1)).unwrap();
        mpk.prolog(&engine, domain).unwrap();
        let pkru = mpk.hardware().read_pkru();
        assert_eq!(pkru.access(1), abyss::x86_64::pkru::KeyAccess::ReadWrite);
        assert_eq!(pkru.access(2), abyss::x86_64::pkru::KeyAccess::None);
        mpk.epilog(&engine, domain).unwrap();
        assert_eq!(mpk.hardware().read_pkru(), Pkru::ALLOW_ALL);

        mpk.transfer(&engine, a, b, MemoryExtent::new(0x10000, 0x1000, Prot::RW)).unwrap();
        assert_eq!(mpk.hardware().tags.lock().last(), Some(&(0x10000, 0x1000, 2)));
    }

    #[test]
    fn execute_loads_domain_permissions() {
        let engine = IsolationEngine::from_json(
            r#"[{"name":"a","id":0,"sections":[{"addr":4096,"size":4096,"prot":"rw"}]},
                {"name":"b","id":1,"sections":[{"addr":8192,"size":4096,"prot":"rw"}]}]"#,
            r#"[{"id":1,"entry":"f","packages":["a"]},
                {"id":2,"entry":"g","view":{"b":"r"}}]"#,
        )
        .unwrap();
        let mpk = MpkBackend::new(&engine, &Config::default(), FakeKeys::default()).unwrap();
        let (one, two) = (engine.domain(DomainId(1)).unwrap(), engine.domain(DomainId(2)).unwrap());

        mpk.prolog(&engine, one).unwrap();
        mpk.epilog(&engine, one).unwrap();
        assert_eq!(mpk.hardware().read_pkru(), Pkru::ALLOW_ALL);

        mpk.execute(&engine, two).unwrap();
        let pkru = mpk.hardware().read_pkru();
        assert_eq!(Some(pkru), mpk.pkru_of(DomainId(2)));
        assert_ne!(pkru, Pkru::ALLOW_ALL);
        let b = engine.package_by_name("b").unwrap();
        let key = mpk.key_of(b).unwrap();
        assert_eq!(pkru.access(key), abyss::x86_64::pkru::KeyAccess::ReadOnly);

        let mut stranger = two.clone();
        stranger.id = DomainId(9);
        assert!(matches!(
            mpk.execute(&engine, &stranger),
            Err(Error::UnknownDomain(DomainId(9)))
        ));
        assert_eq!(mpk.hardware().read_pkru(), pkru);
    }
}
