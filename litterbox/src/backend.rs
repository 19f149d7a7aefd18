//! Operations of the engine, independent of the enforcement backend.
//!
//! The instrumented program calls these at every sandbox boundary:
//! `prolog`/`epilog` around a sandboxed call, `execute` when a sandboxed
//! goroutine first runs, `register`/`transfer` when memory changes owner
//! and `runtime_growth` when the runtime maps more memory.
use crate::{
    config::{BackendKind, Config},
    engine::IsolationEngine,
    fatal,
    kvm::KvmBackend,
    package::{DomainId, MemoryExtent, Package, PackageId, SandboxDomain},
    pkey::{HostKeys, MpkBackend},
    prot::Prot,
    Error, Result,
};
use parking_lot::Mutex;
use std::{cell::Cell, sync::OnceLock};

/// Enforcement mechanism behind the facade.
///
/// Ownership bookkeeping happens in the facade; a backend only enforces it.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enter `domain` on the calling thread.
    fn prolog(&self, engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()>;

    /// Leave `domain` on the calling thread.
    fn epilog(&self, engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()>;

    /// Prepare `domain` for a thread about to run in it.
    fn execute(&self, engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()>;

    /// `extent` now belongs to `pkg`.
    fn register(&self, engine: &IsolationEngine, pkg: &Package, extent: MemoryExtent) -> Result<()>;

    /// `extent` moved from `from` to `to`.
    fn transfer(
        &self,
        engine: &IsolationEngine,
        from: &Package,
        to: &Package,
        extent: MemoryExtent,
    ) -> Result<()>;

    /// The runtime mapped `extent` on behalf of `pkg`.
    fn runtime_growth(
        &self,
        engine: &IsolationEngine,
        is_heap: bool,
        pkg: &Package,
        extent: MemoryExtent,
    ) -> Result<()>;
}

/// No enforcement, only bookkeeping.
pub struct Baseline;

impl Backend for Baseline {
    fn name(&self) -> &'static str {
        "baseline"
    }

    fn prolog(&self, _: &IsolationEngine, _: &SandboxDomain) -> Result<()> {
        Ok(())
    }

    fn epilog(&self, _: &IsolationEngine, _: &SandboxDomain) -> Result<()> {
        Ok(())
    }

    fn execute(&self, _: &IsolationEngine, _: &SandboxDomain) -> Result<()> {
        Ok(())
    }

    fn register(&self, _: &IsolationEngine, _: &Package, _: MemoryExtent) -> Result<()> {
        Ok(())
    }

    fn transfer(&self, _: &IsolationEngine, _: &Package, _: &Package, _: MemoryExtent) -> Result<()> {
        Ok(())
    }

    fn runtime_growth(&self, _: &IsolationEngine, _: bool, _: &Package, _: MemoryExtent) -> Result<()> {
        Ok(())
    }
}

/// Protection of memory acquired at runtime.
const DYNAMIC: Prot = Prot::from_bits_truncate(Prot::RW.bits() | Prot::USER.bits() | Prot::DYNAMIC.bits());

thread_local! {
    static ACTIVE: Cell<Option<DomainId>> = const { Cell::new(None) };
}

static INSTANCE: OnceLock<Litterbox> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// The isolation engine with its backend.
pub struct Litterbox {
    config: Config,
    engine: IsolationEngine,
    backend: Box<dyn Backend>,
}

impl Litterbox {
    /// Engine enforced by the backend `config` names.
    pub fn new(engine: IsolationEngine, config: Config) -> Result<Self> {
        let config = config.validate()?;
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Baseline => Box::new(Baseline),
            BackendKind::Mpk => Box::new(MpkBackend::new(&engine, &config, HostKeys::new()?)?),
            BackendKind::Kvm => Box::new(KvmBackend::new(&config)?),
        };
        Ok(Self::with_backend(engine, config, backend))
    }

    pub fn with_backend(engine: IsolationEngine, config: Config, backend: Box<dyn Backend>) -> Self {
        tracing::debug!(backend = backend.name(), "isolation engine initialized");
        Self {
            config,
            engine,
            backend,
        }
    }

    /// Decode the package and domain lists and build the engine.
    pub fn from_json(packages: &str, domains: &str, config: Config) -> Result<Self> {
        Self::new(IsolationEngine::from_json(packages, domains)?, config)
    }

    /// Initialize the process-wide engine, configured from the environment.
    ///
    /// The first call wins; later calls return the existing engine.
    pub fn try_init(packages: &str, domains: &str) -> Result<&'static Self> {
        Self::try_init_with(Config::from_env()?, packages, domains)
    }

    /// [`Litterbox::try_init`] with an explicit configuration.
    pub fn try_init_with(config: Config, packages: &str, domains: &str) -> Result<&'static Self> {
        let _guard = INIT.lock();
        if let Some(instance) = INSTANCE.get() {
            tracing::debug!("isolation engine already initialized");
            return Ok(instance);
        }
        let instance = Self::from_json(packages, domains, config)?;
        Ok(INSTANCE.get_or_init(|| instance))
    }

    /// [`Litterbox::try_init`], aborting on error.
    pub fn init(packages: &str, domains: &str) -> &'static Self {
        Self::try_init(packages, domains).unwrap_or_else(|e| fatal(e))
    }

    /// The process-wide engine.
    pub fn get() -> Result<&'static Self> {
        INSTANCE.get().ok_or(Error::NotInitialized)
    }

    pub fn engine(&self) -> &IsolationEngine {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    /// Domain the calling thread is inside.
    pub fn active() -> Option<DomainId> {
        ACTIVE.with(Cell::get)
    }

    pub fn try_prolog(&self, id: DomainId) -> Result<()> {
        let domain = self.engine.domain(id)?;
        if let Some(active) = Self::active() {
            return Err(Error::NestedEntry {
                active,
                entering: id,
            });
        }
        self.backend.prolog(&self.engine, domain)?;
        ACTIVE.with(|a| a.set(Some(id)));
        Ok(())
    }

    pub fn try_epilog(&self, id: DomainId) -> Result<()> {
        let active = Self::active();
        if active != Some(id) {
            return Err(Error::UnbalancedEpilog { active, leaving: id });
        }
        let domain = self.engine.domain(id)?;
        self.backend.epilog(&self.engine, domain)?;
        ACTIVE.with(|a| a.set(None));
        Ok(())
    }

    pub fn try_execute(&self, id: DomainId) -> Result<()> {
        let domain = self.engine.domain(id)?;
        self.backend.execute(&self.engine, domain)
    }

    /// Give `[start, start + size)` to `pkg`.
    pub fn try_register(&self, pkg: PackageId, start: usize, size: usize) -> Result<()> {
        if pkg.is_pseudo() {
            tracing::debug!(%pkg, start, size, "register on pseudo package skipped");
            return Ok(());
        }
        let package = self.engine.package(pkg)?;
        let extent = MemoryExtent::new(start, size, DYNAMIC);
        package.add_dynamic(extent)?;
        self.backend.register(&self.engine, package, extent)
    }

    /// Move `[start, start + size)` from `old` to `new`.
    pub fn try_transfer(&self, old: PackageId, new: PackageId, start: usize, size: usize) -> Result<()> {
        if old.is_pseudo() || new.is_pseudo() {
            tracing::debug!(%old, %new, start, size, "transfer on pseudo package skipped");
            return Ok(());
        }
        if old == new {
            return Err(Error::SelfTransfer {
                owner: old,
                start,
                size,
            });
        }
        let from = self.engine.package(old)?;
        let to = self.engine.package(new)?;
        for extent in from.take_dynamic(start, size)? {
            to.add_dynamic(extent)?;
            self.backend.transfer(&self.engine, from, to, extent)?;
        }
        Ok(())
    }

    /// The runtime mapped `[start, start + size)` for `pkg`.
    pub fn try_runtime_growth(&self, is_heap: bool, pkg: PackageId, start: usize, size: usize) -> Result<()> {
        let package = self.engine.package(pkg)?;
        let extent = MemoryExtent::new(start, size, DYNAMIC);
        if !pkg.is_pseudo() {
            package.add_dynamic(extent)?;
        }
        self.backend
            .runtime_growth(&self.engine, is_heap, package, extent)
    }

    pub fn prolog(&self, id: DomainId) {
        self.try_prolog(id).unwrap_or_else(|e| fatal(e))
    }

    pub fn epilog(&self, id: DomainId) {
        self.try_epilog(id).unwrap_or_else(|e| fatal(e))
    }

    pub fn execute(&self, id: DomainId) {
        self.try_execute(id).unwrap_or_else(|e| fatal(e))
    }

    pub fn register(&self, pkg: PackageId, start: usize, size: usize) {
        self.try_register(pkg, start, size)
            .unwrap_or_else(|e| fatal(e))
    }

    pub fn transfer(&self, old: PackageId, new: PackageId, start: usize, size: usize) {
        self.try_transfer(old, new, start, size)
            .unwrap_or_else(|e| fatal(e))
    }

    pub fn runtime_growth(&self, is_heap: bool, pkg: PackageId, start: usize, size: usize) {
        self.try_runtime_growth(is_heap, pkg, start, size)
            .unwrap_or_else(|e| fatal(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKAGES: &str = r#"[
        {"name":"main","id":0,"sections":[{"addr":4096,"size":4096,"prot":"rwu"}]},
        {"name":"lib","id":1,"sections":[{"addr":8192,"size":4096,"prot":"ru"}]}]"#;
    const DOMAINS: &str = r#"[{"id":1,"entry":"main.sandboxed","packages":["lib"]}]"#;

    fn baseline() -> Litterbox {
        Litterbox::from_json(PACKAGES, DOMAINS, Config::default()).unwrap()
    }

    #[test]
    fn entry_must_be_balanced() {
        let lb = baseline();
        assert!(matches!(
            lb.try_epilog(DomainId(1)),
            Err(Error::UnbalancedEpilog { active: None, .. })
        ));
        lb.try_prolog(DomainId(1)).unwrap();
        assert_eq!(Litterbox::active(), Some(DomainId(1)));
        assert!(matches!(
            lb.try_prolog(DomainId(1)),
            Err(Error::NestedEntry { .. })
        ));
        lb.try_epilog(DomainId(1)).unwrap();
        assert_eq!(Litterbox::active(), None);
        assert!(matches!(
            lb.try_prolog(DomainId(9)),
            Err(Error::UnknownDomain(DomainId(9)))
        ));
    }

    #[test]
    fn ownership_moves_with_transfer() {
        let lb = baseline();
        let (main, lib) = (PackageId(0), PackageId(1));
        lb.try_register(main, 0x10_0000, 0x2000).unwrap();
        lb.try_transfer(main, lib, 0x10_1000, 0x1000).unwrap();
        assert_eq!(lb.engine().owner_of(0x10_0000), Some(main));
        assert_eq!(lb.engine().owner_of(0x10_1000), Some(lib));

        assert!(matches!(
            lb.try_transfer(lib, lib, 0x10_1000, 0x1000),
            Err(Error::SelfTransfer { .. })
        ));
        assert!(matches!(
            lb.try_transfer(main, lib, 0x10_1000, 0x1000),
            Err(Error::UntrackedExtent { .. })
        ));
        // Pseudo packages are deliberate no-ops.
        lb.try_register(PackageId::RUNTIME, 0x20_0000, 0x1000).unwrap();
        lb.try_transfer(PackageId::CGO, lib, 0x10_1000, 0x1000).unwrap();
        assert_eq!(lb.engine().owner_of(0x20_0000), None);
        assert_eq!(lb.engine().owner_of(0x10_1000), Some(lib));
    }

    #[test]
    fn growth_is_tracked_for_real_packages() {
        let lb = baseline();
        lb.try_runtime_growth(true, PackageId(1), 0x30_0000, 0x1000)
            .unwrap();
        lb.try_runtime_growth(true, PackageId::RUNTIME, 0x31_0000, 0x1000)
            .unwrap();
        assert_eq!(lb.engine().owner_of(0x30_0000), Some(PackageId(1)));
        assert_eq!(lb.engine().owner_of(0x31_0000), None);
        lb.try_execute(DomainId(1)).unwrap();
    }

    #[test]
    fn first_init_wins() {
        let first = Litterbox::try_init_with(Config::default(), PACKAGES, DOMAINS).unwrap();
        let second = Litterbox::try_init_with(Config::default(), "[]", "[]").unwrap();
        assert!(core::ptr::eq(first, second));
        assert!(second.engine().package_by_name("lib").is_ok());
        assert!(core::ptr::eq(Litterbox::get().unwrap(), first));
    }
}
