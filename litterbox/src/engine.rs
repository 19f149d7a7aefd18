//! Package and domain tables.
use crate::{
    package::{DomainId, MemoryExtent, Package, PackageId, SandboxDomain},
    prot::Prot,
    section::{RawDomain, RawPackage},
    syscall::SyscallClass,
    Error, Result,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Immutable description of every package and domain, plus the name table.
pub struct IsolationEngine {
    packages: BTreeMap<PackageId, Package>,
    domains: BTreeMap<DomainId, SandboxDomain>,
    names: RwLock<HashMap<String, PackageId>>,
}

impl IsolationEngine {
    /// Build the tables.
    ///
    /// Duplicate ids are errors. A name bound to several ids resolves to the
    /// one declared last. The pseudo-packages always exist.
    pub fn new(raw_packages: Vec<RawPackage>, raw_domains: Vec<RawDomain>) -> Result<Self> {
        let mut packages = BTreeMap::new();
        let mut names = HashMap::new();
        for raw in raw_packages {
            let id = PackageId(raw.id);
            if packages.contains_key(&id) {
                return Err(Error::DuplicatePackage(id));
            }
            if let Some(prev) = names.insert(raw.name.clone(), id) {
                tracing::warn!(name = %raw.name, %prev, now = %id, "package name rebound");
            }
            let statics = raw
                .sections
                .iter()
                .filter(|s| s.size != 0)
                .map(|s| MemoryExtent::new(s.addr, s.size, s.prot))
                .collect();
            packages.insert(id, Package::new(raw.name, id, statics));
        }
        for (id, name) in [(PackageId::RUNTIME, "runtime"), (PackageId::CGO, "cgo")] {
            packages
                .entry(id)
                .or_insert_with(|| Package::new(name, id, Vec::new()));
            names.entry(name.to_string()).or_insert(id);
        }

        let mut domains = BTreeMap::new();
        for raw in raw_domains {
            let id = DomainId(raw.id);
            if domains.contains_key(&id) {
                return Err(Error::DuplicateDomain(id));
            }
            let view = raw
                .resolved_view()
                .into_iter()
                .map(|(name, prot)| {
                    names
                        .get(&name)
                        .map(|id| (*id, prot))
                        .ok_or(Error::UnknownPackage(name))
                })
                .collect::<Result<BTreeMap<PackageId, Prot>>>()?;
            domains.insert(
                id,
                SandboxDomain {
                    id,
                    entry: raw.entry,
                    syscalls: SyscallClass::from_bits_truncate(raw.syscall_mask),
                    view,
                },
            );
        }
        tracing::debug!(
            packages = packages.len(),
            domains = domains.len(),
            "isolation tables built"
        );
        Ok(Self {
            packages,
            domains,
            names: RwLock::new(names),
        })
    }

    /// Build the tables from the serialized lists.
    pub fn from_json(packages: &str, domains: &str) -> Result<Self> {
        Self::new(
            crate::section::parse_packages(packages)?,
            crate::section::parse_domains(domains)?,
        )
    }

    pub fn package(&self, id: PackageId) -> Result<&Package> {
        self.packages.get(&id).ok_or(Error::UnknownPackageId(id))
    }

    pub fn package_by_name(&self, name: &str) -> Result<&Package> {
        let id = self
            .names
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownPackage(name.to_string()))?;
        self.package(id)
    }

    /// Bind `name` to package `id`, replacing any previous binding.
    pub fn bind_name(&self, id: PackageId, name: &str) -> Result<()> {
        self.package(id)?;
        if let Some(prev) = self.names.write().insert(name.to_string(), id) {
            if prev != id {
                tracing::warn!(%name, %prev, now = %id, "package name rebound");
            }
        }
        Ok(())
    }

    pub fn domain(&self, id: DomainId) -> Result<&SandboxDomain> {
        self.domains.get(&id).ok_or(Error::UnknownDomain(id))
    }

    /// Packages in id order.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    /// Domains in id order.
    pub fn domains(&self) -> impl Iterator<Item = &SandboxDomain> {
        self.domains.values()
    }

    /// Package owning `addr`.
    pub fn owner_of(&self, addr: usize) -> Option<PackageId> {
        self.packages.values().find(|p| p.owns(addr)).map(|p| p.id)
    }
}
