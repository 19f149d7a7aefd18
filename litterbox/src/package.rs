//! Packages and sandbox domains.
use crate::{
    interval::{IntervalList, VmArea},
    prot::Prot,
    syscall::SyscallClass,
    Error, Result,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Stable identifier of a package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(pub i64);

impl PackageId {
    /// The language runtime.
    pub const RUNTIME: Self = Self(-1);
    /// Foreign code reached through the C bridge.
    pub const CGO: Self = Self(-2);

    /// Whether this is one of the trusted pseudo-packages.
    #[inline]
    pub const fn is_pseudo(self) -> bool {
        self.0 == Self::RUNTIME.0 || self.0 == Self::CGO.0
    }
}

impl core::fmt::Display for PackageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::RUNTIME => write!(f, "package(runtime)"),
            Self::CGO => write!(f, "package(cgo)"),
            Self(id) => write!(f, "package({})", id),
        }
    }
}

/// Stable identifier of a sandbox domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

impl core::fmt::Display for DomainId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "domain({})", self.0)
    }
}

/// A range of memory owned by a package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryExtent {
    pub start: usize,
    pub size: usize,
    pub prot: Prot,
}

impl MemoryExtent {
    #[inline]
    pub const fn new(start: usize, size: usize, prot: Prot) -> Self {
        Self { start, size, prot }
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    pub const fn area(&self) -> VmArea {
        VmArea::new(self.start, self.size, self.prot)
    }
}

impl From<VmArea> for MemoryExtent {
    fn from(a: VmArea) -> Self {
        Self::new(a.start, a.size, a.prot)
    }
}

/// A unit of code and data the isolation is expressed in.
pub struct Package {
    pub name: String,
    pub id: PackageId,
    /// Sections known at load time.
    pub statics: Vec<MemoryExtent>,
    dynamics: RwLock<IntervalList>,
}

impl Package {
    pub fn new(name: impl Into<String>, id: PackageId, statics: Vec<MemoryExtent>) -> Self {
        Self {
            name: name.into(),
            id,
            statics,
            dynamics: RwLock::new(IntervalList::new()),
        }
    }

    /// Snapshot of the extents acquired at runtime.
    pub fn dynamics(&self) -> Vec<MemoryExtent> {
        self.dynamics.read().iter().copied().map(Into::into).collect()
    }

    /// Static and dynamic extents.
    pub fn extents(&self) -> Vec<MemoryExtent> {
        let mut all = self.statics.clone();
        all.extend(self.dynamics());
        all
    }

    /// Record a new dynamic extent.
    pub fn add_dynamic(&self, extent: MemoryExtent) -> Result<()> {
        self.dynamics.write().insert(extent.area())
    }

    /// Stop tracking `[start, start + size)` and return the extents it
    /// covered, with their protection.
    pub fn take_dynamic(&self, start: usize, size: usize) -> Result<Vec<MemoryExtent>> {
        let mut dynamics = self.dynamics.write();
        if !dynamics.covers(start, size) {
            return Err(Error::UntrackedExtent {
                owner: self.id,
                start,
                size,
            });
        }
        let end = start + size;
        let taken = dynamics
            .iter()
            .filter(|a| a.start < end && start < a.end())
            .map(|a| {
                let s = a.start.max(start);
                MemoryExtent::new(s, a.end().min(end) - s, a.prot)
            })
            .collect();
        dynamics.remove(VmArea::new(start, size, Prot::empty()));
        Ok(taken)
    }

    /// Whether the package owns `addr`, statically or dynamically.
    pub fn owns(&self, addr: usize) -> bool {
        self.statics.iter().any(|e| e.start <= addr && addr < e.end())
            || self.dynamics.read().find(addr).is_some()
    }
}

impl core::fmt::Debug for Package {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("statics", &self.statics)
            .field("dynamics", &*self.dynamics.read())
            .finish()
    }
}

/// An isolation domain: what a sandbox may touch and call.
#[derive(Clone, Debug)]
pub struct SandboxDomain {
    pub id: DomainId,
    /// Symbol the sandbox is entered through.
    pub entry: String,
    pub syscalls: SyscallClass,
    /// Access granted per package. Packages absent from the view are not
    /// accessible, except the pseudo-packages.
    pub view: BTreeMap<PackageId, Prot>,
}

impl SandboxDomain {
    /// Access the view grants on `pkg`.
    pub fn grant(&self, pkg: PackageId) -> Prot {
        match self.view.get(&pkg) {
            Some(p) => *p,
            None if pkg.is_pseudo() => Prot::ALL,
            None => Prot::empty(),
        }
    }

    /// Effective protection of an extent of `pkg` whose native protection is
    /// `native`.
    #[inline]
    pub fn effective(&self, pkg: PackageId, native: Prot) -> Prot {
        native.restrict(self.grant(pkg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_partial_dynamic() {
        let pkg = Package::new("p", PackageId(3), vec![]);
        pkg.add_dynamic(MemoryExtent::new(0x1000, 0x3000, Prot::RW)).unwrap();
        let taken = pkg.take_dynamic(0x2000, 0x1000).unwrap();
        assert_eq!(taken, vec![MemoryExtent::new(0x2000, 0x1000, Prot::RW)]);
        assert_eq!(
            pkg.dynamics(),
            vec![
                MemoryExtent::new(0x1000, 0x1000, Prot::RW),
                MemoryExtent::new(0x3000, 0x1000, Prot::RW)
            ]
        );
        assert!(matches!(
            pkg.take_dynamic(0x2000, 0x1000),
            Err(Error::UntrackedExtent { .. })
        ));
        assert!(pkg.owns(0x3800) && !pkg.owns(0x2800));
    }

    #[test]
    fn pseudo_packages_are_visible() {
        let domain = SandboxDomain {
            id: DomainId(1),
            entry: "main.f".into(),
            syscalls: SyscallClass::empty(),
            view: [(PackageId(4), Prot::R)].into_iter().collect(),
        };
        assert_eq!(domain.grant(PackageId::RUNTIME), Prot::ALL);
        assert_eq!(domain.grant(PackageId(5)), Prot::empty());
        assert_eq!(domain.effective(PackageId(4), Prot::RW | Prot::USER), Prot::R);
    }
}
