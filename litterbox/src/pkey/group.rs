//! Grouping of packages onto protection keys.
//!
//! Two packages can share a key when every domain sees them the same way. A
//! package's signature is the list of `(domain, access)` pairs of the domains
//! that grant it anything, ordered by domain id; packages with equal
//! signatures form one group.
use crate::{
    engine::IsolationEngine,
    package::{DomainId, PackageId, SandboxDomain},
    prot::Prot,
    Error, Result,
};
use abyss::x86_64::pkru::{KeyAccess, Pkru};
use std::collections::{BTreeMap, BTreeSet};

type Signature = Vec<(DomainId, Prot)>;

/// Packages sharing one protection key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtectionKeyGroup {
    pub packages: BTreeSet<PackageId>,
    signature: Signature,
}

impl ProtectionKeyGroup {
    /// Access `domain` has to this group.
    pub fn access(&self, domain: DomainId) -> KeyAccess {
        let prot = self
            .signature
            .iter()
            .find(|(d, _)| *d == domain)
            .map_or(Prot::empty(), |(_, p)| *p);
        if prot.contains(Prot::W) {
            KeyAccess::ReadWrite
        } else if prot.contains(Prot::R) {
            KeyAccess::ReadOnly
        } else {
            KeyAccess::None
        }
    }
}

/// Result of grouping every non-pseudo package.
#[derive(Clone, Debug, Default)]
pub struct KeyGroups {
    groups: Vec<ProtectionKeyGroup>,
    group_of: BTreeMap<PackageId, usize>,
}

impl KeyGroups {
    /// Group the packages of `engine` and check the result fits `budget`.
    pub fn compute(engine: &IsolationEngine, budget: usize) -> Result<Self> {
        let domains: Vec<&SandboxDomain> = engine.domains().collect();
        let mut appears_in: BTreeMap<PackageId, Signature> = engine
            .packages()
            .filter(|p| !p.id.is_pseudo())
            .map(|p| {
                let sig = domains
                    .iter()
                    .filter_map(|d| {
                        let access = d.grant(p.id).access();
                        (!access.is_empty()).then(|| (d.id, access))
                    })
                    .collect();
                (p.id, sig)
            })
            .collect();

        let mut groups = Vec::new();
        let mut group_of = BTreeMap::new();
        while let Some((first, signature)) = appears_in.pop_first() {
            let mut packages = BTreeSet::from([first]);
            appears_in.retain(|id, sig| {
                if *sig == signature {
                    packages.insert(*id);
                    false
                } else {
                    true
                }
            });
            for id in &packages {
                group_of.insert(*id, groups.len());
            }
            groups.push(ProtectionKeyGroup {
                packages,
                signature,
            });
        }

        if groups.len() > budget {
            return Err(Error::KeyExhaustion {
                groups: groups.len(),
                budget,
            });
        }
        tracing::debug!(groups = groups.len(), budget, "packages grouped onto keys");
        Ok(Self { groups, group_of })
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[ProtectionKeyGroup] {
        &self.groups
    }

    /// Index of the group holding `pkg`.
    pub fn group_of(&self, pkg: PackageId) -> Option<usize> {
        self.group_of.get(&pkg).copied()
    }

    /// PKRU value of `domain` when group `i` is tagged with `keys[i]`.
    ///
    /// Every key starts without access; the default key 0 stays open.
    pub fn pkru(&self, domain: DomainId, keys: &[u32]) -> Pkru {
        self.groups
            .iter()
            .zip(keys)
            .fold(Pkru::DENY_ALL, |pkru, (group, key)| {
                pkru.with_access(*key, group.access(domain))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(domains: &str) -> IsolationEngine {
        IsolationEngine::from_json(
            r#"[{"name":"p1","id":1},{"name":"p2","id":2},{"name":"p3","id":3}]"#,
            domains,
        )
        .unwrap()
    }

    #[test]
    fn identical_views_share_a_key() {
        let engine = engine(
            r#"[{"id":1,"entry":"a","packages":["p1","p2"]},
                {"id":2,"entry":"b","packages":["p1"]}]"#,
        );
        let groups = KeyGroups::compute(&engine, 15).unwrap();
        // {p1}, {p2}, and the unreferenced {p3}.
        assert_eq!(groups.len(), 3);
        assert_ne!(groups.group_of(PackageId(1)), groups.group_of(PackageId(2)));
        assert_eq!(groups.group_of(PackageId::RUNTIME), None);
    }

    #[test]
    fn permission_is_part_of_the_signature() {
        let engine = engine(
            r#"[{"id":1,"entry":"a","view":{"p1":"rw","p2":"r","p3":"rw"}}]"#,
        );
        let groups = KeyGroups::compute(&engine, 15).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.group_of(PackageId(1)), groups.group_of(PackageId(3)));

        let pkru = groups.pkru(DomainId(1), &[1, 2]);
        let p1 = groups.group_of(PackageId(1)).unwrap();
        let p2 = groups.group_of(PackageId(2)).unwrap();
        assert_eq!(pkru.access([1, 2][p1]), KeyAccess::ReadWrite);
        assert_eq!(pkru.access([1, 2][p2]), KeyAccess::ReadOnly);
        assert_eq!(pkru.access(0), KeyAccess::ReadWrite);
        assert_eq!(pkru.access(3), KeyAccess::None);
        assert_eq!(groups.pkru(DomainId(9), &[1, 2]).access(1), KeyAccess::None);
    }

    #[test]
    fn budget_is_enforced() {
        let engine = engine(
            r#"[{"id":1,"entry":"a","packages":["p1"]},{"id":2,"entry":"b","packages":["p2"]}]"#,
        );
        assert!(matches!(
            KeyGroups::compute(&engine, 2),
            Err(Error::KeyExhaustion { groups: 3, budget: 2 })
        ));
    }
}
