//! Decoding of the package and domain lists produced at build time.
//!
//! Packages: `[{name, id, sections: [{addr, size, prot}]}]`.
//! Domains: `[{id, entry, syscall_mask, packages: [name], view: {name: prot}, extras: [{name, prot}]}]`.
//!
//! A protection is either its raw bits or a string of `r`, `w`, `x`, `u`, `d`
//! and `f` characters, with `-` as filler.
use crate::prot::Prot;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// One section of a package.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RawSection {
    pub addr: usize,
    pub size: usize,
    #[serde(deserialize_with = "prot")]
    pub prot: Prot,
}

/// A package as emitted by the linker pass.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RawPackage {
    pub name: String,
    pub id: i64,
    #[serde(default)]
    pub sections: Vec<RawSection>,
}

/// Extra access granted by a domain.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RawExtra {
    pub name: String,
    #[serde(deserialize_with = "prot")]
    pub prot: Prot,
}

#[derive(Deserialize)]
struct ViewProt(#[serde(deserialize_with = "prot")] Prot);

/// A domain as emitted by the compiler pass.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RawDomain {
    pub id: u32,
    pub entry: String,
    #[serde(default)]
    pub syscall_mask: u32,
    /// Packages granted full access.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Per-package access, overriding `packages`.
    #[serde(default, deserialize_with = "view")]
    pub view: BTreeMap<String, Prot>,
    #[serde(default)]
    pub extras: Vec<RawExtra>,
}

impl RawDomain {
    /// Final view by name: listed packages get full access, then `view`
    /// and `extras` override in that order.
    pub fn resolved_view(&self) -> BTreeMap<String, Prot> {
        let mut view: BTreeMap<String, Prot> = self
            .packages
            .iter()
            .map(|n| (n.clone(), Prot::ALL))
            .collect();
        view.extend(self.view.iter().map(|(n, p)| (n.clone(), *p)));
        view.extend(self.extras.iter().map(|e| (e.name.clone(), e.prot)));
        view
    }
}

/// Decode a package list.
pub fn parse_packages(text: &str) -> crate::Result<Vec<RawPackage>> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a domain list.
pub fn parse_domains(text: &str) -> crate::Result<Vec<RawDomain>> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProtRepr {
    Bits(u8),
    Letters(String),
}

fn parse_letters(s: &str) -> Option<Prot> {
    s.chars().try_fold(Prot::empty(), |p, c| {
        Some(
            p | match c.to_ascii_lowercase() {
                'r' => Prot::R,
                'w' => Prot::W,
                'x' => Prot::X,
                'u' => Prot::USER,
                'd' => Prot::DYNAMIC,
                'f' => Prot::FAKE,
                '-' => Prot::empty(),
                _ => return None,
            },
        )
    })
}

fn prot<'de, D: Deserializer<'de>>(d: D) -> Result<Prot, D::Error> {
    match ProtRepr::deserialize(d)? {
        ProtRepr::Bits(b) => Prot::from_bits(b)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid protection bits {:#x}", b))),
        ProtRepr::Letters(s) => parse_letters(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid protection {:?}", s))),
    }
}

fn view<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, Prot>, D::Error> {
    let raw = BTreeMap::<String, ViewProt>::deserialize(d)?;
    Ok(raw.into_iter().map(|(k, v)| (k, v.0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_lists() {
        let pkgs = parse_packages(
            r#"[{"name":"main","id":0,"sections":[{"addr":4096,"size":8192,"prot":"r-x"}]},
                {"name":"runtime","id":-1,"sections":[{"addr":65536,"size":4096,"prot":3}]}]"#,
        )
        .unwrap();
        assert_eq!(pkgs[0].sections[0].prot, Prot::RX);
        assert_eq!(pkgs[1].sections[0].prot, Prot::RW);

        let doms = parse_domains(
            r#"[{"id":1,"entry":"main.sandbox1","syscall_mask":1,
                 "packages":["main","fmt"],"view":{"fmt":"r"},
                 "extras":[{"name":"os","prot":"rw"}]}]"#,
        )
        .unwrap();
        let view = doms[0].resolved_view();
        assert_eq!(view["main"], Prot::ALL);
        assert_eq!(view["fmt"], Prot::R);
        assert_eq!(view["os"], Prot::RW);
        assert!(parse_domains(r#"[{"id":1,"entry":"e","view":{"a":"z"}}]"#).is_err());
    }
}
