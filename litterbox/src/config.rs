//! Engine configuration.
use crate::Error;
use serde::Deserialize;

/// Enforcement mechanism.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum BackendKind {
    /// No enforcement, ownership tracking only.
    #[default]
    Baseline,
    /// Memory protection keys.
    Mpk,
    /// Hardware virtualization through KVM.
    Kvm,
}

impl core::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "baseline" | "none" => Ok(BackendKind::Baseline),
            "mpk" => Ok(BackendKind::Mpk),
            "kvm" | "vtx" => Ok(BackendKind::Kvm),
            other => Err(format!("unknown backend {:?}", other)),
        }
    }
}

/// A host range.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub size: usize,
}

/// Engine configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Enforcement mechanism.
    pub backend: BackendKind,
    /// Usable protection keys, key 0 excluded.
    pub key_budget: usize,
    /// Pages per page-table arena.
    pub arena_pages: usize,
    /// Guest physical addresses below `1 << window_bits` map the host address
    /// of the same value.
    pub window_bits: u32,
    /// Runtime heap range, classified as a heap region.
    pub heap: Option<Span>,
    /// Nothing below this address is placed into a region.
    pub low_boundary: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Baseline,
            key_budget: 15,
            arena_pages: 64,
            window_bits: 39,
            heap: None,
            low_boundary: 0x10000,
        }
    }
}

/// Smallest window: the zero page and one usable page.
const MIN_WINDOW_BITS: u32 = 13;
/// Largest window: the lower half of the canonical address space.
const MAX_WINDOW_BITS: u32 = 47;
/// Usable protection keys.
const MAX_KEYS: usize = 15;

impl Config {
    /// Defaults overridden by `LITTERBOX_BACKEND`, `LITTERBOX_KEYS` and
    /// `LITTERBOX_ARENA_PAGES`. Malformed values are ignored with a warning.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_vars(|k| std::env::var(k).ok()).validate()
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = get("LITTERBOX_BACKEND") {
            match v.parse() {
                Ok(b) => config.backend = b,
                Err(e) => tracing::warn!(value = %v, "ignoring LITTERBOX_BACKEND: {}", e),
            }
        }
        if let Some(v) = get("LITTERBOX_KEYS") {
            match v.parse::<usize>() {
                Ok(n) if n <= MAX_KEYS => config.key_budget = n,
                _ => tracing::warn!(value = %v, "ignoring LITTERBOX_KEYS"),
            }
        }
        if let Some(v) = get("LITTERBOX_ARENA_PAGES") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => config.arena_pages = n,
                _ => tracing::warn!(value = %v, "ignoring LITTERBOX_ARENA_PAGES"),
            }
        }
        config
    }

    /// Parse a JSON document; missing fields take their default.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str::<Self>(text)?.validate()
    }

    /// Reject values the engine cannot work with.
    pub fn validate(self) -> crate::Result<Self> {
        if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&self.window_bits) {
            return Err(Error::Config(format!(
                "window_bits {} outside {}..={}",
                self.window_bits, MIN_WINDOW_BITS, MAX_WINDOW_BITS
            )));
        }
        if self.arena_pages == 0 {
            return Err(Error::Config("arena_pages must not be zero".into()));
        }
        if self.key_budget > MAX_KEYS {
            return Err(Error::Config(format!(
                "key_budget {} exceeds {} usable keys",
                self.key_budget, MAX_KEYS
            )));
        }
        if let Some(heap) = self.heap {
            if heap.size == 0 || heap.start.checked_add(heap.size).is_none() {
                return Err(Error::Config(format!("heap {:?} is empty or wraps", heap)));
            }
        }
        Ok(self)
    }

    /// End of the identity mapped guest physical window.
    #[inline]
    pub fn window(&self) -> usize {
        1usize << self.window_bits
    }
}
