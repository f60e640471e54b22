use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{CachedGenerator, Scope};

/// Identifies where in the execution tree a client is running, used to
/// decide whether a generator `Copy()` hands back the shared instance or
/// mints a fresh one (spec.md §3, §9).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RunLevel {
    pub client_group: usize,
    pub client: usize,
}

/// Registry of named data generators visible to a trx set (spec.md §3
/// DataGenerator, §9 "Per-key-scope data generators").
///
/// Generators declared at `Client`-and-narrower scope are private per
/// client: `copy()` mints a brand new `CachedGenerator` sharing the same
/// underlying `RawGenerator` production logic but with its own cache, so
/// two clients never observe each other's cached value. Generators at
/// `ClientGroup`-and-wider scope are shared: `copy()` hands back the exact
/// same `Arc<CachedGenerator>` to every caller.
#[derive(Default)]
pub struct DataScope {
    generators: Mutex<HashMap<String, Arc<CachedGenerator>>>,
}

impl DataScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator under `name`. Replaces any prior registration
    /// with the same name (later trx-file declarations shadow earlier ones,
    /// matching how the loader processes data declarations top to bottom).
    pub fn register(&self, name: impl Into<String>, generator: Arc<CachedGenerator>) {
        self.generators
            .lock()
            .expect("data scope mutex poisoned")
            .insert(name.into(), generator);
    }

    /// Look up the canonical registered generator by name, without applying
    /// the client-private-copy rule. Used by the loader for validation.
    pub fn get(&self, name: &str) -> Option<Arc<CachedGenerator>> {
        self.generators
            .lock()
            .expect("data scope mutex poisoned")
            .get(name)
            .cloned()
    }

    /// Resolve a named generator for use at the given `run_level`.
    ///
    /// Scopes `Client` and narrower are private per `(client_group, client)`
    /// pair: a fresh `CachedGenerator` is minted (same production logic,
    /// independent cache) the first time a given run level asks for it, and
    /// reused afterwards. Scopes `ClientGroup` and wider share the single
    /// canonical instance across every run level.
    pub fn copy(&self, name: &str, run_level: &RunLevel) -> Option<Arc<CachedGenerator>> {
        let canonical = self.get(name)?;
        if canonical.scope() >= Scope::ClientGroup {
            return Some(canonical);
        }

        let key = format!("{name}@{}/{}", run_level.client_group, run_level.client);
        let mut guard = self.generators.lock().expect("data scope mutex poisoned");
        if let Some(existing) = guard.get(&key) {
            return Some(existing.clone());
        }
        let fresh = Arc::new(CachedGenerator::new(canonical.inner_handle(), canonical.scope()));
        guard.insert(key, fresh.clone());
        Some(fresh)
    }

    pub fn names(&self) -> Vec<String> {
        self.generators
            .lock()
            .expect("data scope mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
