//! Data generators: scope-aware value producers consumed by trx statements.
//!
//! See `spec.md` §3 (DataGenerator, RunLevel, RunCount) and §9's
//! "Per-key-scope data generators" design note.

mod generators;
mod scope;
mod value;

pub use generators::{ColumnGenerator, ConstantGenerator, RandomIntGenerator, SequentialIntGenerator};
pub use scope::{DataScope, RunLevel};
pub use value::{Value, ValueKind};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The lifetime during which a data generator's value is stable, narrowest to
/// widest (spec.md §3, Glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Value,
    Row,
    Statement,
    Trx,
    Iter,
    Client,
    ClientGroup,
    ExecGroup,
    Workload,
    Stage,
    Global,
}

/// Counter vector keyed by scope (spec.md §3, RunCount).
///
/// Only the five narrowest scopes actually advance during a run; scopes from
/// `Client` up are allocation-time constants for the lifetime of the stage
/// (see DESIGN.md's resolution of the "wide scope invalidation" open
/// question), so their counter is always 0.
#[derive(Debug, Default)]
pub struct RunCount {
    pub value: u64,
    pub row: u64,
    pub statement: u64,
    pub trx: u64,
    pub iter: u64,
}

impl RunCount {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_for(&self, scope: Scope) -> u64 {
        match scope {
            Scope::Value => self.value,
            Scope::Row => self.row,
            Scope::Statement => self.statement,
            Scope::Trx => self.trx,
            Scope::Iter => self.iter,
            _ => 0,
        }
    }

    pub fn advance(&mut self, transition: Transition) {
        match transition {
            Transition::Iter => {
                self.iter += 1;
                self.trx = 0;
                self.statement = 0;
                self.row = 0;
                self.value = 0;
            }
            Transition::Trx => {
                self.trx += 1;
                self.statement = 0;
                self.row = 0;
                self.value = 0;
            }
            Transition::Statement => {
                self.statement += 1;
                self.row = 0;
                self.value = 0;
            }
            Transition::Row => {
                self.row += 1;
                self.value = 0;
            }
            Transition::Value => {
                self.value += 1;
            }
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "value" => Ok(Scope::Value),
            "row" => Ok(Scope::Row),
            "statement" => Ok(Scope::Statement),
            "trx" => Ok(Scope::Trx),
            "iter" => Ok(Scope::Iter),
            "client" => Ok(Scope::Client),
            "client-group" | "clientgroup" => Ok(Scope::ClientGroup),
            "exec-group" | "execgroup" => Ok(Scope::ExecGroup),
            "workload" => Ok(Scope::Workload),
            "stage" => Ok(Scope::Stage),
            "global" => Ok(Scope::Global),
            other => Err(format!("unknown scope '{other}'")),
        }
    }
}

/// Transitions that bump a `RunCount` scope counter (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Iter,
    Trx,
    Statement,
    Row,
    Value,
}

/// Identifies the position in the execution tree a generator copy was made
/// for; used only for `Id()` debugging identity (spec.md §3 RunLevel).
#[derive(Debug, Clone, Default)]
pub struct RunLevelTag {
    pub stage: String,
    pub stage_name: String,
    pub exec_group: usize,
    pub exec_group_name: String,
    pub client_group: usize,
    pub client: usize,
    pub trx: usize,
    pub trx_name: String,
    pub query: usize,
}

/// Opaque producer of one-or-more values (spec.md §3 DataGenerator).
///
/// Implementors produce *raw* (uncached) values; caching at the generator's
/// declared scope is handled by `CachedGenerator`, which wraps every
/// registered generator.
pub trait RawGenerator: Send + Sync {
    fn raw_values(&self, run_count: &RunCount) -> Vec<Value>;
    fn kind(&self) -> ValueKind;
}

/// A generator wrapped with scope-aware caching (spec.md §9).
///
/// `Values` returns the cached value for the generator's scope, recomputing
/// only when the relevant `RunCount` counter has advanced since the value was
/// last produced. `Call` always forces a fresh value (and refreshes the
/// cache, so a subsequent `Values` in the same scope sees the forced value).
pub struct CachedGenerator {
    inner: Arc<dyn RawGenerator>,
    scope: Scope,
    cache: Mutex<Option<(u64, Vec<Value>)>>,
    id_seq: AtomicU64,
}

impl CachedGenerator {
    pub fn new(inner: Arc<dyn RawGenerator>, scope: Scope) -> Self {
        Self {
            inner,
            scope,
            cache: Mutex::new(None),
            id_seq: AtomicU64::new(0),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Clone the `Arc` to the underlying raw production logic, without its
    /// cache state. Used by `DataScope::copy` to mint independent
    /// client-private `CachedGenerator`s that still share one generator
    /// implementation.
    pub fn inner_handle(&self) -> Arc<dyn RawGenerator> {
        self.inner.clone()
    }

    pub fn kind(&self) -> ValueKind {
        self.inner.kind()
    }

    /// Return the stable value within the generator's scope, recomputing
    /// only when the scope's `RunCount` counter has advanced.
    pub fn values(&self, run_count: &RunCount) -> Vec<Value> {
        let counter = run_count.counter_for(self.scope);
        let mut guard = self.cache.lock().expect("cache mutex poisoned");
        if let Some((cached_counter, cached)) = guard.as_ref() {
            if *cached_counter == counter {
                return cached.clone();
            }
        }
        let fresh = self.inner.raw_values(run_count);
        *guard = Some((counter, fresh.clone()));
        self.id_seq.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    /// Force a fresh value regardless of cache state, and refresh the cache.
    pub fn call(&self, run_count: &RunCount) -> Vec<Value> {
        let fresh = self.inner.raw_values(run_count);
        let counter = run_count.counter_for(self.scope);
        *self.cache.lock().expect("cache mutex poisoned") = Some((counter, fresh.clone()));
        self.id_seq.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    /// Feed a scanned value (column output / insert-id) into the cache so
    /// later `Values` calls in the same scope observe it. Only meaningful for
    /// `ColumnGenerator`-backed instances.
    pub fn scan(&self, values: Vec<Value>, run_count: &RunCount) {
        let counter = run_count.counter_for(self.scope);
        *self.cache.lock().expect("cache mutex poisoned") = Some((counter, values));
    }

    /// Debugging identity: name plus a monotonically increasing generation
    /// counter for this scope (spec.md §3 `Id()`).
    pub fn id(&self, name: &str) -> String {
        format!("{name}@{:?}#{}", self.scope, self.id_seq.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(AtomicU64);
    impl RawGenerator for Counter {
        fn raw_values(&self, _run_count: &RunCount) -> Vec<Value> {
            vec![Value::Int(self.0.fetch_add(1, Ordering::Relaxed) as i64)]
        }
        fn kind(&self) -> ValueKind {
            ValueKind::Int
        }
    }

    #[test]
    fn values_are_stable_within_scope() {
        let gen = CachedGenerator::new(Arc::new(Counter(AtomicU64::new(0))), Scope::Statement);
        let mut rc = RunCount::new();
        let a = gen.values(&rc);
        let b = gen.values(&rc);
        assert_eq!(a, b);
        rc.advance(Transition::Statement);
        let c = gen.values(&rc);
        assert_ne!(a, c);
    }

    #[test]
    fn call_always_forces_fresh_value() {
        let gen = CachedGenerator::new(Arc::new(Counter(AtomicU64::new(0))), Scope::Trx);
        let rc = RunCount::new();
        let a = gen.call(&rc);
        let b = gen.call(&rc);
        assert_ne!(a, b);
    }

    #[test]
    fn wider_scope_counter_is_always_zero() {
        let gen = CachedGenerator::new(Arc::new(Counter(AtomicU64::new(0))), Scope::ClientGroup);
        let mut rc = RunCount::new();
        let a = gen.values(&rc);
        rc.advance(Transition::Iter);
        rc.advance(Transition::Trx);
        let b = gen.values(&rc);
        assert_eq!(a, b, "client-group-and-wider scopes never invalidate within a run");
    }

    #[test]
    fn scope_from_str_parses_known_names() {
        use std::str::FromStr;
        assert_eq!(Scope::from_str("statement").unwrap(), Scope::Statement);
        assert_eq!(Scope::from_str("ClientGroup").unwrap(), Scope::ClientGroup);
        assert!(Scope::from_str("bogus").is_err());
    }

    #[test]
    fn advance_resets_narrower_counters() {
        let mut rc = RunCount::new();
        rc.advance(Transition::Value);
        rc.advance(Transition::Row);
        assert_eq!(rc.value, 0);
        assert_eq!(rc.row, 1);
        rc.advance(Transition::Trx);
        assert_eq!(rc.row, 0);
        assert_eq!(rc.trx, 1);
    }
}
