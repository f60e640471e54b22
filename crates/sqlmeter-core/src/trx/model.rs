use std::sync::Arc;
use std::time::Duration;

use crate::datagen::CachedGenerator;

/// Marks whether a statement opens and/or closes a finch-trx block
/// (spec.md §4.1, §4.3.3). A single statement can be both (a one-statement
/// trx) or neither (a mid-trx statement).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrxBoundary {
    pub begin: bool,
    pub end: bool,
}

/// Classification derived from a statement's leading SQL keyword
/// (spec.md §4.1 "Classification from SQL leading keyword").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementFlags {
    pub prepare: bool,
    pub result_set: bool,
    pub begin: bool,
    pub commit: bool,
    pub write: bool,
    pub ddl: bool,
}

/// The four metric kinds tracked by the stats collector (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Read,
    Write,
    Commit,
    Total,
}

/// Row-count / table-size / database-size data caps attached via the
/// `rows:`, `table-size:`, `database-size:` modifiers (spec.md §4.1).
#[derive(Debug, Clone)]
pub enum LimitKind {
    Rows { limit: u64, offset: u64 },
    TableSize { table: String, bytes: u64 },
    DatabaseSize { database: String, bytes: u64 },
}

/// Which of the two `CachedGenerator` accessors a bound input uses: `Call`
/// forces a fresh value every invocation (`@name()` syntax), `Values`
/// returns the scope-cached value (spec.md §4.1 "call byte").
#[derive(Clone)]
pub struct BoundInput {
    pub name: String,
    pub generator: Arc<CachedGenerator>,
    pub forced: bool,
}

/// A `save-result`/`save-insert-id` target: a scanned column value is fed
/// back into the named generator's cache via `CachedGenerator::scan`.
#[derive(Clone)]
pub struct BoundOutput {
    pub name: String,
    pub generator: Arc<CachedGenerator>,
}

/// Identifies statements sharing one server-side prepared handle under
/// `copies: N` + `prepare` with no `/*!copy-number*/` placeholder
/// (spec.md §4.1, §9 "Prepared-statement sharing").
#[derive(Debug, Clone, Copy)]
pub struct PrepareGroup {
    pub leader_index: usize,
    pub size: usize,
}

/// An immutable, deep-shareable parsed statement (spec.md §4.1).
///
/// Once loaded, a `Statement` carries no interior mutability of its own —
/// clients share references to the same `Statement` list, binding each
/// input/output to a per-run-level generator copy at allocation time
/// (see `alloc`).
#[derive(Clone)]
pub struct Statement {
    pub file: String,
    pub line: usize,
    pub sql: String,
    pub flags: StatementFlags,
    pub trx_boundary: TrxBoundary,
    pub idle: Option<Duration>,
    pub limit: Option<LimitKind>,
    pub inputs: Vec<BoundInput>,
    pub outputs: Vec<BoundOutput>,
    pub insert_id: Option<Arc<CachedGenerator>>,
    pub copy_number: Option<usize>,
    pub prepare_group: Option<PrepareGroup>,
}

impl Statement {
    /// Number of leading positional binds a caller must supply, counting
    /// every value each bound input's generator may expand to.
    pub fn input_arity(&self) -> usize {
        self.inputs.len()
    }
}

/// Metadata for one transaction file, derived while scanning its
/// statements (spec.md §4.1: "the enclosing trx's `Meta.DDL` becomes
/// true").
#[derive(Debug, Clone, Default)]
pub struct TrxMeta {
    pub ddl: bool,
}

/// One parsed transaction file: an ordered list of statements plus
/// roll-up metadata (spec.md Glossary: "Trx (finch-trx)").
#[derive(Clone)]
pub struct TrxFile {
    pub name: String,
    pub path: String,
    pub statements: Vec<Statement>,
    pub meta: TrxMeta,
}

/// The full set of loaded transaction files handed to the allocator
/// (spec.md §4.2 "Input: `TrxSet`").
#[derive(Clone, Default)]
pub struct TrxSet {
    pub trxs: Vec<TrxFile>,
}

impl TrxSet {
    pub fn find(&self, name: &str) -> Option<&TrxFile> {
        self.trxs.iter().find(|t| t.name == name)
    }
}
