//! Trx file parsing: modifiers, inline tokens, classification, and
//! `copies:`/`PrepareMulti` expansion (spec.md §4.1 Trx Loader, C1).

mod loader;
mod model;

pub use loader::load_trx_set;
pub use model::{
    BoundInput, BoundOutput, LimitKind, MetricKind, PrepareGroup, Statement, StatementFlags,
    TrxBoundary, TrxFile, TrxMeta, TrxSet,
};
