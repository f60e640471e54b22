//! Stage/workload configuration types and the loader that turns a YAML
//! file (plus environment overlay) into them (spec.md §1 Non-goals scope
//! out *parsing detail*, not the existence of a config layer).

mod duration;

pub use duration::parse_duration;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SqlmeterError;

/// One data generator declaration attached to a trx entry (spec.md §4.1
/// "registers data generators").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDeclConfig {
    pub name: String,
    #[serde(flatten)]
    pub generator: GeneratorSpec,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "statement".to_string()
}

/// The declared shape of a builtin generator (spec.md §3 DataGenerator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GeneratorSpec {
    RandomInt { min: i64, max: i64 },
    SequentialInt { start: i64, #[serde(default = "one")] step: i64 },
    Constant { value: ConstantValueSpec },
}

fn one() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstantValueSpec {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A single `{name, file, dataDecls}` entry consumed by the trx loader
/// (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrxEntryConfig {
    pub name: String,
    pub file: String,
    #[serde(default, rename = "data")]
    pub data_decls: Vec<DataDeclConfig>,
}

/// One declared client group within a workload (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientGroupConfig {
    pub group: Option<String>,
    pub trx: Option<Vec<String>>,
    #[serde(default = "default_clients")]
    pub clients: usize,
    pub iter: Option<u64>,
    /// Shared iteration total across every client in this client group
    /// (spec.md §4.3.3 item 2 "`IterClients`"), enforced via the atomic
    /// counter every client in the group shares.
    #[serde(default)]
    pub iter_clients: Option<u64>,
    /// Shared iteration total across every client group fused into this
    /// client group's execution group (spec.md §4.3.3 item 1
    /// "`IterExecGroup`"). When several client-group configs fuse into one
    /// execution group, the first one to declare this wins.
    #[serde(default)]
    pub iter_exec_group: Option<u64>,
    pub runtime: Option<String>,
    pub qps: Option<u64>,
    pub tps: Option<u64>,
}

fn default_clients() -> usize {
    1
}

/// A complete stage configuration: one self-contained workload
/// (spec.md Glossary "Stage").
///
/// Also the wire shape the fleet coordinator hands a worker in its `/boot`
/// response (spec.md §4.5) — serialized as-is, since a worker needs exactly
/// the same fields the local driver loads from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub dsn: String,
    pub database: Option<String>,
    pub runtime: Option<String>,
    #[serde(default)]
    pub qps: Option<u64>,
    #[serde(default)]
    pub tps: Option<u64>,
    #[serde(default)]
    pub trx: Vec<TrxEntryConfig>,
    #[serde(default)]
    pub workload: Vec<ClientGroupConfig>,
    #[serde(default)]
    pub instances: usize,
    #[serde(default)]
    pub bind: Option<String>,
}

impl StageConfig {
    /// Load and merge a YAML stage file with `SQLMETER_`-prefixed
    /// environment overrides, layered via the `config` crate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SqlmeterError> {
        let path = path.as_ref();
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SQLMETER").separator("__"));
        let cfg = builder.build()?;
        let stage: StageConfig = cfg.try_deserialize()?;
        Ok(stage)
    }

    pub fn runtime_duration(&self) -> Result<Option<std::time::Duration>, SqlmeterError> {
        self.runtime.as_deref().map(parse_duration).transpose()
    }
}
