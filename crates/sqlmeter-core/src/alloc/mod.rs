//! C2 Allocator: expand a declarative workload into execution groups,
//! client groups, clients, and per-statement data-generator/limit wiring
//! (spec.md §4.2).

mod limiter;

pub use limiter::{And, TokenRateLimiter};

use std::sync::Arc;
use std::time::Duration;

use crate::client::{
    BoundStatement, Client, ClientConfig, IterCap, LimitRuntime, RateLimiter, Unlimited,
};
use crate::config::{parse_duration, ClientGroupConfig, StageConfig};
use crate::datagen::{DataScope, RunLevel};
use crate::db::DbHandle;
use crate::error::SqlmeterError;
use crate::stats::{Collector, TrxStats};
use crate::trx::{Statement, TrxSet};

/// One runnable client group: a shared DB handle's clients plus its own
/// optional runtime deadline (spec.md §3 ClientGroup).
pub struct ClientGroup {
    pub name: String,
    pub clients: Vec<Client>,
    pub runtime: Option<Duration>,
}

/// An ordered slice of client groups that run concurrently; exec groups
/// themselves run strictly sequentially (spec.md §3 ExecGroup).
pub struct ExecGroup {
    pub name: String,
    pub client_groups: Vec<ClientGroup>,
}

/// Expand `stage.workload` against `trx_set`/`data_scope` into the
/// sequential exec-group tree the stage scheduler iterates (spec.md §4.2).
///
/// The config surface exposes only a client-group-wide `qps`/`tps` rate, so
/// the `And` composition's exec-group and per-client rate-limiter nodes are
/// built as `Unlimited` placeholders to keep the nesting spec.md §4.2
/// describes. Iteration caps are different: `iter_exec_group` and
/// `iter_clients` are real config knobs (spec.md §4.3.3 items 1/2),
/// resolved to `exec_group_iter_cap`/`client_group_iter_cap` below so the
/// §8 "Iteration caps" invariant is actually enforceable at runtime.
pub async fn allocate(
    stage: &StageConfig,
    trx_set: &TrxSet,
    data_scope: &Arc<DataScope>,
    collector: &Arc<Collector>,
) -> Result<Vec<ExecGroup>, SqlmeterError> {
    let resolved = resolve_workload(stage, trx_set);
    let fused = fuse_consecutive_same_name(resolved);

    let stage_qps = opt_limiter(stage.qps);
    let stage_tps = opt_limiter(stage.tps);

    let mut exec_groups = Vec::with_capacity(fused.len());
    // `RunLevel::client_group` keys `DataScope::copy`'s client-private
    // cache; it must stay unique across the whole stage, not just within
    // one exec group, or two client groups in different exec groups could
    // collide on the same `(client_group, client)` key.
    let mut cg_index = 0usize;
    for (eg_name, group_configs) in fused {
        let eg_qps: Arc<dyn RateLimiter> = Arc::new(Unlimited);
        let eg_tps: Arc<dyn RateLimiter> = Arc::new(Unlimited);
        let exec_group_iter_cap = IterCap {
            counter: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            cap: resolve_exec_group_iter_cap(&group_configs),
        };

        let mut client_groups = Vec::with_capacity(group_configs.len());
        for cfg in group_configs {
            let client_group = allocate_client_group(
                stage,
                trx_set,
                data_scope,
                collector,
                &eg_name,
                cg_index,
                &cfg,
                &stage_qps,
                &stage_tps,
                &eg_qps,
                &eg_tps,
                exec_group_iter_cap.clone(),
            )
            .await?;
            client_groups.push(client_group);
            cg_index += 1;
        }

        exec_groups.push(ExecGroup {
            name: eg_name,
            client_groups,
        });
    }

    Ok(exec_groups)
}

#[allow(clippy::too_many_arguments)]
async fn allocate_client_group(
    stage: &StageConfig,
    trx_set: &TrxSet,
    data_scope: &Arc<DataScope>,
    collector: &Arc<Collector>,
    eg_name: &str,
    cg_index: usize,
    cfg: &ClientGroupConfig,
    stage_qps: &Arc<dyn RateLimiter>,
    stage_tps: &Arc<dyn RateLimiter>,
    eg_qps: &Arc<dyn RateLimiter>,
    eg_tps: &Arc<dyn RateLimiter>,
    exec_group_iter_cap: IterCap,
) -> Result<ClientGroup, SqlmeterError> {
    let trx_names = cfg
        .trx
        .clone()
        .unwrap_or_else(|| trx_set.trxs.iter().map(|t| t.name.clone()).collect());

    let statements = Arc::new(concat_statements(trx_set, &trx_names)?);

    let db = DbHandle::connect(&stage.dsn, cfg.clients.max(1) as u32).await?;

    let client_group_qps = opt_limiter(cfg.qps);
    let client_group_tps = opt_limiter(cfg.tps);
    // `And(stage, And(execGroup, And(clientGroupAcrossClients, perClient)))`
    // (spec.md §4.2 item 1); `perClient` has no distinct config knob so it's
    // `Unlimited`, and every client in this group shares the same
    // `client_group_qps`/`client_group_tps` instance, which is what makes
    // the composition's "across clients" token bucket actually shared.
    let effective_qps = And::new(
        stage_qps.clone(),
        And::new(eg_qps.clone(), And::new(client_group_qps, Arc::new(Unlimited))),
    );
    let effective_tps = And::new(
        stage_tps.clone(),
        And::new(eg_tps.clone(), And::new(client_group_tps, Arc::new(Unlimited))),
    );

    // spec.md §4.3.3 item 2 "IterClients": shared across every client this
    // client group spawns, via the atomic counter every `Client` config
    // below clones a handle to.
    let client_group_iter_cap = IterCap {
        counter: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        cap: cfg.iter_clients.unwrap_or(0),
    };
    let runtime = cfg
        .runtime
        .as_deref()
        .map(parse_duration)
        .transpose()?
        .or_else(|| stage.runtime_duration().ok().flatten());

    let mut clients = Vec::with_capacity(cfg.clients.max(1));
    for client_index in 0..cfg.clients.max(1) {
        let run_level = RunLevel {
            client_group: cg_index,
            client: client_index,
        };

        let bound = bind_statements(&statements, data_scope, &run_level)?;

        let mut trx_stats = Vec::with_capacity(trx_names.len());
        for trx_name in &trx_names {
            let stats = Arc::new(TrxStats::new());
            collector.register(trx_name.clone(), stats.clone());
            trx_stats.push(stats);
        }

        let config = ClientConfig {
            client_group: eg_name.to_string(),
            client_index,
            db: db.clone(),
            database: stage.database.clone(),
            statements: statements.clone(),
            bound,
            qps: effective_qps.clone(),
            tps: effective_tps.clone(),
            iter_cap: cfg.iter.unwrap_or(0),
            exec_group_iter_cap: exec_group_iter_cap.clone(),
            client_group_iter_cap: client_group_iter_cap.clone(),
            trx_stats,
        };
        clients.push(Client::new(config));
    }

    Ok(ClientGroup {
        name: eg_name.to_string(),
        clients,
        runtime,
    })
}

/// Concatenate each named trx's statement list in order, re-offsetting any
/// `PrepareGroup.leader_index` by the position the trx's statements land at
/// in the flattened list (spec.md §4.2 item 4; §4.1 `PrepareGroup`).
fn concat_statements(trx_set: &TrxSet, names: &[String]) -> Result<Vec<Statement>, SqlmeterError> {
    let mut out = Vec::new();
    for name in names {
        let trx = trx_set
            .find(name)
            .ok_or_else(|| SqlmeterError::Alloc(format!("workload references unknown trx '{name}'")))?;
        let offset = out.len();
        for stmt in &trx.statements {
            let mut stmt = stmt.clone();
            if let Some(group) = &mut stmt.prepare_group {
                group.leader_index += offset;
            }
            out.push(stmt);
        }
    }
    Ok(out)
}

/// Resolve each input/output/insert-id key on every statement to a
/// run-level-scoped generator copy (spec.md §4.2 item 4).
fn bind_statements(
    statements: &[Statement],
    data_scope: &DataScope,
    run_level: &RunLevel,
) -> Result<Vec<BoundStatement>, SqlmeterError> {
    let mut out = Vec::with_capacity(statements.len());
    for statement in statements {
        let mut bound = BoundStatement::unbound();
        for input in &statement.inputs {
            // `BoundInput::name`/`BoundOutput::name` are stored bare (no
            // leading `@`); the scope registers every key with it, matching
            // how the trx loader both declares and resolves them.
            let key = format!("@{}", input.name);
            let generator = data_scope.copy(&key, run_level).ok_or_else(|| {
                SqlmeterError::Alloc(format!("no generator registered for input '{}'", input.name))
            })?;
            bound.inputs.push((generator, input.forced));
        }
        for output in &statement.outputs {
            let key = format!("@{}", output.name);
            let generator = data_scope.copy(&key, run_level).ok_or_else(|| {
                SqlmeterError::Alloc(format!("no generator registered for output '{}'", output.name))
            })?;
            bound.outputs.push(generator);
        }
        if let Some(insert_id) = &statement.insert_id {
            // `Statement` keeps only the canonical generator Arc, not the
            // `@key` it was registered under, so recover the name by
            // identity match against the scope's registry — then resolve
            // through the same `copy()` path `inputs`/`outputs` use, so a
            // later statement reading this column via a `BoundInput` sees
            // the same per-client copy this scan just wrote into (spec.md
            // §4.1 "save-insert-id registers @key as a column generator").
            let name = data_scope
                .names()
                .into_iter()
                .find(|n| data_scope.get(n).map(|g| Arc::ptr_eq(&g, insert_id)).unwrap_or(false));
            let generator = name
                .and_then(|n| data_scope.copy(&n, run_level))
                .unwrap_or_else(|| insert_id.clone());
            bound.insert_id = Some(generator);
        }
        if let Some(limit) = &statement.limit {
            bound.limit = Some(Arc::new(LimitRuntime::new(limit.clone())));
        }
        out.push(bound);
    }
    Ok(out)
}

/// `iter_exec_group` is declared per client-group config but shared by the
/// whole fused exec group; the first config to set it wins (spec.md §4.3.3
/// item 1 "IterExecGroup"). `0` means unlimited.
fn resolve_exec_group_iter_cap(group_configs: &[ClientGroupConfig]) -> u64 {
    group_configs.iter().find_map(|cfg| cfg.iter_exec_group).unwrap_or(0)
}

fn opt_limiter(rate: Option<u64>) -> Arc<dyn RateLimiter> {
    match rate {
        Some(r) if r > 0 => TokenRateLimiter::new(r),
        _ => Arc::new(Unlimited),
    }
}

struct Resolved {
    group_name: String,
    cfg: ClientGroupConfig,
}

/// Apply auto-assignment and auto-naming to the declared workload
/// (spec.md §4.2 "Auto-assignment... Naming rule for auto groups").
fn resolve_workload(stage: &StageConfig, trx_set: &TrxSet) -> Vec<Resolved> {
    let workload: Vec<ClientGroupConfig> = if stage.workload.is_empty() {
        trx_set
            .trxs
            .iter()
            .map(|t| ClientGroupConfig {
                group: None,
                trx: Some(vec![t.name.clone()]),
                clients: 1,
                iter: None,
                iter_clients: None,
                iter_exec_group: None,
                runtime: None,
                qps: None,
                tps: None,
            })
            .collect()
    } else {
        stage.workload.clone()
    };

    let mut resolved = Vec::with_capacity(workload.len());
    let mut ddl_counter = 0usize;
    let mut dml_counter = 0usize;
    let mut last_is_ddl: Option<bool> = None;

    for mut cfg in workload {
        if cfg.trx.is_none() {
            cfg.trx = Some(trx_set.trxs.iter().map(|t| t.name.clone()).collect());
        }
        let trx_names = cfg.trx.clone().unwrap_or_default();
        let is_ddl = trx_names
            .iter()
            .any(|name| trx_set.find(name).map(|t| t.meta.ddl).unwrap_or(false));

        if last_is_ddl != Some(is_ddl) {
            if is_ddl {
                ddl_counter += 1;
            } else {
                dml_counter += 1;
            }
        }
        last_is_ddl = Some(is_ddl);

        let group_name = cfg.group.clone().unwrap_or_else(|| {
            if is_ddl {
                format!("ddl{ddl_counter}")
            } else {
                format!("dml{dml_counter}")
            }
        });

        resolved.push(Resolved { group_name, cfg });
    }
    resolved
}

/// Fuse consecutive client-group configs sharing the same resolved name
/// into one execution group (spec.md §4.2 "Consecutive client groups with
/// the same group name are fused into one execution group").
fn fuse_consecutive_same_name(resolved: Vec<Resolved>) -> Vec<(String, Vec<ClientGroupConfig>)> {
    let mut fused: Vec<(String, Vec<ClientGroupConfig>)> = Vec::new();
    for r in resolved {
        if let Some(last) = fused.last_mut() {
            if last.0 == r.group_name {
                last.1.push(r.cfg);
                continue;
            }
        }
        fused.push((r.group_name, vec![r.cfg]));
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trx::{TrxFile, TrxMeta};

    fn trx(name: &str, ddl: bool) -> TrxFile {
        TrxFile {
            name: name.to_string(),
            path: format!("{name}.sql"),
            statements: Vec::new(),
            meta: TrxMeta { ddl },
        }
    }

    fn stage_with_workload(workload: Vec<ClientGroupConfig>) -> StageConfig {
        StageConfig {
            name: "s".into(),
            dsn: "mysql://localhost/db".into(),
            database: None,
            runtime: None,
            qps: None,
            tps: None,
            trx: Vec::new(),
            workload,
            instances: 0,
            bind: None,
        }
    }

    fn cfg(group: Option<&str>, trx: Option<Vec<&str>>) -> ClientGroupConfig {
        ClientGroupConfig {
            group: group.map(|s| s.to_string()),
            trx: trx.map(|v| v.into_iter().map(|s| s.to_string()).collect()),
            clients: 1,
            iter: None,
            iter_clients: None,
            iter_exec_group: None,
            runtime: None,
            qps: None,
            tps: None,
        }
    }

    #[test]
    fn empty_workload_auto_assigns_one_group_per_trx() {
        let trx_set = TrxSet {
            trxs: vec![trx("setup", true), trx("select1", false)],
        };
        let stage = stage_with_workload(Vec::new());
        let resolved = resolve_workload(&stage, &trx_set);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].group_name, "ddl1");
        assert_eq!(resolved[1].group_name, "dml1");
    }

    #[test]
    fn missing_trx_list_inherits_whole_order() {
        let trx_set = TrxSet {
            trxs: vec![trx("a", false), trx("b", false)],
        };
        let stage = stage_with_workload(vec![cfg(Some("all"), None)]);
        let resolved = resolve_workload(&stage, &trx_set);
        assert_eq!(resolved[0].cfg.trx.as_ref().unwrap(), &vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn ddl_to_dml_transitions_increment_separate_counters() {
        let trx_set = TrxSet {
            trxs: vec![
                trx("ddl_a", true),
                trx("dml_a", false),
                trx("ddl_b", true),
                trx("dml_b", false),
            ],
        };
        let stage = stage_with_workload(vec![
            cfg(None, Some(vec!["ddl_a"])),
            cfg(None, Some(vec!["dml_a"])),
            cfg(None, Some(vec!["ddl_b"])),
            cfg(None, Some(vec!["dml_b"])),
        ]);
        let resolved = resolve_workload(&stage, &trx_set);
        let names: Vec<_> = resolved.iter().map(|r| r.group_name.clone()).collect();
        assert_eq!(names, vec!["ddl1", "dml1", "ddl2", "dml2"]);
    }

    #[test]
    fn consecutive_same_named_groups_fuse_into_one_exec_group() {
        let trx_set = TrxSet {
            trxs: vec![trx("a", false), trx("b", false)],
        };
        let stage = stage_with_workload(vec![
            cfg(Some("workers"), Some(vec!["a"])),
            cfg(Some("workers"), Some(vec!["b"])),
            cfg(Some("other"), Some(vec!["a"])),
        ]);
        let resolved = resolve_workload(&stage, &trx_set);
        let fused = fuse_consecutive_same_name(resolved);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].0, "workers");
        assert_eq!(fused[0].1.len(), 2);
        assert_eq!(fused[1].0, "other");
        assert_eq!(fused[1].1.len(), 1);
    }

    #[test]
    fn explicit_names_do_not_reset_auto_counters() {
        let trx_set = TrxSet {
            trxs: vec![trx("ddl_a", true), trx("named", true), trx("dml_a", false)],
        };
        let stage = stage_with_workload(vec![
            cfg(None, Some(vec!["ddl_a"])),
            cfg(Some("special"), Some(vec!["named"])),
            cfg(None, Some(vec!["dml_a"])),
        ]);
        let resolved = resolve_workload(&stage, &trx_set);
        let names: Vec<_> = resolved.iter().map(|r| r.group_name.clone()).collect();
        assert_eq!(names, vec!["ddl1", "special", "dml1"]);
    }

    #[test]
    fn exec_group_iter_cap_resolves_from_first_config_that_sets_it() {
        let mut first = cfg(Some("g"), Some(vec!["a"]));
        let mut second = cfg(Some("g"), Some(vec!["b"]));
        second.iter_exec_group = Some(50);
        first.iter_exec_group = None;
        assert_eq!(resolve_exec_group_iter_cap(&[first, second]), 50);
    }

    #[test]
    fn exec_group_iter_cap_is_zero_when_unset() {
        let group = vec![cfg(Some("g"), Some(vec!["a"]))];
        assert_eq!(resolve_exec_group_iter_cap(&group), 0);
    }
}
