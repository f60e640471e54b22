//! Headless process entrypoint: `sqlmeter` runs as a fleet coordinator when
//! given stage files, or as a worker when given `--server <addr>` (spec.md
//! §6 CLI surface).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use sqlmeter_core::config::StageConfig;
use sqlmeter_core::fleet::{build_router, run_worker, Coordinator, StageSession, WorkerConfig};
use sqlmeter_core::stage::Stage;
use sqlmeter_core::stats::{Reporter, StdoutReporter};
use sqlmeter_core::SqlmeterError;

/// Distributed MySQL-compatible benchmark driver.
#[derive(Debug, Parser)]
#[command(name = "sqlmeter", about = "Distributed MySQL-compatible benchmark driver")]
struct Cli {
    /// Run as a worker, joining the coordinator at this address instead of
    /// driving a stage locally (spec.md §6).
    #[arg(long)]
    server: Option<String>,

    /// Worker's own name, advertised to the coordinator. Defaults to the
    /// local hostname.
    #[arg(long)]
    name: Option<String>,

    /// Stage config files to run, in order (coordinator mode only).
    #[arg(value_name = "STAGE_FILE")]
    stages: Vec<PathBuf>,

    /// Override the stage's `dsn`.
    #[arg(long)]
    dsn: Option<String>,

    /// Override the stage's `database`.
    #[arg(long)]
    database: Option<String>,

    /// Override a top-level stage field, `key=value`. Repeatable.
    #[arg(long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,

    /// Stop after the boot barrier closes instead of running the stage
    /// (spec.md §6 "`--run=false` for boot-only smoke tests").
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    run: bool,
}

/// How long the coordinator's own local driver waits for every remote
/// instance to clear the boot barrier before giving up (spec.md §7
/// "remote barrier times out" is a non-zero-exit condition).
const REMOTE_BARRIER_TIMEOUT: Duration = Duration::from_secs(120);

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid --param `{s}`, expected key=value"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = if let Some(server) = cli.server.clone() {
        run_as_worker(server, &cli).await
    } else {
        run_as_coordinator(&cli).await
    };

    if let Err(err) = &result {
        tracing::error!(%err, "sqlmeter exiting with error");
    }
    result
}

async fn run_as_worker(server: String, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let name = cli.name.clone().unwrap_or_else(default_worker_name);
    let base_dir = std::env::temp_dir().join(format!("sqlmeter-worker-{name}"));
    let config = WorkerConfig {
        coordinator_base_url: format!("http://{server}"),
        name,
        base_dir,
    };
    run_worker(config).await?;
    Ok(())
}

fn default_worker_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string())
}

async fn run_as_coordinator(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.stages.is_empty() {
        return Err("coordinator mode requires at least one stage config file".into());
    }

    for path in &cli.stages {
        run_one_stage(path, cli).await?;
    }
    Ok(())
}

/// Boot a single stage, serve its fleet HTTP plane if it declares remote
/// instances, drive the local run, then tear the stage down (spec.md §4.5
/// "stage change", §7 "stages run sequentially").
async fn run_one_stage(path: &Path, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = StageConfig::load(path)?;
    if let Some(dsn) = &cli.dsn {
        config.dsn = dsn.clone();
    }
    if let Some(database) = &cli.database {
        config.database = Some(database.clone());
    }
    for (key, value) in &cli.params {
        apply_param(&mut config, key, value);
    }

    let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let instances = config.instances.max(1);
    let stage_id = if instances > 1 {
        Ulid::new().to_string()
    } else {
        "local".to_string()
    };

    let coordinator = Coordinator::new();
    let session = StageSession::new(stage_id.clone(), config.clone(), &base_dir, instances, true)?;
    coordinator.set_stage(Some(session.clone())).await;

    let server_handle = match &config.bind {
        Some(bind) => Some(spawn_fleet_server(bind, coordinator.clone()).await?),
        None if instances > 1 => {
            return Err(format!(
                "stage `{}` declares {} instances but no `bind` address",
                config.name, instances
            )
            .into());
        }
        None => None,
    };

    if !cli.run {
        tracing::info!(stage = %config.name, "boot-only run (--run=false); tearing down before executing");
        coordinator.set_stage(None).await;
        if let Some(handle) = server_handle {
            handle.abort();
        }
        return Ok(());
    }

    if instances > 1 {
        tracing::info!(stage = %config.name, "waiting for remote instances to join the boot barrier");
        if let Err(err) = session.await_boot_barrier(REMOTE_BARRIER_TIMEOUT).await {
            coordinator.set_stage(None).await;
            if let Some(handle) = server_handle {
                handle.abort();
            }
            return Err(format!("stage `{}`: {err}", config.name).into());
        }
    }

    let reporters: Vec<Arc<dyn Reporter>> = vec![Arc::new(StdoutReporter)];
    let stage = Stage::prepare(config.clone(), &base_dir, reporters).await?;
    session.attach_collector(stage.collector().clone());

    tracing::info!(stage = %config.name, stage_id = %stage_id, "running stage");
    let outcome = stage.run(CancellationToken::new()).await;

    coordinator.set_stage(None).await;
    if let Some(handle) = server_handle {
        handle.abort();
    }

    let failed = outcome.results.iter().any(|r| r.outcome.error.is_some());
    if failed {
        return Err(format!("stage `{}` finished with at least one fatal client error", config.name).into());
    }
    Ok(())
}

async fn spawn_fleet_server(
    bind: &str,
    coordinator: Arc<Coordinator>,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error>> {
    let addr: SocketAddr = bind.parse()?;
    let router = build_router(coordinator);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "fleet HTTP plane listening");
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(%err, "fleet HTTP plane exited");
        }
    }))
}

/// Apply a `--param key=value` override to the handful of top-level fields
/// that make sense to override from the command line; anything else is
/// logged and ignored rather than rejected, since the full set of overridable
/// fields is left to the YAML file itself.
fn apply_param(config: &mut StageConfig, key: &str, value: &str) {
    match key {
        "name" => config.name = value.to_string(),
        "dsn" => config.dsn = value.to_string(),
        "database" => config.database = Some(value.to_string()),
        "runtime" => config.runtime = Some(value.to_string()),
        "qps" => match value.parse() {
            Ok(v) => config.qps = Some(v),
            Err(_) => tracing::warn!(value, "ignoring non-numeric --param qps"),
        },
        "tps" => match value.parse() {
            Ok(v) => config.tps = Some(v),
            Err(_) => tracing::warn!(value, "ignoring non-numeric --param tps"),
        },
        "instances" => match value.parse() {
            Ok(v) => config.instances = v,
            Err(_) => tracing::warn!(value, "ignoring non-numeric --param instances"),
        },
        "bind" => config.bind = Some(value.to_string()),
        other => tracing::warn!(key = other, "unrecognized --param key, ignoring"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_equals_value() {
        assert_eq!(parse_key_val("qps=100").unwrap(), ("qps".to_string(), "100".to_string()));
        assert!(parse_key_val("no-equals-sign").is_err());
    }

    #[test]
    fn apply_param_overrides_known_fields() {
        let mut config = StageConfig {
            name: "s".into(),
            dsn: "dsn".into(),
            database: None,
            runtime: None,
            qps: None,
            tps: None,
            trx: Vec::new(),
            workload: Vec::new(),
            instances: 1,
            bind: None,
        };
        apply_param(&mut config, "qps", "250");
        apply_param(&mut config, "database", "bench");
        apply_param(&mut config, "nonsense", "ignored");
        assert_eq!(config.qps, Some(250));
        assert_eq!(config.database, Some("bench".to_string()));
    }
}
