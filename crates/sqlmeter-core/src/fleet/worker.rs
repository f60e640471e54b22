//! Worker-side boot/run/stop loop: the mirror image of
//! [`super::coordinator::StageSession`], driven entirely by retrying HTTP
//! calls against a coordinator (spec.md §4.5).

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use crate::config::StageConfig;
use crate::error::SqlmeterError;
use crate::stage::Stage;
use crate::stats::{Reporter, RemoteReporter, StdoutReporter};

/// What a worker needs to join a coordinator's fleet and execute whatever
/// stage it's handed (spec.md §6 CLI surface `--server <addr>`).
pub struct WorkerConfig {
    pub coordinator_base_url: String,
    pub name: String,
    /// Local workspace the worker writes fetched trx files into and runs
    /// the stage from (spec.md §4.5 "file transfer").
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct BootResponse {
    stage_id: String,
    config: StageConfig,
}

/// Boot timeouts from spec.md §5: "boot HTTP retry with short timeouts
/// (~2 s per try)".
const BOOT_TRY_TIMEOUT: Duration = Duration::from_secs(2);
const BOOT_TRY_WAIT: Duration = Duration::from_secs(2);
const BOOT_ACK_TRIES: u32 = 5;
/// "run-wait poll 60 s per try" (spec.md §5); the GET blocks server-side
/// until `runSignal` closes, so a timed-out attempt is just retried.
const RUN_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const RUN_ACK_TRIES: u32 = 5;

/// Run the boot → files → ack → run → execute → report cycle forever,
/// one stage at a time, until an unrecoverable fleet error occurs (spec.md
/// §7 "exhaustion is terminal" for `/boot` and `/run`).
pub async fn run_worker(config: WorkerConfig) -> Result<(), SqlmeterError> {
    let http = reqwest::Client::new();
    loop {
        run_one_stage(&http, &config).await?;
    }
}

async fn run_one_stage(http: &reqwest::Client, config: &WorkerConfig) -> Result<(), SqlmeterError> {
    let boot = boot_loop(http, config).await?;
    tracing::info!(stage_id = %boot.stage_id, stage = %boot.config.name, "joined stage");

    fetch_files(http, config, &boot).await?;
    ack_boot(http, config, &boot.stage_id).await?;

    match wait_for_run(http, config, &boot.stage_id).await? {
        RunSignal::Reset => {
            tracing::warn!(stage_id = %boot.stage_id, "stage reset before run signal; rejoining boot loop");
            return Ok(());
        }
        RunSignal::Go => {}
    }

    let error = execute_stage(config, &boot).await.err();
    ack_run(http, config, &boot.stage_id, error.as_ref()).await?;
    Ok(())
}

/// `GET /boot` with `Tries = -1` (spec.md §4.5 "Tries = -1 means retry
/// forever... used when waiting for the coordinator to publish a stage").
async fn boot_loop(http: &reqwest::Client, config: &WorkerConfig) -> Result<BootResponse, SqlmeterError> {
    let policy = RetryPolicy::forever(BOOT_TRY_TIMEOUT, BOOT_TRY_WAIT);
    policy
        .run(|| async {
            let url = format!(
                "{}/boot?name={}&stage-id=",
                config.coordinator_base_url, config.name
            );
            let resp = http.get(&url).send().await?;
            if resp.status() == reqwest::StatusCode::GONE {
                return Err(SqlmeterError::Fleet("coordinator has no stage yet".into()));
            }
            let boot: BootResponse = resp.json().await.map_err(SqlmeterError::Http)?;
            Ok(boot)
        })
        .await
}

async fn fetch_files(
    http: &reqwest::Client,
    config: &WorkerConfig,
    boot: &BootResponse,
) -> Result<(), SqlmeterError> {
    std::fs::create_dir_all(&config.base_dir)?;
    for (i, entry) in boot.config.trx.iter().enumerate() {
        let url = format!(
            "{}/file?name={}&stage-id={}&i={i}",
            config.coordinator_base_url, config.name, boot.stage_id
        );
        let resp = http.get(&url).send().await.map_err(SqlmeterError::Http)?;
        let bytes = resp.bytes().await.map_err(SqlmeterError::Http)?;
        std::fs::write(config.base_dir.join(&entry.file), &bytes)?;
    }
    Ok(())
}

/// `POST /boot` with an empty body (spec.md §4.5 `/boot` POST row). Finite
/// retries; exhaustion is terminal for the worker process (spec.md §7).
async fn ack_boot(http: &reqwest::Client, config: &WorkerConfig, stage_id: &str) -> Result<(), SqlmeterError> {
    let policy = RetryPolicy::finite(BOOT_TRY_TIMEOUT, BOOT_TRY_WAIT, BOOT_ACK_TRIES);
    policy
        .run(|| async {
            let url = format!(
                "{}/boot?name={}&stage-id={stage_id}",
                config.coordinator_base_url, config.name
            );
            let resp = http.post(&url).body("").send().await.map_err(SqlmeterError::Http)?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(SqlmeterError::Fleet(format!("boot ack rejected: {}", resp.status())))
            }
        })
        .await
}

enum RunSignal {
    Go,
    Reset,
}

/// `GET /run`: blocks server-side until the boot barrier closes, so a
/// timed-out attempt just means "still waiting" and is retried forever
/// (spec.md §4.5 `/run` GET row, §5 "run-wait poll 60 s per try").
async fn wait_for_run(
    http: &reqwest::Client,
    config: &WorkerConfig,
    stage_id: &str,
) -> Result<RunSignal, SqlmeterError> {
    let policy = RetryPolicy::forever(RUN_WAIT_TIMEOUT, Duration::from_secs(1));
    policy
        .run(|| async {
            let url = format!(
                "{}/run?name={}&stage-id={stage_id}",
                config.coordinator_base_url, config.name
            );
            let resp = http.get(&url).send().await.map_err(SqlmeterError::Http)?;
            if resp.status() == reqwest::StatusCode::RESET_CONTENT {
                Ok(RunSignal::Reset)
            } else if resp.status().is_success() {
                Ok(RunSignal::Go)
            } else {
                Err(SqlmeterError::Fleet(format!("run wait rejected: {}", resp.status())))
            }
        })
        .await
}

/// Runs the stage locally and forwards every interval report to the
/// coordinator's `/stats` endpoint, in addition to this process's own
/// stdout summary (spec.md §4.6 "Reporters... remote").
async fn execute_stage(config: &WorkerConfig, boot: &BootResponse) -> Result<(), SqlmeterError> {
    let remote = RemoteReporter::new(
        config.coordinator_base_url.clone(),
        config.name.clone(),
        boot.stage_id.clone(),
    );
    let reporters: Vec<std::sync::Arc<dyn Reporter>> =
        vec![std::sync::Arc::new(StdoutReporter), std::sync::Arc::new(remote)];
    let stage = Stage::prepare(boot.config.clone(), &config.base_dir, reporters).await?;
    let outcome = stage.run(CancellationToken::new()).await;

    let failed = outcome.results.iter().any(|r| r.outcome.error.is_some());
    if failed {
        return Err(SqlmeterError::Client(
            "one or more clients reported a fatal error".into(),
        ));
    }
    Ok(())
}

/// `POST /run`: empty body on a clean finish, the error text otherwise
/// (spec.md §4.5 `/run` POST row). Finite retries; exhaustion is terminal.
async fn ack_run(
    http: &reqwest::Client,
    config: &WorkerConfig,
    stage_id: &str,
    error: Option<&SqlmeterError>,
) -> Result<(), SqlmeterError> {
    let policy = RetryPolicy::finite(BOOT_TRY_TIMEOUT, BOOT_TRY_WAIT, RUN_ACK_TRIES);
    let body = error.map(|e| e.to_string()).unwrap_or_default();
    policy
        .run(|| {
            let body = body.clone();
            async move {
                let url = format!(
                    "{}/run?name={}&stage-id={stage_id}",
                    config.coordinator_base_url, config.name
                );
                let resp = http.post(&url).body(body).send().await.map_err(SqlmeterError::Http)?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(SqlmeterError::Fleet(format!("run ack rejected: {}", resp.status())))
                }
            }
        })
        .await
}
