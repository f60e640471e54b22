//! The coordinator-side HTTP plane: one `axum::Router` wiring spec.md
//! §4.5/§6's endpoints onto [`super::coordinator::StageSession`] methods.
//!
//! Every route first resolves the current session and applies the fencing
//! rule ("if a worker is assigned but its `stage-id` does not match the
//! current stage's id and the stage is not done, answer Gone") before
//! delegating to the session.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::coordinator::{Coordinator, FleetOutcome, StageSession};
use crate::stats::Instance;

impl IntoResponse for FleetOutcome {
    fn into_response(self) -> Response {
        match self {
            FleetOutcome::Ok => StatusCode::OK.into_response(),
            FleetOutcome::OkJson(value) => (StatusCode::OK, Json(value)).into_response(),
            FleetOutcome::OkBytes(bytes) => {
                (StatusCode::OK, [(header::CONTENT_TYPE, "application/octet-stream")], bytes)
                    .into_response()
            }
            FleetOutcome::Reset => StatusCode::RESET_CONTENT.into_response(),
            FleetOutcome::Gone => StatusCode::GONE.into_response(),
            FleetOutcome::PreconditionFailed => StatusCode::PRECONDITION_FAILED.into_response(),
            FleetOutcome::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            FleetOutcome::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

/// Query params every endpoint requires (spec.md §6 "Query params `name`
/// and `stage-id` required on every request").
#[derive(Debug, Deserialize)]
struct FleetParams {
    name: String,
    #[serde(rename = "stage-id")]
    stage_id: String,
}

impl FleetParams {
    /// "`name` must have `\n` and `\r` stripped" (spec.md §6).
    fn sanitized_name(&self) -> String {
        self.name.chars().filter(|c| *c != '\n' && *c != '\r').collect()
    }
}

#[derive(Debug, Deserialize)]
struct FileParams {
    #[serde(flatten)]
    common: FleetParams,
    i: usize,
}

/// Resolve the current session and apply the stage-id fencing rule.
///
/// An empty `stage-id` means the caller hasn't been told a stage id yet —
/// the state a worker is in before its very first `GET /boot` response —
/// so it bypasses the equality check entirely rather than being fenced out
/// of a stage it has no way to already know about.
fn fenced_session(coordinator: &Coordinator, stage_id: &str) -> Result<Arc<StageSession>, FleetOutcome> {
    match coordinator.session() {
        None => Err(FleetOutcome::Gone),
        Some(session) => {
            if !stage_id.is_empty() && session.id != stage_id && !session.is_done() {
                Err(FleetOutcome::Gone)
            } else {
                Ok(session)
            }
        }
    }
}

async fn boot_get_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FleetParams>,
) -> FleetOutcome {
    match fenced_session(&coordinator, &params.stage_id) {
        Ok(session) => session.boot_get(&params.sanitized_name()),
        Err(outcome) => outcome,
    }
}

async fn boot_post_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FleetParams>,
    body: String,
) -> FleetOutcome {
    match fenced_session(&coordinator, &params.stage_id) {
        Ok(session) => session.boot_post(&params.sanitized_name(), &body),
        Err(outcome) => outcome,
    }
}

async fn file_get_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FileParams>,
) -> FleetOutcome {
    match fenced_session(&coordinator, &params.common.stage_id) {
        Ok(session) => session.file_get(params.i),
        Err(outcome) => outcome,
    }
}

async fn run_get_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FleetParams>,
) -> FleetOutcome {
    match fenced_session(&coordinator, &params.stage_id) {
        Ok(session) => session.run_get(&params.sanitized_name()).await,
        Err(outcome) => outcome,
    }
}

async fn run_post_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FleetParams>,
    body: String,
) -> FleetOutcome {
    match fenced_session(&coordinator, &params.stage_id) {
        Ok(session) => session.run_post(&params.sanitized_name(), &body),
        Err(outcome) => outcome,
    }
}

async fn stats_post_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FleetParams>,
    Json(instance): Json<Instance>,
) -> FleetOutcome {
    match fenced_session(&coordinator, &params.stage_id) {
        Ok(session) => session.stats_post(instance).await,
        Err(outcome) => outcome,
    }
}

async fn ping_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FleetParams>,
) -> FleetOutcome {
    match fenced_session(&coordinator, &params.stage_id) {
        Ok(session) => session.ping(&params.sanitized_name()),
        Err(outcome) => outcome,
    }
}

/// Build the coordinator's HTTP plane (spec.md §4.5 endpoint table).
pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/boot", get(boot_get_handler).post(boot_post_handler))
        .route("/file", get(file_get_handler))
        .route("/run", get(run_get_handler).post(run_post_handler))
        .route("/stats", post(stats_post_handler))
        .route("/ping", get(ping_handler))
        .with_state(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn config() -> StageConfig {
        StageConfig {
            name: "s".into(),
            dsn: "mysql://localhost/db".into(),
            database: None,
            runtime: None,
            qps: None,
            tps: None,
            trx: Vec::new(),
            workload: Vec::new(),
            instances: 2,
            bind: None,
        }
    }

    async fn router_with_stage(required_acks: usize, local_enabled: bool) -> (Router, Arc<Coordinator>) {
        let coordinator = Coordinator::new();
        let dir = tempfile::tempdir().unwrap();
        let session =
            StageSession::new("stage-1".into(), config(), dir.path(), required_acks, local_enabled).unwrap();
        coordinator.set_stage(Some(session)).await;
        (build_router(coordinator.clone()), coordinator)
    }

    #[tokio::test]
    async fn boot_without_a_stage_returns_gone() {
        let coordinator = Coordinator::new();
        let router = build_router(coordinator);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/boot?name=w1&stage-id=whatever")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn boot_with_wrong_stage_id_is_fenced() {
        let (router, _coordinator) = router_with_stage(2, true).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/boot?name=w1&stage-id=wrong-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn boot_get_returns_stage_config_json() {
        let (router, _coordinator) = router_with_stage(2, true).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/boot?name=w1&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["stage_id"], "stage-1");
    }

    #[tokio::test]
    async fn full_boot_to_run_handshake() {
        let (router, _coordinator) = router_with_stage(2, true).await;

        let boot = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/boot?name=w1&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(boot.status(), StatusCode::OK);

        let ack = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/boot?name=w1&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ack.status(), StatusCode::OK);

        let run = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/run?name=w1&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::OK);

        let done = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run?name=w1&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(done.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ping_unknown_worker_is_gone() {
        let (router, _coordinator) = router_with_stage(2, true).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/ping?name=ghost&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn cleared_stage_pointer_answers_gone_even_for_the_old_id() {
        let (router, coordinator) = router_with_stage(2, true).await;
        router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/boot?name=w1&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        coordinator.set_stage(None).await;

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/ping?name=w1&stage-id=stage-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE, "stage pointer cleared entirely");
    }
}
