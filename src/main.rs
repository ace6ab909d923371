/**
 * Facegate Server
 * Face-verification gate for the credential vault UI
 *
 * Handles:
 * - Session lifecycle (open in enroll or verify mode, status, close)
 * - One capture-compare-report cycle per submitted frame
 * - Enrollment record persistence behind the gate
 */

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod capture;
mod config;
mod error;
mod gate;
mod scheduler;
mod signature;
mod store;

use capture::{Frame, FrameSlot};
use config::Config;
use error::GateError;
use gate::{GateMode, GateStatus, VerificationGate, VerificationOutcome};
use scheduler::ActionSlot;
use signature::{ModelBackend, SignatureEngine};
use store::FileStore;

#[derive(Clone)]
struct AppState {
    gate: Arc<VerificationGate>,
    frames: Arc<FrameSlot>,
    /// The collaborator's one deferred action, unlocked by a gate pass.
    actions: Arc<ActionSlot<String>>,
}

#[derive(Deserialize)]
struct OpenRequest {
    mode: GateMode,
    threshold: Option<f32>,
}

#[derive(Deserialize)]
struct CaptureRequest {
    width: u32,
    height: u32,
    data: String, // Base64-encoded 8-bit luma, row-major
}

#[derive(Deserialize)]
struct PendingRequest {
    action: String,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting Facegate Server");

    let config = Config::from_env();

    let backend = Arc::new(ModelBackend::new(config.models_dir.clone()));
    let engine = Arc::new(SignatureEngine::new(backend));
    let store = Arc::new(FileStore::new(config.store_dir.clone()));
    let frames = Arc::new(FrameSlot::new());
    let gate = Arc::new(VerificationGate::new(engine, store, frames.clone()));
    let actions = Arc::new(ActionSlot::new());

    let state = AppState {
        gate,
        frames,
        actions,
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind listen address");

    info!("Facegate Server listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/gate/open", post(gate_open))
        .route("/gate/capture", post(gate_capture))
        .route("/gate/close", post(gate_close))
        .route("/gate/status", get(gate_status))
        .route("/action/pending", post(action_pending))
        .route("/action/take", post(action_take))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn gate_open(
    State(state): State<AppState>,
    Json(request): Json<OpenRequest>,
) -> Result<Json<GateStatus>, StatusCode> {
    info!("Gate open request: mode={:?}", request.mode);

    state
        .gate
        .open(request.mode, request.threshold)
        .await
        .map(Json)
        .map_err(|err| {
            warn!("Gate open failed: {}", err);
            error_status(&err)
        })
}

async fn gate_capture(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<VerificationOutcome>, StatusCode> {
    // Decode the submitted still frame
    let pixels = STANDARD
        .decode(&request.data)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let frame = Frame::new(request.width, request.height, pixels).map_err(|err| {
        warn!("Rejected frame: {}", err);
        error_status(&err)
    })?;

    state.frames.submit(frame).await;

    let outcome = state.gate.capture_and_evaluate().await.map_err(|err| {
        warn!("Capture attempt refused: {}", err);
        error_status(&err)
    })?;

    Ok(Json(outcome))
}

async fn gate_close(State(state): State<AppState>) -> StatusCode {
    state.gate.close().await;
    // Cancelling the gate discards whatever the pass would have unlocked
    state.actions.clear();
    StatusCode::OK
}

async fn gate_status(State(state): State<AppState>) -> Json<GateStatus> {
    Json(state.gate.status().await)
}

async fn action_pending(
    State(state): State<AppState>,
    Json(request): Json<PendingRequest>,
) -> StatusCode {
    state.actions.set_pending(request.action);
    StatusCode::OK
}

async fn action_take(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "action": state.actions.take_and_clear() }))
}

fn error_status(err: &GateError) -> StatusCode {
    match err {
        GateError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
        GateError::NoSession | GateError::NotReady | GateError::SessionAlreadyOpen => {
            StatusCode::CONFLICT
        }
        GateError::BadFrame(_) => StatusCode::BAD_REQUEST,
        GateError::Capture(_) | GateError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
