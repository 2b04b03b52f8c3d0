use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::{get, post},
};
use once_cell::sync::Lazy;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::{
    backend::CompletionBackend,
    device::DeviceKind,
    error::ServiceError,
    model::{GenerateRequest, GenerateResponse, HealthResponse},
};

/// libtorch release that `tch` 0.20 binds and `download-libtorch` fetches.
/// Bump together with the `tch` version in `Cargo.toml`.
pub const TORCH_VERSION: &str = "2.7.0";

/// `rustc --version` of the compiler that built this binary, captured by
/// `build.rs`. Reported in the language-runtime slot of `/health`.
pub const RUST_VERSION: &str = env!("RUSTC_VERSION");

static PLATFORM: Lazy<String> = Lazy::new(|| {
    format!(
        "{}-{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::env::consts::FAMILY
    )
});

#[derive(Clone)]
pub struct AppState {
    pub local: Arc<dyn CompletionBackend>,
    /// Present only when a remote credential is configured.
    pub remote: Option<Arc<dyn CompletionBackend>>,
    /// Probed once at startup.
    pub device: DeviceKind,
}

impl AppState {
    pub fn new(
        local: Arc<dyn CompletionBackend>,
        remote: Option<Arc<dyn CompletionBackend>>,
        device: DeviceKind,
    ) -> Self {
        Self {
            local,
            remote,
            device,
        }
    }

    fn backend_for(&self, use_remote: bool) -> &Arc<dyn CompletionBackend> {
        match &self.remote {
            Some(remote) if use_remote => remote,
            _ => &self.local,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        device: state.device,
        platform: PLATFORM.clone(),
        python_version: RUST_VERSION,
        torch_version: TORCH_VERSION,
        openai_available: state.remote.is_some(),
    })
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ServiceError> {
    let Json(request) = payload?;
    let params = request.params()?;

    let backend = state.backend_for(request.use_openai);
    debug!(
        backend = backend.name(),
        max_length = params.max_length,
        randomness = params.randomness,
        "dispatching generation"
    );

    let response = backend.complete(params).await.inspect_err(|err| {
        warn!(backend = backend.name(), error = %err, "generation failed");
    })?;

    Ok(Json(GenerateResponse { response }))
}
