use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codegen_service::{AppConfig, AppState, CompletionBackend, ModelHost, OpenAiClient, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(?config, "loading model");

    let host = ModelHost::initialize(&config).inspect_err(|err| {
        tracing::error!(error = %err, model_id = %config.model_id, "error loading model");
    })?;
    let device = host.device();
    tracing::info!(model_id = host.model_id(), %device, "model host initialised");

    let remote = OpenAiClient::from_config(&config)
        .map(|client| Arc::new(client) as Arc<dyn CompletionBackend>);
    let state = AppState::new(Arc::new(host), remote, device);
    let router = build_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, openai_available = config.openai_available(), "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
