use std::time::Duration;

use rendezvous_api::{build_router, janitor::spawn_janitor, state::AppState};
use rendezvous_config::Settings;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (silently ignore if missing)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "rendezvous_api=debug,rendezvous_services=debug,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load config
    let settings = Settings::load()?;
    info!("Starting Rendezvous API on {}:{}", settings.app.host, settings.app.port);
    info!(
        backend = ?settings.store.backend,
        eviction_window_secs = settings.presence.eviction_window_secs,
        "Signal store config"
    );

    // Build app state (connects to Redis when configured)
    let app_state = AppState::new(settings.clone()).await?;

    let janitor = spawn_janitor(
        app_state.store.clone(),
        Duration::from_secs(settings.events.janitor_interval_secs.max(1)),
    );

    // Build router
    let app = build_router(app_state);

    // Start server
    let addr = format!("{}:{}", settings.app.host, settings.app.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    janitor.abort();
    Ok(())
}
