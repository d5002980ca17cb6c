pub mod error;
pub mod janitor;
pub mod routes;
pub mod state;
pub mod ws;

use axum::{
    Router,
    http::HeaderValue,
    routing::get,
};
use state::AppState;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.app.cors_origins);

    // Pull binding
    let api = Router::new()
        .route(
            "/peer-discovery",
            get(routes::peer_discovery::lookup)
                .post(routes::peer_discovery::register)
                .delete(routes::peer_discovery::unregister),
        )
        .route(
            "/signal",
            get(routes::signal::list).post(routes::signal::post),
        );

    // Health check
    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api.clone())
        .merge(api)
        .merge(health)
        .route("/ws", get(ws::handler::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(parsed))
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.store.backend_name(),
        "connections": state.ws_storage.connection_count(),
        "meetings": state.rooms.meeting_count(),
    }))
}
