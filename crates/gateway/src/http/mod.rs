mod api;
mod sse;
mod ws;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// REST + SSE + WebSocket surface over the gateway components.
pub fn router(state: AppState) -> Router {
    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);
    for origin in &state.config.allowed_origins {
        if let Ok(value) = origin.parse::<HeaderValue>() {
            cors = cors.allow_origin(value);
        }
    }

    Router::new()
        .route("/health", get(api::health))
        .route("/api/models", get(api::list_models))
        .route("/api/account/rate-limits", get(api::rate_limits))
        .route("/api/threads", get(api::list_threads).post(api::create_thread))
        .route("/api/threads/:id", get(api::read_thread))
        .route("/api/threads/:id/context", get(api::thread_context))
        .route("/api/threads/:id/timeline", get(api::thread_timeline))
        .route("/api/threads/:id/turns", post(api::start_turn))
        .route("/api/threads/:id/review", post(api::start_review))
        .route("/api/threads/:id/control", post(api::control))
        .route(
            "/api/threads/:id/approvals/pending",
            get(api::pending_approvals),
        )
        .route("/api/threads/:id/approvals/:aid", post(api::decide_approval))
        .route(
            "/api/threads/:id/interactions/pending",
            get(api::pending_interactions),
        )
        .route(
            "/api/threads/:id/interactions/:iid/respond",
            post(api::respond_interaction),
        )
        .route("/api/threads/:id/events", get(sse::thread_events))
        .route("/api/terminal/ws", get(ws::terminal_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
