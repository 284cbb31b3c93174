//! HTTP/WebSocket server assembly (C3): router, middleware, and the
//! `AppState` threaded through every handler.

pub mod health;
pub mod state;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::routes;
use state::AppState;

fn cors_layer(cors_origin: &str) -> CorsLayer {
    let allow_origin = if cors_origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        match cors_origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                tracing::warn!(cors_origin, "invalid CORS_ORIGIN value, falling back to *");
                AllowOrigin::any()
            }
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the gateway's axum [`Router`]: `/ws` for the typed protocol socket,
/// `/auth/*` for the bearer token surface (C2), `/health` for liveness.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/auth/login", post(routes::login))
        .route("/auth/verify", get(routes::verify))
        .route("/auth/refresh", post(routes::refresh))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
