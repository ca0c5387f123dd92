//! HTTP API gateway for taskforge.
//!
//! Exposes setup endpoints for providers, models and agents, the task
//! endpoints that feed the reconciler, and an SSE stream of task events.
//!
//! Built on Axum. Handlers only touch the store and fire triggers on the
//! [`EventBus`]; the reconciler does the rest.

pub mod api_v1;
mod error;

pub use error::GatewayError;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header, request};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use taskforge_config::GatewayConfig;
use taskforge_core::{EventBus, EventHub, Store};
use taskforge_security::SecretsManager;

/// Request bodies above this size are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub store: Arc<dyn Store>,
    pub secrets: Arc<SecretsManager>,
    pub bus: Arc<EventBus>,
    pub hub: Arc<EventHub>,
}

pub type SharedState = Arc<GatewayState>;

/// Build the router with every gateway route.
///
/// Layers applied:
/// - CORS limited to localhost origins
/// - Request body size limit (1 MiB)
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            |origin: &HeaderValue, _: &request::Parts| is_localhost(origin),
        ))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Bind the configured address and serve `router` until the listener fails.
pub async fn serve(config: &GatewayConfig, router: Router) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, router).await
}

fn is_localhost(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };
    let host = match rest.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or_default(),
        None => rest.split(':').next().unwrap_or_default(),
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use taskforge_core::{Task, TaskId};
    use taskforge_store::InMemoryStore;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        Arc::new(GatewayState {
            hub: Arc::new(EventHub::new(store.clone(), 16)),
            store,
            secrets: Arc::new(SecretsManager::new("test-passphrase")),
            bus: Arc::new(EventBus::new(16)),
        })
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(test_state());

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let state = test_state();
        let task = state.store.create_task(Task::new("a1", "/tmp")).await.unwrap();
        let app = build_router(state);

        let content = "x".repeat(MAX_BODY_BYTES + 1);
        let req = Request::builder()
            .method("POST")
            .uri(format!("/v1/tasks/{}/messages", task.id))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "content": content }).to_string()))
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_routes_are_404() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri(format!("/v1/tasks/{}/nope", TaskId::new()))
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn only_local_origins_pass_cors() {
        let ok = |s: &str| is_localhost(&HeaderValue::from_str(s).unwrap());
        assert!(ok("http://localhost:5173"));
        assert!(ok("http://127.0.0.1"));
        assert!(ok("http://[::1]:8080"));
        assert!(!ok("https://example.com"));
        assert!(!ok("http://localhost.evil.com"));
        assert!(!ok("null"));
    }
}
