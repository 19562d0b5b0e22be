//! HTTP Server for Health and Metrics Endpoints
//!
//! Provides REST endpoints for monitoring and health checks.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::connection_registry::ConnectionRegistry;
use crate::metrics::RelayMetrics;
use crate::offline_queue::OfflineQueue;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    pub metrics_token: Option<String>,
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<dyn OfflineQueue>,
}

/// Middleware to check bearer token for metrics endpoint.
async fn metrics_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/metrics" {
        if let Some(ref expected_token) = state.metrics_token {
            let is_authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .is_some_and(|token| token == expected_token);

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

/// Creates the HTTP router with health and metrics endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_auth_middleware,
        ))
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics"]
    }))
}

/// Reports live sessions and the offline backlog.
async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let queue = state.queue.clone();
    let pending = tokio::task::spawn_blocking(move || {
        (queue.message_count(), queue.recipient_count())
    })
    .await;

    match pending {
        Ok((messages, recipients)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "connected_users": state.registry.connected_count(),
                "offline_messages": messages,
                "offline_recipients": recipients,
            })),
        ),
        Err(e) => {
            tracing::error!("Health check task failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
        }
    }
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::ChatMessage;
    use crate::offline_queue::{MemoryOfflineQueue, DEFAULT_OFFLINE_TTL};
    use axum::body::Body;
    use tower::ServiceExt;

    fn create_test_state(metrics_token: Option<&str>) -> HttpState {
        HttpState {
            metrics: RelayMetrics::new(),
            metrics_token: metrics_token.map(str::to_string),
            registry: Arc::new(ConnectionRegistry::new()),
            queue: Arc::new(MemoryOfflineQueue::new(
                DEFAULT_OFFLINE_TTL,
                Arc::new(ManualClock::new(1_000)),
            )),
        }
    }

    async fn get_status(app: Router, uri: &str, auth: Option<&str>) -> StatusCode {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = create_router(create_test_state(None));
        assert_eq!(get_status(app, "/metrics", None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_requires_token_when_configured() {
        let state = create_test_state(Some("s3cret"));

        let app = create_router(state.clone());
        assert_eq!(
            get_status(app, "/metrics", None).await,
            StatusCode::UNAUTHORIZED
        );

        let app = create_router(state.clone());
        assert_eq!(
            get_status(app, "/metrics", Some("Bearer wrong")).await,
            StatusCode::UNAUTHORIZED
        );

        let app = create_router(state.clone());
        assert_eq!(
            get_status(app, "/metrics", Some("Bearer s3cret")).await,
            StatusCode::OK
        );

        // Only /metrics is protected
        let app = create_router(state);
        assert_eq!(get_status(app, "/health", None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_backlog() {
        let state = create_test_state(None);
        state
            .queue
            .enqueue(&ChatMessage {
                sender: 1,
                recipient: 2,
                content: "hi".to_string(),
                sent_at: 1_000,
            })
            .unwrap();

        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connected_users"], 0);
        assert_eq!(json["offline_messages"], 1);
        assert_eq!(json["offline_recipients"], 1);
    }
}
