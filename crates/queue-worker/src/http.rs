// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The health HTTP surface: `GET /live`, `GET /ready`, `GET /health`
//! (spec.md §6.3).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use queue_core::HealthSurface;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
struct AppState {
    surface: Arc<HealthSurface>,
    budget: std::time::Duration,
}

/// Build the router over a shared [`HealthSurface`].
pub fn router(surface: Arc<HealthSurface>, budget: std::time::Duration) -> Router {
    let state = AppState { surface, budget };
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve the health router until `shutdown` resolves.
pub async fn serve(
    router: Router,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health surface listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn live(State(state): State<AppState>) -> impl IntoResponse {
    if state.surface.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.surface.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.surface.report(state.budget).await;
    Json(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use queue_core::{DistributedProcessor, LifecycleManager, LifecycleState};
    use queue_store::{Dialect, QueueStore, SqliteStore, StoreDescriptor};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_router(running: bool) -> Router {
        let descriptor = StoreDescriptor {
            dialect: Dialect::Sqlite,
            connection_string: "sqlite::memory:".to_string(),
            pool_size: 1,
            max_overflow: 0,
            query_timeout: Duration::from_secs(5),
            read_only: false,
        };
        let store = SqliteStore::connect(&descriptor).await.unwrap();
        store.migrate().await.unwrap();
        let processor = Arc::new(DistributedProcessor::new(Arc::new(store), "demo", "worker-test"));
        let lifecycle = Arc::new(LifecycleManager::new(10));
        lifecycle.transition(LifecycleState::Starting, "validate_env");
        if running {
            lifecycle.transition(LifecycleState::Running, "all_dependencies_ready");
        }

        let surface = Arc::new(HealthSurface::new(
            processor,
            Vec::new(),
            lifecycle,
            Duration::from_millis(500),
            10_000,
            Duration::from_secs(2),
        ));
        router(surface, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn live_is_200_once_the_process_has_started() {
        let app = test_router(false).await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_is_503_until_lifecycle_is_running() {
        let app = test_router(false).await;
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_is_200_once_running_with_reachable_store() {
        let app = test_router(true).await;
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_the_full_json_shape() {
        let app = test_router(true).await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["instance"]["flow"], "demo");
        assert!(json["queue"].is_object());
        assert!(json["lifecycle"]["state"].is_string());
    }
}
