//! Health endpoints over HTTP.
//!
//! The only HTTP surface this service exposes. All real traffic arrives
//! over the broker; these routes exist for orchestrators and operators.
//!
//! Follows the deferred startup pattern: `new()` allocates state,
//! `start()` binds the TCP listener, and `serve()` accepts connections
//! until shutdown is signalled.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::RpcClient;
use crate::config::HttpConfig;
use crate::shutdown::{HealthState, ShutdownController};

/// Shared state for the health handlers.
#[derive(Clone)]
pub struct AppState {
    pub shutdown: Arc<ShutdownController>,
    pub rpc: Arc<RpcClient>,
    pub start_time: Instant,
}

/// Returns detailed health information as JSON.
///
/// Always returns 200; the `state` field in the body says whether the
/// service is actually healthy, so monitoring can tell "up but
/// draining" from "down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "state": state.shutdown.health_state().as_str(),
        "pending_calls": state.rpc.pending_count(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe. Only checks that the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe. 503 before the listener is up, while draining, and
/// after stop, so no new traffic is routed here.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Health endpoint server lifecycle.
///
/// 1. `new()` stores config and shared state
/// 2. `start()` binds the TCP listener to the configured address
/// 3. `serve()` accepts connections until the shutdown future resolves
pub struct HttpServer {
    config: HttpConfig,
    state: AppState,
    listener: Option<TcpListener>,
}

impl HttpServer {
    #[must_use]
    pub fn new(config: HttpConfig, shutdown: Arc<ShutdownController>, rpc: Arc<RpcClient>) -> Self {
        Self {
            config,
            state: AppState {
                shutdown,
                rpc,
                start_time: Instant::now(),
            },
            listener: None,
        }
    }

    /// Assembles the axum router with routes and middleware.
    pub fn build_router(&self) -> Router {
        let layers = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.config.request_timeout,
            ))
            .into_inner();

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(layers)
            .with_state(self.state.clone())
    }

    /// Binds the TCP listener and returns the actual bound port, which
    /// differs from the configured one when port 0 is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("health endpoints bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown future resolves.
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal I/O failure.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .expect("start() must be called before serve()");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::MemoryBroker;
    use crate::config::BrokerConfig;

    use super::*;

    fn test_state() -> AppState {
        let rpc = RpcClient::new(Arc::new(MemoryBroker::new()), BrokerConfig::default());
        AppState {
            shutdown: Arc::new(ShutdownController::new()),
            rpc: Arc::new(rpc),
            start_time: Instant::now(),
        }
    }

    fn test_server(state: AppState) -> HttpServer {
        HttpServer {
            config: HttpConfig {
                port: 0,
                ..HttpConfig::default()
            },
            state,
            listener: None,
        }
    }

    #[tokio::test]
    async fn health_handler_returns_json_with_all_fields() {
        let state = test_state();
        state.shutdown.set_ready();

        let json = health_handler(State(state)).await.0;

        assert_eq!(json["state"], "ready");
        assert_eq!(json["pending_calls"], 0);
        assert_eq!(json["in_flight"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_handler_reports_starting_state() {
        let json = health_handler(State(test_state())).await.0;
        assert_eq!(json["state"], "starting");
    }

    #[tokio::test]
    async fn health_handler_reports_in_flight_work() {
        let state = test_state();
        let _guard = state.shutdown.in_flight_guard();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["in_flight"], 1);
    }

    #[tokio::test]
    async fn liveness_always_answers_200() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_tracks_health_state() {
        let state = test_state();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn start_binds_an_os_assigned_port() {
        let mut server = test_server(test_state());
        let port = server.start().await.unwrap();
        assert!(port > 0);
        assert!(server.listener.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "start() must be called before serve()")]
    async fn serve_panics_without_start() {
        let server = test_server(test_state());
        let _ = server.serve(std::future::pending::<()>()).await;
    }
}
