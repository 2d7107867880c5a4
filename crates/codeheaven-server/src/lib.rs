//! WebSocket gateway for the CodeHeaven execution service.
//!
//! Clients connect to `/ws`, send one JSON request per execution and receive
//! the program's output as a stream of JSON messages. `/languages` lists the
//! runtimes the service can run and `/health` reports liveness.

pub mod error;
pub mod session;

pub use error::{Result, ServerError};
pub use session::{handle_connection, Session};

use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::{middleware, Router};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use codeheaven_core::config::ServerSettings;
use codeheaven_core::{LanguageRegistry, SandboxExecutor};

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// Allowed origins. Any origin is allowed when empty.
    pub cors_origins: Vec<String>,
    pub enable_logging: bool,
    /// Largest accepted inbound text frame in bytes.
    pub max_message_size: usize,
}

impl ServerConfig {
    /// Build from the `server` section of the configuration file.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let bind_addr = settings.bind_addr.parse().map_err(|e| {
            ServerError::config_error(format!(
                "Invalid bind address '{}': {}",
                settings.bind_addr, e
            ))
        })?;
        Ok(Self {
            bind_addr,
            enable_cors: settings.enable_cors,
            cors_origins: settings.cors_origins.clone(),
            enable_logging: settings.enable_logging,
            max_message_size: settings.max_message_size,
        })
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    /// Largest frame the WebSocket layer will buffer. Frames between
    /// `max_message_size` and this ceiling get an `error` reply from the
    /// session; larger ones close the connection.
    pub fn frame_ceiling(&self) -> usize {
        self.max_message_size.saturating_mul(2)
    }
}

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LanguageRegistry>,
    pub executor: SandboxExecutor,
    pub config: ServerConfig,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn languages_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "languages": state.registry.profiles(),
        "timestamp": chrono::Utc::now(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let ceiling = state.config.frame_ceiling();
    ws.max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

/// The execution gateway.
pub struct CodeHeavenServer {
    state: AppState,
}

impl CodeHeavenServer {
    pub fn new(
        registry: LanguageRegistry,
        executor: SandboxExecutor,
        config: ServerConfig,
    ) -> Self {
        Self {
            state: AppState {
                registry: Arc::new(registry),
                executor,
                config,
            },
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let config = &self.state.config;
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/languages", get(languages_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone());

        if config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>,
                 next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // Health probes are frequent
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::debug!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if config.enable_cors {
            let cors_layer = if config.cors_origins.is_empty() {
                CorsLayer::permissive()
            } else {
                let origins: std::result::Result<Vec<_>, _> =
                    config.cors_origins.iter().map(|s| s.parse()).collect();
                match origins {
                    Ok(origins) => CorsLayer::new()
                        .allow_origin(origins)
                        .allow_methods(Any)
                        .allow_headers(Any),
                    Err(_) => {
                        log::warn!("Invalid CORS origin in configuration, allowing any origin");
                        CorsLayer::permissive()
                    }
                }
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Serve until `shutdown_signal` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.state.config.bind_addr;
        let router = self.build_router();
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ServerError::config_error(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        log::info!("CodeHeaven execution service listening on {}", bind_addr);
        log::info!("WebSocket endpoint: ws://{}/ws", bind_addr);
        log::info!("Languages: http://{}/languages", bind_addr);
        log::info!("Health check: http://{}/health", bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("CodeHeaven execution service shut down gracefully");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
