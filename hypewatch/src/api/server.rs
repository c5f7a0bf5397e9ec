//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::AppConfig;
use crate::database::repositories::HypeEventRepository;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::pipeline::{BroadcastRegistry, BurstDetector, MetricsAggregator, MonitoredChannels};
use crate::services::ServiceContainer;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Allow requests from any origin
    pub allow_any_origin: bool,
    /// Allowed CORS origins when `allow_any_origin` is off
    pub cors_origins: Vec<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            allow_any_origin: true,
            cors_origins: Vec::new(),
        }
    }
}

impl ApiServerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            bind_address: config.api_bind_address.clone(),
            port: config.api_port,
            allow_any_origin: config.cors_allow_any(),
            cors_origins: config.cors_origins.clone(),
        }
    }

    fn cors_layer(&self) -> CorsLayer {
        let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if self.allow_any_origin {
            return cors.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = self
            .cors_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    /// Monitored channel list (and the chat source behind it)
    pub channels: Arc<MonitoredChannels>,
    pub aggregator: Arc<MetricsAggregator>,
    pub detector: Arc<BurstDetector>,
    pub metrics_registry: Arc<BroadcastRegistry>,
    pub hype_registry: Arc<BroadcastRegistry>,
    /// Hype event store
    pub hype_repository: Option<Arc<dyn HypeEventRepository>>,
    /// Logging configuration for dynamic log level changes
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    /// Create application state over the pipeline services, without storage or
    /// logging control.
    pub fn new(
        channels: Arc<MonitoredChannels>,
        aggregator: Arc<MetricsAggregator>,
        detector: Arc<BurstDetector>,
        metrics_registry: Arc<BroadcastRegistry>,
        hype_registry: Arc<BroadcastRegistry>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            channels,
            aggregator,
            detector,
            metrics_registry,
            hype_registry,
            hype_repository: None,
            logging_config: None,
        }
    }

    /// Create application state with all services from the container.
    pub fn from_container(container: &ServiceContainer) -> Self {
        Self::new(
            container.channels.clone(),
            container.aggregator.clone(),
            container.detector.clone(),
            container.metrics_registry.clone(),
            container.hype_registry.clone(),
        )
        .with_repository(container.hype_repository.clone())
    }

    pub fn with_repository(mut self, repository: Arc<dyn HypeEventRepository>) -> Self {
        self.hype_repository = Some(repository);
        self
    }

    pub fn with_logging_config(mut self, logging_config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(logging_config);
        self
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn with_state(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Tie the server's lifetime to an external token.
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let router = routes::create_router(self.state.clone());

        router.layer(self.config.cors_layer()).layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if req.uri().path().starts_with("/api/health") {
                        Span::none()
                    } else {
                        let mut make_span =
                            tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                        use tower_http::trace::MakeSpan;
                        make_span.make_span(req)
                    }
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                        if span.is_disabled() {
                            return;
                        }
                        let on_response =
                            tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO);
                        use tower_http::trace::OnResponse;
                        on_response.on_response(res, latency, span);
                    },
                ),
        )
    }

    /// Start the server. Returns once the cancellation token fires and in-flight
    /// requests have drained.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
