//! Application startup and lifecycle management.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::{SettlementConfig, StorageBackend};
use crate::handlers::{self, accruals, settlements};
use crate::services::{
    AccrualService, InMemorySettlementStore, MongoSettlementStore, SettlementService,
    SettlementStore,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SettlementConfig,
    pub store: Arc<dyn SettlementStore>,
    pub settlements: SettlementService,
    pub accruals: AccrualService,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application, connecting the configured store.
    pub async fn build(config: SettlementConfig) -> Result<Self, AppError> {
        let store: Arc<dyn SettlementStore> = match config.storage {
            StorageBackend::MongoDb => {
                let mongo = MongoSettlementStore::connect(
                    config.mongodb.uri.expose_secret(),
                    &config.mongodb.database,
                )
                .await?;
                mongo.initialize_indexes().await?;
                Arc::new(mongo)
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory settlement store; data is not persisted");
                Arc::new(InMemorySettlementStore::new())
            }
        };

        Self::build_with_store(config, store).await
    }

    /// Build the application around an existing store.
    pub async fn build_with_store(
        config: SettlementConfig,
        store: Arc<dyn SettlementStore>,
    ) -> Result<Self, AppError> {
        let state = AppState {
            settlements: SettlementService::new(store.clone()),
            accruals: AccrualService::new(store.clone()),
            store,
            config: config.clone(),
        };

        // Port 0 binds a random port for tests.
        let address = config.common.bind_address();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", address, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Settlement service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn store(&self) -> Arc<dyn SettlementStore> {
        self.state.store.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = router(self.state);
        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/settlements",
            post(settlements::create_settlement).get(settlements::list_settlements),
        )
        .route("/settlements/:id", get(settlements::get_settlement))
        .route("/settlements/:id/items", post(settlements::add_items))
        .route(
            "/settlements/:id/items/remove",
            post(settlements::remove_items),
        )
        .route("/settlements/:id/approve", post(settlements::approve))
        .route("/settlements/:id/cancel", post(settlements::cancel))
        .route("/settlements/:id/mark-paid", post(settlements::mark_paid))
        .route("/accruals", get(accruals::list_accruals))
        .route("/accruals/:id", get(accruals::get_accrual))
        .route("/accruals/:id/adjust", post(accruals::adjust_accrual))
        .route("/accruals/:id/reverse", post(accruals::reverse_accrual));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(api)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    org_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}
