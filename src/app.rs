//! Application wiring: storage, limiter, monitoring and background tasks,
//! plus the demo routes the middleware is mounted on.

use axum::{
    extract::Path,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::config::{RateLimitOptions, StorageBackend};
use crate::error::Result;
use crate::http::{admin, AdminState, ApiResponse, RateLimitLayer, ADMIN_PREFIX};
use crate::monitoring::{MonitoringService, Trimmer};
use crate::ratelimit::storage::Sweeper;
use crate::ratelimit::{
    Clock, InMemoryStorage, RateLimitService, RateLimitStorage, RedisStorage, SystemClock,
};

/// A running rate limiter with its background tasks.
pub struct App {
    options: RateLimitOptions,
    service: Arc<RateLimitService>,
    monitoring: Arc<MonitoringService>,
    clock: Arc<dyn Clock>,
    sweeper: Sweeper,
    trimmer: Trimmer,
}

impl App {
    /// Build from options using the system clock.
    pub async fn build(options: RateLimitOptions) -> Result<Self> {
        Self::build_with_clock(options, Arc::new(SystemClock)).await
    }

    pub async fn build_with_clock(options: RateLimitOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        let retention = options.effective_retention();

        let storage: Arc<dyn RateLimitStorage> = match options.storage {
            StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
            StorageBackend::Redis => Arc::new(
                RedisStorage::connect(&options.redis_url, &options.redis_key_prefix, retention)
                    .await?,
            ),
        };

        let service = Arc::new(RateLimitService::from_options(
            &options,
            storage.clone(),
            clock.clone(),
        )?);
        let monitoring = Arc::new(MonitoringService::new(
            options.max_events_per_client,
            clock.clone(),
        ));

        let sweeper = Sweeper::spawn(storage, clock.clone(), options.sweep_interval, retention);
        let trimmer = monitoring.spawn_trimmer(options.stats_trim_interval, options.stats_retention);

        info!(
            storage = ?options.storage,
            retention = ?retention,
            whitelist = options.ip_whitelist.len(),
            "Rate limiting ready"
        );

        Ok(Self {
            options,
            service,
            monitoring,
            clock,
            sweeper,
            trimmer,
        })
    }

    pub fn service(&self) -> &Arc<RateLimitService> {
        &self.service
    }

    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }

    /// Middleware layer enforcing the configured limits.
    pub fn rate_limit_layer(&self) -> RateLimitLayer {
        RateLimitLayer::from_options(self.service.clone(), &self.options)
            .with_monitoring(self.monitoring.clone())
            .with_clock(self.clock.clone())
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            service: self.service.clone(),
            monitoring: self.monitoring.clone(),
            retention: self.options.effective_retention(),
        }
    }

    /// Demo API and admin API, behind the rate limit layer.
    pub fn router(&self) -> Router {
        demo_routes()
            .nest(ADMIN_PREFIX, admin::router(self.admin_state()))
            .layer(self.rate_limit_layer())
    }

    /// Stop the background tasks.
    pub async fn shutdown(self) {
        self.sweeper.shutdown().await;
        self.trimmer.shutdown().await;
        info!("Rate limiting background tasks stopped");
    }
}

/// Stand-in endpoints for the project-management API.
pub fn demo_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/projects", get(list_projects).post(create_project))
        .route("/api/v1/projects/{id}", delete(delete_project))
        .route("/api/v1/images", get(list_images).post(upload_image))
        .route("/api/v1/auth/login", post(login))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn list_projects() -> ApiResponse<Vec<Value>> {
    ApiResponse::success(Vec::new(), "Projects retrieved successfully")
}

async fn create_project(Json(project): Json<Value>) -> (StatusCode, ApiResponse<Value>) {
    (
        StatusCode::CREATED,
        ApiResponse::success(project, "Project created successfully"),
    )
}

async fn delete_project(Path(id): Path<String>) -> ApiResponse<()> {
    ApiResponse::<()>::message(format!("Project {} deleted successfully", id))
}

async fn list_images() -> ApiResponse<Vec<Value>> {
    ApiResponse::success(Vec::new(), "Images retrieved successfully")
}

async fn upload_image() -> (StatusCode, ApiResponse<()>) {
    (StatusCode::CREATED, ApiResponse::<()>::message("Image uploaded successfully"))
}

async fn login() -> ApiResponse<Value> {
    ApiResponse::success(json!({ "token": "demo" }), "Login successful")
}
