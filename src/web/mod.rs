//! Admin HTTP surface: read-only statistics plus the reload trigger.

pub mod error;

pub use error::{ErrorResponse, Result, WebError};

use crate::config::ProxyConfig;
use crate::coordinator::{Coordinator, CoordinatorStatus, ReloadOutcome, RouteSource};
use crate::scheduler::SchedulerStats;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{Level, event};

/// Shared handler state.
#[derive(Clone)]
pub struct AdminState {
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<ProxyConfig>,
    /// Where the reload endpoint fetches the candidate route from.
    pub source: Arc<dyn RouteSource>,
}

impl AdminState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        config: ProxyConfig,
        source: Arc<dyn RouteSource>,
    ) -> Self {
        Self {
            coordinator,
            config: Arc::new(config),
            source,
        }
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/stats/score/", get(score))
        .route("/stats/route/", get(route))
        .route("/stats/config/", get(config))
        .route("/stats/status/", get(status))
        .route("/stats/route/reload", post(reload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn score(State(state): State<AdminState>) -> Json<SchedulerStats> {
    Json(state.coordinator.current_stats())
}

async fn route(State(state): State<AdminState>) -> Result<Response> {
    let yaml = state.coordinator.current_route().to_yaml()?;
    Ok(([(header::CONTENT_TYPE, "text/yaml; charset=utf-8")], yaml).into_response())
}

async fn config(State(state): State<AdminState>) -> Json<ProxyConfig> {
    Json(state.config.as_ref().clone())
}

async fn status(State(state): State<AdminState>) -> Json<CoordinatorStatus> {
    Json(state.coordinator.status())
}

async fn reload(State(state): State<AdminState>) -> Response {
    if !state.config.allow_reload {
        return WebError::Forbidden("reload disabled".to_string()).into_text_response();
    }

    match state.coordinator.reload_from(state.source.as_ref()).await {
        Ok(ReloadOutcome::Applied { .. }) => (StatusCode::OK, "success").into_response(),
        Ok(ReloadOutcome::AlreadyCurrent { version }) => {
            (StatusCode::OK, format!("same version {}", version)).into_response()
        }
        Err(err) => {
            event!(Level::WARN, error = %err, "admin reload failed");
            WebError::from(err).into_text_response()
        }
    }
}
