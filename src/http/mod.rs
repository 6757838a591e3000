//! HTTP shell — an axum router exposing the routed completion endpoint, two
//! unauthenticated internal endpoints, and the admin model-catalogue CRUD
//! surface. Thin: every handler delegates immediately to the auth gate and
//! the router.

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router as AxumRouter;

use crate::auth::AuthGate;
use crate::metrics::MetricsExporter;
use crate::registry::store::ModelCatalogueStore;
use crate::registry::ModelRegistry;
use crate::router::Router as GatewayRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<GatewayRouter>,
    pub auth: Arc<AuthGate>,
    pub metrics: MetricsExporter,
    pub registry: Arc<ModelRegistry>,
    pub catalogue: Arc<ModelCatalogueStore>,
}

pub fn build_router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/internal/health", get(handlers::health))
        .route("/internal/metrics", get(handlers::metrics))
        .route("/admin/models", get(handlers::list_models).post(handlers::create_model))
        .route("/admin/models/:id", patch(handlers::update_model).delete(handlers::deactivate_model))
        .with_state(state)
}
