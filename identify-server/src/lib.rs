//! identify-server library
//!
//! Contact identity reconciliation: links email / phone number observations
//! into contact groups under one primary record.

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod cli;
pub mod error;
pub mod reconcile;
pub mod store;

use reconcile::Reconciler;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    Router::new()
        .route("/identify", post(api::identify))
        .route("/contacts/:id", get(api::get_contact))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
