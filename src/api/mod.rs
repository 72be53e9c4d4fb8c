//! HTTP surface consumed by the dashboard.

pub mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::checker::CheckRunner;
use crate::models::Config;
use crate::notifier::Notifier;
use crate::storage::TrackerStore;

pub struct AppState {
    pub store: Arc<TrackerStore>,
    pub runner: Arc<CheckRunner>,
    pub notifier: Arc<Notifier>,
    pub config: Config,
    pub started: std::time::Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/items", post(routes::create_item).get(routes::list_items))
        .route("/items/:id", get(routes::get_item).delete(routes::delete_item))
        .route("/items/:id/check", post(routes::check_item))
        .route("/discord/test", post(routes::discord_test))
        .with_state(state)
}
