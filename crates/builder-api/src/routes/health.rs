//! Health and version endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let status = if state.registry.is_shut_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(json!({ "status": status, "builds": state.registry.len() }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
