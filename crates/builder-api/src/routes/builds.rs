//! Build endpoints.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use builder_core::{BuildRequest, BuildSnapshot, BuildToken};
use builder_scheduler::Build;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/builds", post(create_build))
        .route("/builds/{token}", get(get_build).delete(cancel_build))
        .route("/builds/{token}/wait", get(wait_build))
        .route("/builds/{token}/output", get(get_build_output))
        .route("/build/wait", get(wait_single_build))
        .route("/build/output", get(get_single_build_output))
}

fn single(state: &AppState) -> Result<Arc<Build>, ApiError> {
    state
        .single_build
        .clone()
        .ok_or_else(|| ApiError::NotFound("not found: no single build".to_string()))
}

/// Resolve a path token. Malformed tokens are reported like unknown ones.
fn lookup(state: &AppState, token: &str) -> Result<Arc<Build>, ApiError> {
    let not_found = || ApiError::NotFound(format!("not found: build {}", token));
    let token: BuildToken = token.parse().map_err(|_| not_found())?;
    state.registry.get(&token).ok_or_else(not_found)
}

async fn create_build(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    if state.single_build.is_some() {
        return Err(ApiError::NotFound(
            "not found: submissions are disabled in single-build mode".to_string(),
        ));
    }
    let request = BuildRequest::from_json(&body)?;
    let (build, token) = state.registry.create_build(request).await?;
    info!(%token, git_url = %build.descriptor().git_url, "Accepted build");

    let location = format!("/builds/{}", token);
    Ok((
        StatusCode::OK,
        [(header::LOCATION, location)],
        Json(build.snapshot()),
    )
        .into_response())
}

async fn get_build(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<BuildSnapshot>, ApiError> {
    let build = lookup(&state, &token)?;
    Ok(Json(build.snapshot()))
}

async fn wait_build(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<BuildSnapshot>, ApiError> {
    let build = lookup(&state, &token)?;
    Ok(Json(build.done().await))
}

async fn get_build_output(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let build = lookup(&state, &token)?;
    stream_log(&build).await
}

async fn wait_single_build(State(state): State<AppState>) -> Result<Json<BuildSnapshot>, ApiError> {
    let build = single(&state)?;
    Ok(Json(build.done().await))
}

async fn get_single_build_output(State(state): State<AppState>) -> Result<Response, ApiError> {
    let build = single(&state)?;
    stream_log(&build).await
}

async fn stream_log(build: &Build) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(build.log_path())
        .await
        .map_err(|e| ApiError::Internal(format!("opening build log: {}", e)))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let build = lookup(&state, &token)?;
    info!(token = %build.token(), "Cancelling build");
    build.cancel();
    Ok((StatusCode::ACCEPTED, Json(build.snapshot())).into_response())
}
