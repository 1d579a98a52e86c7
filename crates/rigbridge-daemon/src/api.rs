//! REST API handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// One entry of the connection map
#[derive(Debug, Serialize)]
pub struct ConnectionEntry {
    pub node: String,
    pub template: String,
}

/// Session, rig and mapping status
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status().await)
}

/// Current mapping buffer as XML
pub async fn get_mapping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let retargeter = state.retargeter.lock().await;
    match retargeter.serialize() {
        Ok(buffer) => (
            [(header::CONTENT_TYPE, "application/xml")],
            buffer.into_bytes(),
        )
            .into_response(),
        Err(e) => {
            debug!(error = %e, "No mapping to serve");
            (StatusCode::NOT_FOUND, Json(ApiError::new("No mapping applied"))).into_response()
        }
    }
}

/// Connection map as node name / template bone pairs
pub async fn list_connections(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let retargeter = state.retargeter.lock().await;
    let skeleton = retargeter.skeleton();
    let entries: Vec<ConnectionEntry> = retargeter
        .connections()
        .iter()
        .map(|(node, template)| ConnectionEntry {
            node: skeleton
                .get(node)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| node.to_string()),
            template: template.to_string(),
        })
        .collect();
    Json(entries)
}
