use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": state.config.service_name,
    }))
}
