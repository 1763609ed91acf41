use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

/// POST /api/notifications/send
pub async fn send() -> Json<Value> {
    Json(json!({
        "message": "Notification queued",
        "timestamp": Utc::now()
    }))
}
