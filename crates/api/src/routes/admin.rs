use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

/// POST /api/admin/moderate
pub async fn moderate() -> Json<Value> {
    Json(json!({
        "message": "Moderation action accepted",
        "timestamp": Utc::now()
    }))
}
