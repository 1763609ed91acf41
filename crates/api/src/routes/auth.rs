use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

/// POST /api/auth/login
pub async fn login() -> Json<Value> {
    Json(json!({
        "message": "Login attempt accepted",
        "timestamp": Utc::now()
    }))
}

/// POST /api/auth/reset-password
pub async fn reset_password() -> Json<Value> {
    Json(json!({
        "message": "Reset password attempt accepted",
        "timestamp": Utc::now()
    }))
}
