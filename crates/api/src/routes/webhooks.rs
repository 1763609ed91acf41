use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

/// POST /api/webhooks/payment
///
/// Partitioned by the `x-webhook-source` header, so each payment provider
/// gets its own budget even when they share an egress address.
pub async fn payment() -> Json<Value> {
    Json(json!({
        "message": "Webhook received",
        "timestamp": Utc::now()
    }))
}
