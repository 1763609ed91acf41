use axum::extract::Path;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

/// GET /api/products
pub async fn list_products() -> Json<Value> {
    Json(json!({
        "message": "Product list",
        "timestamp": Utc::now()
    }))
}

/// GET /api/products/{id}
pub async fn get_product(Path(id): Path<i64>) -> Json<Value> {
    Json(json!({
        "productId": id,
        "timestamp": Utc::now()
    }))
}
