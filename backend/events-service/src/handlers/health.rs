use actix_web::HttpResponse;

/// Liveness only; does not touch any store
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "healthy"}))
}
