//! Health check endpoint.

use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Tripsync Server"
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{offline_app, send};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};

    #[tokio::test]
    async fn test_health_does_not_touch_database() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(offline_app(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_root() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(offline_app(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Tripsync Server");
    }
}
