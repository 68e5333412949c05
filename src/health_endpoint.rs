use axum::{extract::Request, routing::get, Json, Router};
use serde::Serialize;

/// Prefix of the system routes mounted on every application.
pub const SYS_PREFIX: &str = "/api/v1/sys";

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
}

/// `GET /health`
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// [`router`] mounted under [`SYS_PREFIX`].
pub fn sys_router() -> Router {
    Router::new().nest(SYS_PREFIX, router())
}

async fn health(req: Request) -> Json<HealthStatus> {
    tracing::debug!("Received http request: {} {}", req.method(), req.uri());
    tracing::debug!("Responding 200 to health check.");
    Json(HealthStatus { status: "OK" })
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };

    use super::*;
    use crate::web::{WebApp, WebAppMetadata};

    #[tokio::test]
    async fn reports_ok() {
        let app = WebApp::new(WebAppMetadata::default());
        app.include_router(sys_router());

        let request = Request::get("/api/v1/sys/health").body(Body::empty()).unwrap();
        let response = app.handle(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"status":"OK"}"#);

        let request = Request::post("/api/v1/sys/health").body(Body::empty()).unwrap();
        assert_eq!(
            app.handle(request).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
