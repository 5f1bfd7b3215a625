//! Status HTTP Server for RadioGrab
//!
//! Exposes the job status snapshot and a liveness probe over HTTP.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddr(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

async fn get_health() -> &'static str {
    "ok"
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .with_state(status)
}

/// Serve the status router on `bind_addr` until `shutdown`
pub async fn run_status_server(
    status: SharedStatus,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|_| ServerError::InvalidAddr(bind_addr.to_string()))?;
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RecordingJob;
    use crate::status::new_shared_status;
    use crate::store::SourceType;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let status = new_shared_status();
        {
            let mut snapshot = status.write().await;
            let mut job = RecordingJob::new(
                4,
                "http://radio.example/live",
                chrono::Utc::now(),
                Duration::from_secs(1800),
                SourceType::Scheduled,
            );
            job.start();
            snapshot.upsert_job(&job);
            snapshot.completed = 12;
        }

        let response = create_status_router(status)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: StatusSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to StatusSnapshot");
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.completed, 12);
        assert_eq!(snapshot.recent_jobs[0].show_id, 4);
    }

    #[tokio::test]
    async fn test_health() {
        let response = create_status_router(new_shared_status())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = create_status_router(new_shared_status())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_bind_addr() {
        let result = run_status_server(new_shared_status(), "not-an-addr", CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::InvalidAddr(_))));
    }
}
