//! Axum surface: the feed webhook receiver, health, and event status lookup.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;
use voyage_ftp::ConnectionPool;
use voyage_sync::{SyncRuntime, WebhookDispatcher, WebhookPayload};

pub const CRATE_NAME: &str = "voyage-web";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: WebhookDispatcher,
    pub pool: ConnectionPool,
}

impl AppState {
    pub fn new(dispatcher: WebhookDispatcher, pool: ConnectionPool) -> Self {
        Self { dispatcher, pool }
    }

    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self::new(runtime.dispatcher.clone(), runtime.pool.clone())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/traveltek", post(webhook_handler))
        .route("/webhooks/events/{id}", get(event_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves; in-flight requests are drained first.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook receiver listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "malformed webhook");
            return error_response(rejection.status(), rejection.body_text());
        }
    };

    match state.dispatcher.dispatch(payload).await {
        Ok(ack) => (StatusCode::ACCEPTED, Json(ack)).into_response(),
        Err(err) if err.is_rejection() => {
            warn!(error = %err, "rejected webhook");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        Err(err) => {
            warn!(error = %err, "webhook could not be recorded");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn event_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.dispatcher.store().webhook_event(id).await {
        Ok(Some(event)) => Json(event).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no webhook event {id}")),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.pool.stats();
    Json(json!({
        "status": if state.pool.is_closed() { "stopping" } else { "ok" },
        "pool": {
            "size": stats.size,
            "inUse": stats.in_use,
            "idle": stats.idle,
            "opened": stats.opened,
            "discarded": stats.discarded,
            "breaker": format!("{:?}", stats.breaker).to_ascii_lowercase(),
        },
        "runningLines": state.dispatcher.running_lines(),
    }))
    .into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use voyage_core::feed_path;
    use voyage_ftp::MemoryFeed;
    use voyage_sync::{LineMappings, MemoryCatalogStore, SyncConfig};

    struct Harness {
        runtime: SyncRuntime,
        store: Arc<MemoryCatalogStore>,
        _checkpoints: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let feed = MemoryFeed::new();
        feed.insert(
            feed_path(2025, 5, 1022, 231, 345),
            json!({
                "codetocruiseid": 2143102,
                "cruiseid": 345,
                "lineid": 1022,
                "shipid": 231,
                "saildate": "2025-05-10",
                "nights": 7,
                "cheapestinside": "522.00"
            })
            .to_string(),
        );
        let checkpoints = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::from_env();
        config.checkpoint_dir = checkpoints.path().to_path_buf();
        config.slack_webhook_url = None;
        let store = Arc::new(MemoryCatalogStore::new());
        let runtime = SyncRuntime::build(
            config,
            Arc::new(feed),
            store.clone(),
            LineMappings::new(1, [(1022, 22)]),
        )
        .unwrap();
        Harness {
            runtime,
            store,
            _checkpoints: checkpoints,
        }
    }

    fn post_webhook(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/traveltek")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn accepted_webhook_is_tracked_to_completion() {
        let h = harness();
        let app = app(AppState::from_runtime(&h.runtime));

        let resp = app
            .clone()
            .oneshot(post_webhook(
                r#"{"event":"cruises_live_pricing_updated","lineId":1022,"currency":"USD","timestamp":1715000000,"paths":["2025/05/1022/231/345.json"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let ack = json_body(resp).await;
        assert_eq!(ack["processingMode"], "realtime");
        let event_id = ack["eventId"].as_str().unwrap().to_string();

        h.runtime.dispatcher.wait_idle().await;
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/webhooks/events/{event_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let event = json_body(resp).await;
        assert_eq!(event["status"], "completed");
        assert_eq!(event["line_id"], 22);
        assert_eq!(event["external_line_id"], 1022);
        assert_eq!(h.store.cruise(2143102).unwrap().line_id, 22);
    }

    #[tokio::test]
    async fn malformed_webhooks_are_rejected() {
        let h = harness();
        let app = app(AppState::from_runtime(&h.runtime));

        let syntax = app.clone().oneshot(post_webhook("{not json")).await.unwrap();
        assert_eq!(syntax.status(), StatusCode::BAD_REQUEST);

        let missing_line = app
            .clone()
            .oneshot(post_webhook(r#"{"event":"cruiseline_pricing_updated"}"#))
            .await
            .unwrap();
        assert_eq!(missing_line.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let bad_line = app
            .oneshot(post_webhook(r#"{"event":"cruiseline_pricing_updated","lineid":0}"#))
            .await
            .unwrap();
        assert_eq!(bad_line.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json_body(bad_line).await["error"].as_str().unwrap().contains("positive"));
        assert!(h.runtime.dispatcher.running_lines().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let h = harness();
        let resp = app(AppState::from_runtime(&h.runtime))
            .oneshot(
                Request::builder()
                    .uri(format!("/webhooks/events/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_pool_and_running_lines() {
        let h = harness();
        let resp = app(AppState::from_runtime(&h.runtime))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let health = json_body(resp).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["pool"]["breaker"], "closed");
        assert_eq!(health["runningLines"], json!([]));
    }
}
