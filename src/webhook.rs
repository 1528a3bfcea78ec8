// webhook.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::commands::SlashCommand;
use crate::{spawn_command, spawn_event, AppState};

type HmacSha256 = Hmac<Sha256>;

/// Requests older (or newer) than this are treated as replays.
const MAX_CLOCK_SKEW_SECS: u64 = 60 * 5;

/// Checks Slack's `X-Slack-Signature` header.
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    secret: String,
}

impl WebhookHandler {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }

    pub fn verify_signature(&self, headers: &HeaderMap, body: &[u8], now: i64) -> bool {
        let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

        let (Some(timestamp), Some(signature)) = (
            header("X-Slack-Request-Timestamp"),
            header("X-Slack-Signature"),
        ) else {
            return false;
        };

        let Ok(sent_at) = timestamp.parse::<i64>() else {
            return false;
        };
        if now.abs_diff(sent_at) > MAX_CLOCK_SKEW_SECS {
            return false;
        }

        let Some(expected) = signature
            .strip_prefix("v0=")
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
        else {
            return false;
        };

        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);

        // Constant-time comparison
        mac.verify_slice(&expected).is_ok()
    }
}

#[derive(Clone)]
struct WebhookState {
    app: Arc<AppState>,
    handler: WebhookHandler,
}

pub fn router(app: Arc<AppState>) -> Result<Router> {
    let secret = app
        .config
        .slack_signing_secret
        .clone()
        .context("SLACK_SIGNING_SECRET not set")?;
    let state = WebhookState {
        app,
        handler: WebhookHandler::new(&secret),
    };

    Ok(Router::new()
        .route("/slack/events", post(handle_events))
        .route("/slack/commands", post(handle_commands))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http()))
}

/// Serves the Events API endpoints until Ctrl-C.
pub async fn serve(app: Arc<AppState>) -> Result<()> {
    let bind_address = app.config.bind_address.clone();
    let router = router(app)?;

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    info!("Server starting on {}", bind_address);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    Ok(())
}

fn authenticate(state: &WebhookState, headers: &HeaderMap, body: &[u8]) -> Result<(), StatusCode> {
    if !state
        .handler
        .verify_signature(headers, body, Utc::now().timestamp())
    {
        warn!("Invalid slack signature");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

fn is_retry(headers: &HeaderMap) -> bool {
    headers.contains_key("X-Slack-Retry-Num")
}

async fn handle_events(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, StatusCode> {
    authenticate(&state, &headers, &body)?;

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    if payload["type"] == "url_verification" {
        let challenge = payload["challenge"].as_str().unwrap_or_default().to_string();
        return Ok(Json(serde_json::json!({ "challenge": challenge })).into_response());
    }

    if is_retry(&headers) {
        info!("Skipping redelivered event {}", payload["event_id"]);
        return Ok(StatusCode::OK.into_response());
    }

    spawn_event(state.app, payload);

    Ok(StatusCode::OK.into_response())
}

async fn handle_commands(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, StatusCode> {
    authenticate(&state, &headers, &body)?;

    let mut command = SlashCommand::default();
    for (key, value) in form_urlencoded::parse(&body) {
        match key.as_ref() {
            "command" => command.command = value.into_owned(),
            "text" => command.text = value.into_owned(),
            "user_id" => command.user_id = value.into_owned(),
            "channel_id" => command.channel_id = value.into_owned(),
            _ => {}
        }
    }
    if command.command.is_empty() || command.channel_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    if is_retry(&headers) {
        return Ok(StatusCode::OK);
    }

    spawn_command(state.app, command);

    Ok(StatusCode::OK)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now()
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;
    use crate::config::ScoringMode;
    use crate::test_support::test_state;

    const SECRET: &str = "signing-secret";

    fn sign(timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).expect("hmac");
        mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn headers(timestamp: i64, signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-slack-request-timestamp",
            timestamp.to_string().parse().expect("header"),
        );
        headers.insert("x-slack-signature", signature.parse().expect("header"));
        headers
    }

    fn signed_request(uri: &str, content_type: &str, body: &str) -> Request<Body> {
        let now = Utc::now().timestamp();
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .header("X-Slack-Request-Timestamp", now.to_string())
            .header("X-Slack-Signature", sign(now, body))
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn accepts_valid_signature() {
        let handler = WebhookHandler::new(SECRET);
        let body = r#"{"type":"event_callback"}"#;
        let now = 1_700_000_000;

        assert!(handler.verify_signature(&headers(now, &sign(now, body)), body.as_bytes(), now));
    }

    #[test]
    fn rejects_tampered_body_and_wrong_secret() {
        let handler = WebhookHandler::new(SECRET);
        let now = 1_700_000_000;
        let signature = sign(now, "original");

        assert!(!handler.verify_signature(&headers(now, &signature), b"tampered", now));
        assert!(!WebhookHandler::new("other").verify_signature(
            &headers(now, &signature),
            b"original",
            now
        ));
    }

    #[test]
    fn rejects_stale_and_malformed_headers() {
        let handler = WebhookHandler::new(SECRET);
        let sent = 1_700_000_000;
        let signature = sign(sent, "body");

        assert!(!handler.verify_signature(&headers(sent, &signature), b"body", sent + 301));
        assert!(handler.verify_signature(&headers(sent, &signature), b"body", sent + 299));
        assert!(!handler.verify_signature(&headers(sent, "sha256=abc"), b"body", sent));
        assert!(!handler.verify_signature(&headers(sent, "v0=zz"), b"body", sent));
        assert!(!handler.verify_signature(&HeaderMap::new(), b"body", sent));
    }

    #[test]
    fn extreme_timestamps_are_rejected() {
        let handler = WebhookHandler::new(SECRET);
        let now = 1_700_000_000;

        for sent in [i64::MIN, i64::MAX] {
            let signature = sign(sent, "body");
            assert!(!handler.verify_signature(&headers(sent, &signature), b"body", now));
        }
        let signature = sign(i64::MAX, "body");
        assert!(!handler.verify_signature(&headers(i64::MAX, &signature), b"body", i64::MIN));
    }

    #[tokio::test]
    async fn url_verification_echoes_challenge() {
        let server = MockServer::start_async().await;
        let temp = tempdir().expect("tempdir");
        let state = Arc::new(test_state(
            &server.base_url(),
            temp.path(),
            ScoringMode::SelfScore,
        ));
        let app = router(state).expect("router");

        let body = r#"{"type":"url_verification","challenge":"abc123"}"#;
        let response = app
            .oneshot(signed_request("/slack/events", "application/json", body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["challenge"], "abc123");
    }

    #[tokio::test]
    async fn unsigned_requests_are_rejected() {
        let server = MockServer::start_async().await;
        let temp = tempdir().expect("tempdir");
        let state = Arc::new(test_state(
            &server.base_url(),
            temp.path(),
            ScoringMode::SelfScore,
        ));
        let app = router(state).expect("router");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/slack/events")
                    .body(Body::from(r#"{"type":"url_verification","challenge":"x"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn slash_command_is_acknowledged_then_answered() {
        let server = MockServer::start_async().await;
        let post = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat.postMessage")
                    .body_includes("\"channel\":\"C42\"");
                then.status(200).json_body(json!({"ok": true}));
            })
            .await;
        let temp = tempdir().expect("tempdir");
        let state = Arc::new(test_state(
            &server.base_url(),
            temp.path(),
            ScoringMode::SelfScore,
        ));
        let app = router(state).expect("router");

        let body = "command=%2Fleaderboard&text=&user_id=U1&channel_id=C42";
        let response = app
            .oneshot(signed_request(
                "/slack/commands",
                "application/x-www-form-urlencoded",
                body,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..50 {
            if post.calls_async().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(post.calls_async().await, 1);
    }

    #[tokio::test]
    async fn retried_event_is_not_scored_twice() {
        let server = MockServer::start_async().await;
        let temp = tempdir().expect("tempdir");
        let state = Arc::new(test_state(
            &server.base_url(),
            temp.path(),
            ScoringMode::SelfScore,
        ));
        let app = router(Arc::clone(&state)).expect("router");

        let body = json!({
            "type": "event_callback",
            "event_id": "Ev1",
            "event": {
                "type": "message",
                "channel": "CTARGET",
                "user": "U1",
                "files": [{"mimetype": "image/gif"}]
            }
        })
        .to_string();
        let mut request = signed_request("/slack/events", "application/json", &body);
        request
            .headers_mut()
            .insert("x-slack-retry-num", "1".parse().expect("header"));

        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(state
            .store
            .load(crate::Category::Snipes)
            .await
            .expect("load")
            .is_empty());
    }

    #[tokio::test]
    async fn signed_image_event_is_scored() {
        let server = MockServer::start_async().await;
        let react = server
            .mock_async(|when, then| {
                when.method(POST).path("/reactions.add");
                then.status(200).json_body(json!({"ok": true}));
            })
            .await;
        let temp = tempdir().expect("tempdir");
        let state = Arc::new(test_state(
            &server.base_url(),
            temp.path(),
            ScoringMode::SelfScore,
        ));
        let app = router(Arc::clone(&state)).expect("router");

        let body = json!({
            "type": "event_callback",
            "event_id": "Ev2",
            "event": {
                "type": "message",
                "channel": "CTARGET",
                "user": "U1",
                "ts": "1700000000.000200",
                "files": [{"mimetype": "image/gif"}]
            }
        })
        .to_string();
        let response = app
            .oneshot(signed_request("/slack/events", "application/json", &body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let mut scored = None;
        for _ in 0..50 {
            let snipes = state
                .store
                .load(crate::Category::Snipes)
                .await
                .expect("load");
            if let Some(count) = snipes.get("U1") {
                scored = Some(*count);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(scored, Some(1));

        for _ in 0..50 {
            if react.calls_async().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(react.calls_async().await, 1);
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let server = MockServer::start_async().await;
        let temp = tempdir().expect("tempdir");
        let state = Arc::new(test_state(
            &server.base_url(),
            temp.path(),
            ScoringMode::SelfScore,
        ));
        let app = router(state).expect("router");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
