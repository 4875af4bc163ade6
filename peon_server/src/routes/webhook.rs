//! GitHub webhook handler — verifies deliveries and dispatches push events.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};

use super::WebhookState;
use crate::services::dispatcher::PushEvent;
use crate::services::github_service;

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(
    state: &WebhookState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&state.secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    match event_type {
        "push" => handle_push(state, &body).await,
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            Ok(StatusCode::OK)
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            Ok(StatusCode::OK)
        }
    }
}

async fn handle_push(state: &WebhookState, body: &[u8]) -> Result<StatusCode, StatusCode> {
    let event: PushEvent = serde_json::from_slice(body).map_err(|e| {
        tracing::warn!("Malformed push payload: {e}");
        StatusCode::BAD_REQUEST
    })?;
    if event.url().is_none() {
        tracing::warn!("Push payload without repository URL");
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.dispatcher.dispatch(event).await {
        Ok(Some(build_id)) => {
            tracing::info!(build_id, "Build queued from push webhook");
            Ok(StatusCode::ACCEPTED)
        }
        Ok(None) => Ok(StatusCode::OK),
        Err(e) => {
            tracing::error!("Failed to queue build: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::WatcherConfig;
    use crate::models::{BuildStatus, RefMode};
    use crate::routes::webhook_router;
    use crate::services::dispatcher::{BuildRunner, Dispatcher};
    use crate::services::pipeline::BuildJob;
    use crate::services::status_service::tests::test_service;

    const SECRET: &str = "It's a Secret to Everybody";

    #[derive(Default)]
    struct QueueOnly {
        jobs: Mutex<Vec<BuildJob>>,
    }

    #[async_trait]
    impl BuildRunner for QueueOnly {
        async fn run_build(&self, job: BuildJob) -> BuildStatus {
            self.jobs.lock().unwrap().push(job);
            BuildStatus::Success
        }

        async fn clean_ref(&self, _: &str, _: RefMode, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn router(secret: &str) -> axum::Router {
        let (status, _, _) = test_service();
        let dispatcher = Dispatcher::new(
            &WatcherConfig::default(),
            true,
            status,
            Arc::new(QueueOnly::default()),
        );
        webhook_router(WebhookState {
            dispatcher: Arc::new(dispatcher),
            secret: secret.to_string(),
        })
    }

    fn delivery(event: &str, body: &str, signature: Option<String>) -> Request<Body> {
        let mut request = Request::post("/webhooks")
            .header("content-type", "application/json")
            .header("x-github-event", event);
        if let Some(signature) = signature {
            request = request.header("x-hub-signature-256", signature);
        }
        request.body(Body::from(body.to_string())).unwrap()
    }

    const PUSH: &str = r#"{
        "ref": "refs/heads/main",
        "head_commit": { "id": "0123456789abcdef" },
        "repository": { "ssh_url": "git@github.com:org/app.git" }
    }"#;

    #[tokio::test]
    async fn accepts_signed_push() {
        let signature = github_service::sign_payload(SECRET, PUSH.as_bytes());

        let response = router(SECRET)
            .oneshot(delivery("push", PUSH, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let signature = github_service::sign_payload("wrong", PUSH.as_bytes());

        let response = router(SECRET)
            .oneshot(delivery("push", PUSH, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_malformed_push() {
        let response = router("")
            .oneshot(delivery("push", r#"{"ref": 3}"#, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn acknowledges_other_events() {
        for event in ["ping", "pull_request"] {
            let response = router("")
                .oneshot(delivery(event, "{}", None))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn ignores_unhandled_refs() {
        let body = PUSH.replace("refs/heads/main", "refs/pull/1/merge");

        let response = router("").oneshot(delivery("push", &body, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
