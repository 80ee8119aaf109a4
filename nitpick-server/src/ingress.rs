//! Webhook ingress endpoint.
//!
//! The provider enforces a short acknowledgement deadline, so the handler
//! does the minimum on the request path: header validation, signature
//! verification, and a 202 acknowledgement. The durable enqueue runs in a
//! detached task after the response is sent. If that enqueue fails the event
//! is not retried by us (the provider's redelivery-on-timeout behavior is
//! the safety net) and the failure is observable only as a log line (and,
//! for callers that keep it, the completion channel). This is a deliberate
//! at-least-once, best-effort handoff.
//!
//! Forged or unauthenticated payloads are rejected before anything touches
//! the queue or the ledger.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use nitpick_core::event::DeliveryJob;
use nitpick_core::signature::verify_signature;

use crate::queue::{EnqueueOutcome, JobQueue, NewJob, QueueError};
use crate::worker::WEBHOOK_JOB_KIND;
use crate::AppState;

pub const EVENT_TYPE_HEADER: &str = "x-github-event";
pub const DELIVERY_ID_HEADER: &str = "x-github-delivery";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn error_response(status: StatusCode, code: &'static str, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: code,
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/github", post(receive_webhook))
        .route("/webhooks/health", get(health))
}

async fn receive_webhook(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let event_type = header_str(&parts.headers, EVENT_TYPE_HEADER);
    let delivery_id = header_str(&parts.headers, DELIVERY_ID_HEADER);
    let signature = header_str(&parts.headers, SIGNATURE_HEADER);

    let (Some(event_type), Some(delivery_id), Some(signature)) =
        (event_type, delivery_id, signature)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_HEADERS",
            "x-github-event, x-github-delivery and x-hub-signature-256 are required",
        );
    };

    let Some(secret) = state.webhook_secret.as_deref() else {
        // Operational misconfiguration; must be loud, not silent.
        error!("webhook secret is not configured; rejecting delivery {delivery_id}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "MISSING_WEBHOOK_SECRET",
            "webhook secret is not configured",
        );
    };

    let event_type = event_type.to_string();
    let delivery_id = delivery_id.to_string();
    let signature = signature.to_string();

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to read webhook body for delivery {delivery_id}: {e}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "failed to read request body",
            );
        }
    };

    if !verify_signature(&bytes, &signature, secret.as_bytes()) {
        warn!("invalid webhook signature for delivery {delivery_id}");
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_SIGNATURE",
            "webhook signature verification failed",
        );
    }

    info!("accepted delivery {delivery_id} ({event_type})");

    let job = DeliveryJob {
        delivery_id: delivery_id.clone(),
        event_type: event_type.clone(),
        payload: String::from_utf8_lossy(&bytes).into_owned(),
    };

    // Detached: the response must not wait for the durable enqueue. The
    // receiver is dropped here; anyone composing this differently can keep
    // it to observe the outcome.
    let _completion = schedule_enqueue(state.queue.clone(), job);

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "delivery_id": delivery_id,
            "event": event_type,
        })),
    )
        .into_response()
}

/// Spawns the out-of-band enqueue for an acknowledged delivery.
///
/// Returns a completion channel for observers; the HTTP handler drops it.
/// The delivery id doubles as the job's idempotency key, so a redelivered
/// request that reaches this point twice collapses inside the queue.
pub fn schedule_enqueue(
    queue: Arc<dyn JobQueue>,
    job: DeliveryJob,
) -> oneshot::Receiver<Result<EnqueueOutcome, QueueError>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let payload = match serde_json::to_value(&job) {
            Ok(value) => value,
            Err(e) => {
                error!("failed to serialize delivery {}: {e}", job.delivery_id);
                let _ = tx.send(Err(QueueError::storage("enqueue", e.to_string())));
                return;
            }
        };

        let result = queue
            .enqueue(NewJob {
                idempotency_key: &job.delivery_id,
                kind: WEBHOOK_JOB_KIND,
                payload,
            })
            .await;

        match &result {
            Ok(EnqueueOutcome::Enqueued) => {
                debug!("delivery {} enqueued", job.delivery_id);
            }
            Ok(EnqueueOutcome::Duplicate) => {
                info!(
                    "delivery {} was already enqueued; duplicate collapsed",
                    job.delivery_id
                );
            }
            Err(e) => {
                // Accepted risk: the ack is already sent. The provider
                // redelivers on our silence; nothing to surface to a caller.
                error!(
                    "failed to enqueue delivery {} after ack: {e}; \
                     relying on provider redelivery",
                    job.delivery_id
                );
            }
        }

        let _ = tx.send(result);
    });

    rx
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => {
            // A missing webhook secret means every delivery is being
            // rejected; surface that to operators here.
            let healthy = state.webhook_secret.is_some();
            let status = if healthy { "healthy" } else { "unhealthy" };
            Json(json!({ "status": status, "queue": stats })).into_response()
        }
        Err(e) => {
            error!("health check failed to read queue stats: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy" })),
            )
                .into_response()
        }
    }
}
