//! Webhook routes the broker calls back into
//!
//! 2xx acknowledges a delivery, 4xx marks it permanently failed (the broker
//! will not retry), 5xx asks the broker to redeliver. Decode failures are
//! permanent; everything else is retryable.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use uptask::codec::{self, BrokerDelivery};
use uptask::store::{ExecutionError, TaskExecution, TaskStatus, TaskStore};
use uptask::{ServiceError, TaskEnvelope, TaskService};

const MESSAGE_ID_HEADER: &str = "Upstash-Message-Id";
const RETRIED_HEADER: &str = "Upstash-Retried";
const RETRIES_HEADER: &str = "Upstash-Retries";
const SCHEDULE_ID_HEADER: &str = "Upstash-Schedule-Id";

/// Sink for dead-letter envelopes rehydrated from the broker's DLQ
/// callback.
#[async_trait]
pub trait DlqStore: Send + Sync + 'static {
    async fn store_dlq_event(&self, envelope: TaskEnvelope) -> anyhow::Result<()>;
}

/// [`DlqStore`] that archives dead-lettered envelopes into the execution
/// store: the record is finalized as FAILED with a dead-letter entry in its
/// error log.
pub struct StoreDlqArchive {
    store: Arc<dyn TaskStore>,
}

impl StoreDlqArchive {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DlqStore for StoreDlqArchive {
    async fn store_dlq_event(&self, envelope: TaskEnvelope) -> anyhow::Result<()> {
        let id = Uuid::parse_str(&envelope.id)?;

        if !self.store.exists(id).await? {
            let mut record = TaskExecution::new(
                id,
                envelope.ty.clone(),
                envelope.data.clone().unwrap_or(serde_json::Value::Null),
            );
            record.max_retries = envelope.max_retries().unwrap_or(0);
            record.retried = envelope.retried();
            record.qstash_message_id = envelope.qstash_message_id().map(str::to_string);
            record.schedule_id = envelope.schedule_id().map(str::to_string);
            record.queue = envelope.queue().to_string();
            self.store.create(record).await?;
        }

        self.store
            .add_error(
                id,
                ExecutionError::new(format!(
                    "dead-lettered after {} of {} retries",
                    envelope.retried(),
                    envelope.max_retries().unwrap_or(0),
                )),
            )
            .await?;
        self.store.update_status(id, TaskStatus::Failed).await?;
        Ok(())
    }
}

/// Routes for task and event deliveries.
pub fn task_routes(service: Arc<TaskService>) -> Router {
    Router::new()
        .route("/tasks/{kind}", post(handle_delivery))
        .route("/events/{handler}/{kind}", post(handle_delivery))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

/// Routes for the broker's dead-letter callback.
pub fn dlq_routes(store: Arc<dyn DlqStore>) -> Router {
    Router::new()
        .route("/dlq/{*rest}", post(handle_dlq))
        .with_state(store)
        .layer(TraceLayer::new_for_http())
}

/// Read API over the execution store.
pub fn api_routes(store: Arc<dyn TaskStore>) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks))
        .with_state(store)
        .layer(TraceLayer::new_for_http())
}

/// The routing key lives in the envelope type, so every delivery path goes
/// through the same decode-and-dispatch; the path only matters to the
/// broker.
async fn handle_delivery(
    State(service): State<Arc<TaskService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = broker_delivery_from_headers(&headers);
    let envelope = match codec::decode(&body, &delivery) {
        Ok(envelope) => envelope,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    match service.handle_event(envelope).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err @ ServiceError::Codec(_)) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => {
            error!(error = %err, "task dispatch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn handle_dlq(State(store): State<Arc<dyn DlqStore>>, body: Bytes) -> Response {
    let envelope = match codec::decode_dlq(&body) {
        Ok(envelope) => envelope,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    match store.store_dlq_event(envelope).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            error!(error = %err, "failed to store dead-letter event");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ListTasksResponse {
    tasks: Vec<TaskExecution>,
}

async fn list_tasks(
    State(store): State<Arc<dyn TaskStore>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ListTasksResponse>, StatusCode> {
    let tasks = store
        .most_recent(query.limit.unwrap_or(100))
        .await
        .map_err(|err| {
            error!(error = %err, "failed to list task executions");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(ListTasksResponse { tasks }))
}

fn broker_delivery_from_headers(headers: &HeaderMap) -> BrokerDelivery {
    BrokerDelivery {
        message_id: header_string(headers, MESSAGE_ID_HEADER),
        retried: header_string(headers, RETRIED_HEADER)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        max_retries: header_string(headers, RETRIES_HEADER).and_then(|value| value.parse().ok()),
        schedule_id: header_string(headers, SCHEDULE_ID_HEADER),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
