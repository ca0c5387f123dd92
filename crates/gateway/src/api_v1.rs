//! `/v1` routes: setup records, tasks, messages, and the event stream.
//!
//! Handlers never run the reconciler themselves. Writes are followed by a
//! [`DomainEvent`] on the bus and the runtime picks the task up from there.

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        Json,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskforge_core::{
    Agent, DesiredPhase, DomainEvent, Message, Model, ModelPricing, ProviderKind, ProviderRecord,
    Task, TaskId,
};

use crate::{GatewayError, SharedState};

type ApiResult<T> = Result<T, GatewayError>;

/// Build the `/v1` router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/providers", post(create_provider_handler))
        .route("/models", post(create_model_handler))
        .route("/agents", post(create_agent_handler))
        .route("/tasks", post(create_task_handler))
        .route("/tasks/{id}", get(get_task_handler))
        .route(
            "/tasks/{id}/messages",
            get(list_messages_handler).post(post_message_handler),
        )
        .route("/tasks/{id}/suspend", post(suspend_handler))
        .route("/tasks/{id}/resume", post(resume_handler))
        .route("/tasks/{id}/events", get(events_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateProviderRequest {
    kind: String,
    #[serde(default)]
    base_url: Option<String>,
    api_key: String,
}

/// A provider as the API shows it. Credentials never leave the store.
#[derive(Serialize)]
struct ProviderResponse {
    id: String,
    kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
}

#[derive(Deserialize)]
struct CreateModelRequest {
    name: String,
    provider_id: String,
    #[serde(default)]
    context_window: Option<u32>,
    #[serde(default)]
    max_output_tokens: Option<u32>,
    #[serde(default)]
    pricing: ModelPricing,
}

#[derive(Deserialize)]
struct CreateAgentRequest {
    name: String,
    #[serde(default)]
    instructions: String,
    model_id: String,
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    agent_id: String,
    project_dir: PathBuf,
    #[serde(default)]
    title: Option<String>,
    /// Optional first user message
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct PostMessageRequest {
    content: String,
}

// ── Setup ─────────────────────────────────────────────────────────────────

async fn create_provider_handler(
    State(state): State<SharedState>,
    Json(payload): Json<CreateProviderRequest>,
) -> ApiResult<(StatusCode, Json<ProviderResponse>)> {
    let kind = ProviderKind::parse(&payload.kind).ok_or_else(|| {
        GatewayError::BadRequest(format!("unknown provider kind: {}", payload.kind))
    })?;
    if payload.api_key.trim().is_empty() {
        return Err(GatewayError::BadRequest("api_key must not be empty".into()));
    }

    let sealed = state.secrets.seal(&payload.api_key)?;
    let mut record = ProviderRecord::new(kind, sealed);
    if let Some(url) = payload.base_url {
        record = record.with_base_url(url);
    }
    let record = state.store.create_provider(record).await?;
    info!(provider_id = %record.id, kind = kind.as_str(), "Provider created");

    Ok((
        StatusCode::CREATED,
        Json(ProviderResponse {
            id: record.id,
            kind: record.kind,
            base_url: record.base_url,
        }),
    ))
}

async fn create_model_handler(
    State(state): State<SharedState>,
    Json(payload): Json<CreateModelRequest>,
) -> ApiResult<(StatusCode, Json<Model>)> {
    if state.store.get_provider(&payload.provider_id).await?.is_none() {
        return Err(GatewayError::not_found("provider", payload.provider_id));
    }

    let mut model = Model::new(payload.name, payload.provider_id).with_pricing(payload.pricing);
    if let Some(tokens) = payload.context_window {
        model = model.with_context_window(tokens);
    }
    if let Some(tokens) = payload.max_output_tokens {
        model.max_output_tokens = tokens;
    }
    let model = state.store.create_model(model).await?;
    info!(model_id = %model.id, name = %model.name, "Model created");
    Ok((StatusCode::CREATED, Json(model)))
}

async fn create_agent_handler(
    State(state): State<SharedState>,
    Json(payload): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    if state.store.get_model(&payload.model_id).await?.is_none() {
        return Err(GatewayError::not_found("model", payload.model_id));
    }
    let agent = state
        .store
        .create_agent(Agent::new(payload.name, payload.instructions, payload.model_id))
        .await?;
    info!(agent_id = %agent.id, "Agent created");
    Ok((StatusCode::CREATED, Json(agent)))
}

// ── Tasks ─────────────────────────────────────────────────────────────────

async fn create_task_handler(
    State(state): State<SharedState>,
    Json(payload): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    if state.store.get_agent(&payload.agent_id).await?.is_none() {
        return Err(GatewayError::not_found("agent", payload.agent_id));
    }
    let is_dir = tokio::fs::metadata(&payload.project_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(GatewayError::BadRequest(format!(
            "project_dir is not a directory: {}",
            payload.project_dir.display()
        )));
    }

    let mut task = Task::new(payload.agent_id, payload.project_dir);
    if let Some(title) = payload.title.filter(|t| !t.trim().is_empty()) {
        task = task.with_title(title);
    }
    let task = state.store.create_task(task).await?;
    info!(task_id = %task.id, agent_id = %task.agent_id, "Task created");

    if let Some(content) = payload.message.filter(|c| !c.trim().is_empty()) {
        state
            .store
            .create_message(Message::user(task.id.clone(), content))
            .await?;
        state.bus.publish(DomainEvent::TaskChanged {
            task_id: task.id.clone(),
        });
    }

    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(load_task(&state, id).await?))
}

async fn list_messages_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    let task = load_task(&state, id).await?;
    Ok(Json(state.store.list_messages(&task.id).await?))
}

/// `POST /v1/tasks/{id}/messages`: append a user message and wake the task.
async fn post_message_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(payload): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    if payload.content.trim().is_empty() {
        return Err(GatewayError::BadRequest("content must not be empty".into()));
    }
    let task = load_task(&state, id).await?;

    let message = state
        .store
        .create_message(Message::user(task.id.clone(), payload.content))
        .await?;
    debug!(task_id = %task.id, message_id = %message.id, "User message stored");
    state.bus.publish(DomainEvent::TaskChanged { task_id: task.id });

    Ok((StatusCode::CREATED, Json(message)))
}

async fn suspend_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let mut task = load_task(&state, id).await?;
    state
        .store
        .set_desired_phase(&task.id, DesiredPhase::Suspended)
        .await?;
    task.desired_phase = DesiredPhase::Suspended;
    info!(task_id = %task.id, "Task suspended");
    state.bus.publish(DomainEvent::TaskSuspended {
        task_id: task.id.clone(),
    });
    Ok(Json(task))
}

async fn resume_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let mut task = load_task(&state, id).await?;
    state
        .store
        .set_desired_phase(&task.id, DesiredPhase::Normal)
        .await?;
    task.desired_phase = DesiredPhase::Normal;
    info!(task_id = %task.id, "Task resumed");
    state.bus.publish(DomainEvent::TaskChanged {
        task_id: task.id.clone(),
    });
    Ok(Json(task))
}

// ── Events (SSE) ──────────────────────────────────────────────────────────

/// `GET /v1/tasks/{id}/events`: processed history, then live events.
///
/// The subscription ends when the client disconnects and the stream is
/// dropped.
async fn events_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let task = load_task(&state, id).await?;
    let subscription = state
        .hub
        .subscribe(&task.id, CancellationToken::new())
        .await?;
    debug!(task_id = %task.id, "Event stream opened");

    let stream = subscription.into_stream().map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.kind()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn load_task(state: &SharedState, id: String) -> ApiResult<Task> {
    let task_id = TaskId::from(id);
    state
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("task", task_id.as_str()))
}
