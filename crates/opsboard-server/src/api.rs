use crate::ws::Broadcaster;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use opsboard_core::{Task, TaskColumn, TaskCost, TaskPriority, TokenUsage, User};
use opsboard_storage::{StorageError, Store, TaskPatch};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

pub struct AppState {
    pub store: Mutex<Store>,
    pub broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
            broadcaster: Broadcaster::default(),
        }
    }
}

/// Error envelope returned by every REST route:
/// `{error, message, statusCode, timestamp, path}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    path: String,
}

impl ApiError {
    pub fn bad_request(path: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            path: path.to_string(),
        }
    }

    pub fn not_found(path: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            path: path.to_string(),
        }
    }

    pub fn internal(path: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
            path: path.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> Value {
        json!({
            "error": self.status.canonical_reason().unwrap_or("Error"),
            "message": self.message,
            "statusCode": self.status.as_u16(),
            "timestamp": Utc::now().to_rfc3339(),
            "path": self.path,
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

fn storage_error(path: &str, err: StorageError) -> ApiError {
    error!(event = "storage_error", path = path, error = %err);
    ApiError::internal(path)
}

fn decode<T: DeserializeOwned>(path: &str, body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|err| ApiError::bad_request(path, err.to_string()))
}

fn parse_column(path: &str, raw: &str) -> Result<TaskColumn, ApiError> {
    TaskColumn::from_str(raw).map_err(|err| ApiError::bad_request(path, err))
}

fn parse_priority(path: &str, raw: &str) -> Result<TaskPriority, ApiError> {
    TaskPriority::from_str(raw).map_err(|err| ApiError::bad_request(path, err))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    column: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    assigned_agent: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateTaskRequest {
    title: Option<String>,
    description: Option<String>,
    column: Option<String>,
    priority: Option<String>,
    tags: Option<Vec<String>>,
    // Missing leaves the assignee alone; an explicit null clears it.
    #[serde(default, deserialize_with = "double_option")]
    assigned_agent: Option<Option<String>>,
}

/// Wraps a deserialized value in `Some` so a present-but-null field becomes
/// `Some(None)` instead of collapsing into the missing-field `None`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct MoveTaskRequest {
    column: String,
}

#[derive(Debug, Deserialize)]
struct CreateCostRequest {
    task_id: String,
    model: String,
    amount_usd: f64,
    #[serde(default)]
    tokens: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    name: String,
    email: String,
}

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    task_id: Option<String>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Json<Vec<Task>>, ApiError> {
    let store = state.store.lock().await;
    let tasks = store
        .tasks()
        .map_err(|err| storage_error(uri.path(), err))?;
    Ok(Json(tasks))
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let path = uri.path();
    let request: CreateTaskRequest = decode(path, body)?;
    if request.title.trim().is_empty() {
        return Err(ApiError::bad_request(path, "title must not be empty"));
    }
    let column = match request.column.as_deref() {
        Some(raw) => parse_column(path, raw)?,
        None => TaskColumn::default(),
    };
    let priority = match request.priority.as_deref() {
        Some(raw) => parse_priority(path, raw)?,
        None => TaskPriority::default(),
    };

    let now = Utc::now();
    let task = Task {
        id: Uuid::new_v4().to_string(),
        title: request.title,
        description: request.description,
        column,
        priority,
        tags: request.tags,
        assigned_agent: request.assigned_agent,
        created_by: request.created_by,
        created_at: now,
        updated_at: now,
    };

    {
        let store = state.store.lock().await;
        store
            .insert_task(&task)
            .map_err(|err| storage_error(path, err))?;
    }
    info!(event = "task_created", task_id = %task.id, column = %task.column);
    state
        .broadcaster
        .broadcast("task_created", serde_json::to_value(&task).unwrap_or(Value::Null))
        .await;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let path = uri.path();
    let store = state.store.lock().await;
    let task = store
        .task(&task_id)
        .map_err(|err| storage_error(path, err))?
        .ok_or_else(|| ApiError::not_found(path, format!("task {task_id} not found")))?;
    Ok(Json(task))
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(task_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Task>, ApiError> {
    let path = uri.path();
    let request: UpdateTaskRequest = decode(path, body)?;
    let patch = TaskPatch {
        title: request.title,
        description: request.description,
        column: request
            .column
            .as_deref()
            .map(|raw| parse_column(path, raw))
            .transpose()?,
        priority: request
            .priority
            .as_deref()
            .map(|raw| parse_priority(path, raw))
            .transpose()?,
        tags: request.tags,
        assigned_agent: request.assigned_agent,
    };

    let updated = {
        let store = state.store.lock().await;
        store
            .update_task(&task_id, patch, Utc::now())
            .map_err(|err| storage_error(path, err))?
    }
    .ok_or_else(|| ApiError::not_found(path, format!("task {task_id} not found")))?;

    info!(event = "task_updated", task_id = %updated.id);
    state
        .broadcaster
        .broadcast(
            "task_updated",
            serde_json::to_value(&updated).unwrap_or(Value::Null),
        )
        .await;
    Ok(Json(updated))
}

pub async fn move_task(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(task_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Task>, ApiError> {
    let path = uri.path();
    let request: MoveTaskRequest = decode(path, body)?;
    let column = parse_column(path, &request.column)?;

    let moved = {
        let store = state.store.lock().await;
        store
            .move_task(&task_id, column, Utc::now())
            .map_err(|err| storage_error(path, err))?
    }
    .ok_or_else(|| ApiError::not_found(path, format!("task {task_id} not found")))?;

    info!(event = "task_moved", task_id = %moved.id, column = %moved.column);
    state
        .broadcaster
        .broadcast(
            "task_moved",
            json!({ "id": moved.id, "column": moved.column }),
        )
        .await;
    Ok(Json(moved))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let path = uri.path();
    let deleted = {
        let store = state.store.lock().await;
        store
            .delete_task(&task_id)
            .map_err(|err| storage_error(path, err))?
    };
    if !deleted {
        return Err(ApiError::not_found(path, format!("task {task_id} not found")));
    }
    info!(event = "task_deleted", task_id = %task_id);
    state
        .broadcaster
        .broadcast("task_deleted", json!({ "id": task_id }))
        .await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn list_costs(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(query): Query<CostQuery>,
) -> Result<Json<Vec<TaskCost>>, ApiError> {
    let path = uri.path();
    let store = state.store.lock().await;
    let costs = match query.task_id.as_deref() {
        Some(task_id) => store.costs_for_task(task_id),
        None => store.costs(),
    }
    .map_err(|err| storage_error(path, err))?;
    Ok(Json(costs))
}

pub async fn create_cost(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let path = uri.path();
    let request: CreateCostRequest = decode(path, body)?;
    if request.amount_usd < 0.0 {
        return Err(ApiError::bad_request(path, "amount_usd must not be negative"));
    }

    let cost = TaskCost {
        id: Uuid::new_v4().to_string(),
        task_id: request.task_id,
        model: request.model,
        tokens: request.tokens,
        amount_usd: request.amount_usd,
        recorded_at: Utc::now(),
    };

    {
        let store = state.store.lock().await;
        store
            .task(&cost.task_id)
            .map_err(|err| storage_error(path, err))?
            .ok_or_else(|| {
                ApiError::not_found(path, format!("task {} not found", cost.task_id))
            })?;
        store
            .insert_cost(&cost)
            .map_err(|err| storage_error(path, err))?;
    }
    info!(event = "cost_recorded", task_id = %cost.task_id, model = %cost.model, amount_usd = cost.amount_usd);
    state
        .broadcaster
        .broadcast(
            "cost_recorded",
            serde_json::to_value(&cost).unwrap_or(Value::Null),
        )
        .await;
    Ok((StatusCode::CREATED, Json(cost)).into_response())
}

pub async fn analytics_summary(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path();
    let store = state.store.lock().await;
    let summary = store
        .cost_summary()
        .map_err(|err| storage_error(path, err))?;
    Ok(Json(json!({
        "total_usd": summary.total_usd,
        "by_model": summary.by_model,
        "by_day": summary.by_day,
    })))
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Json<Vec<User>>, ApiError> {
    let store = state.store.lock().await;
    let users = store
        .users()
        .map_err(|err| storage_error(uri.path(), err))?;
    Ok(Json(users))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let path = uri.path();
    let request: CreateUserRequest = decode(path, body)?;
    if request.name.trim().is_empty() || request.email.trim().is_empty() {
        return Err(ApiError::bad_request(path, "name and email are required"));
    }

    let user = User {
        id: Uuid::new_v4().to_string(),
        name: request.name,
        email: request.email,
        created_at: Utc::now(),
    };
    let store = state.store.lock().await;
    store
        .upsert_user(&user)
        .map_err(|err| storage_error(path, err))?;
    info!(event = "user_created", user_id = %user.id);
    Ok((StatusCode::CREATED, Json(user)).into_response())
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let path = uri.path();
    let deleted = {
        let store = state.store.lock().await;
        store
            .delete_user(&user_id)
            .map_err(|err| storage_error(path, err))?
    };
    if !deleted {
        return Err(ApiError::not_found(path, format!("user {user_id} not found")));
    }
    info!(event = "user_deleted", user_id = %user_id);
    Ok(StatusCode::NO_CONTENT.into_response())
}
