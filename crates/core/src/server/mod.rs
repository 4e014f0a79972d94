use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::TaskError;
use crate::id::created_at;
use crate::runner::TaskRunner;
use crate::task::{Task, TaskFile, TaskParams, TaskState, TaskStatus};

const DEFAULT_LIST_LIMIT: usize = 100;
const FALLBACK_HOST: &str = "localhost";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    runner: TaskRunner,
}

impl AppState {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            inner: Arc::new(AppStateInner { runner }),
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub date: Option<String>,
    pub status: TaskStatus,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub params: TaskParams,
    pub status: TaskStatus,
    pub files: TaskFiles,
}

#[derive(Debug, Default, Serialize)]
pub struct TaskFiles {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wad: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/new", get(create_task))
        .route("/all", get(list_tasks))
        .route("/task/{id}", get(get_task))
        .route("/task/{id}/log", get(stream_log))
        .route("/task/{id}/params", get(stream_params))
        .route("/task/{id}/retry", get(retry_task))
        .route("/task/{id}/wad", get(download_wad))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> Response {
    redirect("/all")
}

async fn create_task(
    State(state): State<AppState>,
    Query(params): Query<TaskParams>,
) -> Result<Response, AppError> {
    let id = state.runner().create(params).await?;
    info!(task_id = %id, "Task requested over HTTP");

    let mut response = redirect(&format!("/task/{id}"));
    *response.body_mut() = Body::from(id);
    Ok(response)
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Map<String, serde_json::Value>>, AppError> {
    let base = base_url(&headers);
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let ids = state.runner().list_task_ids().await?;
    let mut all = serde_json::Map::new();
    for id in ids.into_iter().rev().skip(offset).take(limit) {
        let status = state.runner().task(&id)?.status().await?;
        let summary = TaskSummary {
            date: created_at(&id)
                .map(|date| date.to_rfc3339_opts(SecondsFormat::Millis, true)),
            status,
            url: format!("{base}/task/{id}"),
        };
        let value = serde_json::to_value(summary)
            .map_err(|err| AppError::Internal(format!("failed to encode task summary: {err}")))?;
        all.insert(id, value);
    }

    Ok(Json(all))
}

async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.runner().existing_task(&id).await?;
    let params = task.params().await?;
    let status = task.status().await?;

    let base = base_url(&headers);
    let mut files = TaskFiles::default();
    if matches!(
        status.state,
        TaskState::Done | TaskState::Running | TaskState::Error
    ) {
        files.log = Some(format!("{base}/task/{id}/log"));
    }
    if status.state == TaskState::Done {
        files.wad = Some(format!("{base}/task/{id}/wad"));
    }

    Ok(Json(TaskResponse {
        params,
        status,
        files,
    }))
}

async fn stream_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let task = state.runner().existing_task(&id).await?;
    stream_file(&task, TaskFile::Log, "text/plain; charset=utf-8").await
}

async fn stream_params(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let task = state.runner().existing_task(&id).await?;
    stream_file(&task, TaskFile::Params, "text/plain; charset=utf-8").await
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    state.runner().retry(&id).await?;
    info!(task_id = %id, "Task retry requested over HTTP");
    Ok(redirect(&format!("/task/{id}")))
}

async fn download_wad(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let task = state.runner().existing_task(&id).await?;
    let status = task.status().await?;

    let mut response = stream_file(&task, TaskFile::Artifact, "application/octet-stream").await?;
    let disposition = format!(
        "attachment;filename=\"{}\"",
        wad_file_name(status.title.as_deref())
    );
    let value = HeaderValue::from_str(&disposition)
        .map_err(|err| AppError::Internal(format!("invalid content disposition: {err}")))?;
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, value);
    Ok(response)
}

async fn stream_file(
    task: &Task,
    file: TaskFile,
    content_type: &'static str,
) -> Result<Response, AppError> {
    let path = task.path(file);
    let handle = tokio::fs::File::open(&path)
        .await
        .map_err(|err| AppError::from(TaskError::storage(&path, err)))?;
    let body = Body::from_stream(ReaderStream::new(handle));
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Scheme and host as seen by the client, honouring reverse-proxy headers.
fn base_url(headers: &HeaderMap) -> String {
    let first_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let scheme = first_value("x-forwarded-proto").unwrap_or("http");
    let host = first_value("x-forwarded-host")
        .or_else(|| first_value(header::HOST.as_str()))
        .unwrap_or(FALLBACK_HOST);
    format!("{scheme}://{host}")
}

fn wad_file_name(title: Option<&str>) -> String {
    let stem: String = title
        .unwrap_or("output")
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    let stem = stem.trim();
    if stem.is_empty() {
        "output.wad".to_string()
    } else {
        format!("{stem}.wad")
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::InvalidId(_) => AppError::BadRequest(err.to_string()),
            ref other if other.is_not_found() => AppError::NotFound(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}
