use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    ComparisonRequest, DataType, Dataset, DatasetId, Error, ForecastService, Model, ModelId,
    PageRequest, PredictionRequest, ResultArtifact, ServiceStats, Task, TaskFilter, TaskId,
    TaskKind, TaskPage, TaskSnapshot, TaskStatus, TrainingRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::state::AppState;

pub const DEFAULT_SAMPLE_ROWS: usize = 1000;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/tasks/training", post(submit_training))
        .route("/api/v1/tasks/prediction", post(submit_prediction))
        .route("/api/v1/tasks/comparison", post(submit_comparison))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/results", get(get_task_results))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/models/:id", get(get_model).delete(deactivate_model))
        .route("/api/v1/datasets", get(list_datasets).post(register_dataset))
        .route("/api/v1/datasets/scan", post(scan_datasets))
        .route("/api/v1/datasets/sample", post(generate_sample))
        .route("/api/v1/datasets/:id", get(get_dataset))
        .route("/api/v1/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::DuplicateDispatch(_)
            | Error::InvalidTransition { .. }
            | Error::ProgressRegression { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("error interno atendiendo request: {:#}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Corre la llamada al service en el pool bloqueante: varias tocan disco
/// (CSV, artifacts).
async fn call<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&ForecastService) -> common::Result<T> + Send + 'static,
{
    let service = Arc::clone(&state.service);
    match tokio::task::spawn_blocking(move || f(&service)).await {
        Ok(result) => Ok(Json(result?)),
        Err(e) => Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("handler task failed: {e}"),
        }),
    }
}

fn parse_data_type(raw: &str) -> Result<DataType, ApiError> {
    raw.parse::<DataType>().map_err(ApiError::from)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

fn accepted(task_id: TaskId) -> (StatusCode, Json<TaskAccepted>) {
    info!("task {} aceptada", task_id);
    (
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            status: TaskStatus::Pending,
        }),
    )
}

async fn submit_training(
    State(state): State<AppState>,
    Json(req): Json<TrainingRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let Json(id) = call(&state, move |svc| svc.submit_training(req)).await?;
    Ok(accepted(id))
}

async fn submit_prediction(
    State(state): State<AppState>,
    Json(req): Json<PredictionRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let Json(id) = call(&state, move |svc| svc.submit_prediction(req)).await?;
    Ok(accepted(id))
}

async fn submit_comparison(
    State(state): State<AppState>,
    Json(req): Json<ComparisonRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let Json(id) = call(&state, move |svc| svc.submit_comparison(req)).await?;
    Ok(accepted(id))
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskListQuery {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<TaskListQuery>,
) -> ApiResult<TaskPage> {
    let filter = TaskFilter {
        kind: q.kind.as_deref().map(str::parse::<TaskKind>).transpose()?,
        status: q.status.as_deref().map(str::parse::<TaskStatus>).transpose()?,
    };
    let page = PageRequest::new(q.page, q.per_page);
    call(&state, move |svc| svc.list_tasks(&filter, page)).await
}

async fn get_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> ApiResult<TaskSnapshot> {
    call(&state, move |svc| svc.get_task(id)).await
}

async fn get_task_results(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<ResultArtifact> {
    call(&state, move |svc| svc.result_artifact(id)).await
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    call(&state, move |svc| svc.cancel_task(id)).await
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelListQuery {
    #[serde(default)]
    pub active_only: bool,
}

async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ModelListQuery>,
) -> ApiResult<Vec<Model>> {
    call(&state, move |svc| svc.list_models(q.active_only)).await
}

async fn get_model(State(state): State<AppState>, Path(id): Path<ModelId>) -> ApiResult<Model> {
    call(&state, move |svc| svc.get_model(id)).await
}

async fn deactivate_model(
    State(state): State<AppState>,
    Path(id): Path<ModelId>,
) -> ApiResult<Model> {
    call(&state, move |svc| svc.deactivate_model(id)).await
}

async fn list_datasets(State(state): State<AppState>) -> ApiResult<Vec<Dataset>> {
    call(&state, |svc| svc.list_datasets()).await
}

async fn get_dataset(
    State(state): State<AppState>,
    Path(id): Path<DatasetId>,
) -> ApiResult<Dataset> {
    call(&state, move |svc| svc.get_dataset(id)).await
}

#[derive(Debug, Deserialize)]
pub struct RegisterDatasetBody {
    pub path: PathBuf,
    pub name: Option<String>,
    pub data_type: String,
}

async fn register_dataset(
    State(state): State<AppState>,
    Json(body): Json<RegisterDatasetBody>,
) -> ApiResult<Dataset> {
    let data_type = parse_data_type(&body.data_type)?;
    call(&state, move |svc| {
        svc.register_dataset(&body.path, body.name, data_type)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct ScanBody {
    pub pattern: String,
    pub data_type: String,
}

async fn scan_datasets(
    State(state): State<AppState>,
    Json(body): Json<ScanBody>,
) -> ApiResult<Vec<Dataset>> {
    let data_type = parse_data_type(&body.data_type)?;
    call(&state, move |svc| svc.scan_datasets(&body.pattern, data_type)).await
}

#[derive(Debug, Deserialize)]
pub struct SampleBody {
    pub data_type: String,
    pub rows: Option<usize>,
}

async fn generate_sample(
    State(state): State<AppState>,
    Json(body): Json<SampleBody>,
) -> ApiResult<Dataset> {
    let data_type = parse_data_type(&body.data_type)?;
    let rows = body.rows.unwrap_or(DEFAULT_SAMPLE_ROWS);
    call(&state, move |svc| svc.generate_sample_dataset(data_type, rows)).await
}

async fn stats(State(state): State<AppState>) -> ApiResult<ServiceStats> {
    call(&state, |svc| svc.stats()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use common::{Core, Settings};
    use serde_json::Value;
    use std::env;
    use std::fs;
    use tower::ServiceExt;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("master_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn app(sub: &str) -> Router {
        let dir = temp_dir(sub);
        let core = Core::from_settings(&Settings {
            data_root: dir.clone(),
            registry_path: dir.join("registry.json"),
            ..Settings::default()
        })
        .unwrap();
        build_router(AppState::new(core.service))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(v) => req
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_ok() {
        let app = app("health");
        let res = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prediction_sin_model_es_404() {
        let app = app("missing_model");
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/tasks/prediction",
            Some(json!({ "model_id": 9999, "input_sequence": [1.0, 2.0] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("9999"));

        let (_, page) = send(&app, "GET", "/api/v1/tasks", None).await;
        assert_eq!(page["total"], 0);
    }

    #[tokio::test]
    async fn filtro_de_status_invalido_es_400() {
        let app = app("bad_filter");
        let (status, body) = send(&app, "GET", "/api/v1/tasks?status=dormida", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn training_cancel_y_cancel_de_nuevo() {
        let app = app("cancel");
        let (status, dataset) = send(
            &app,
            "POST",
            "/api/v1/datasets/sample",
            Some(json!({ "data_type": "weather", "rows": 150 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dataset["num_samples"], 150);

        let (status, accepted) = send(
            &app,
            "POST",
            "/api/v1/tasks/training",
            Some(json!({ "dataset_id": dataset["id"], "model_type": "lstm" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted["status"], "pending");
        let id = accepted["task_id"].as_u64().unwrap();

        let (status, task) = send(&app, "POST", &format!("/api/v1/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "cancelled");

        let (status, _) = send(&app, "POST", &format!("/api/v1/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, "GET", &format!("/api/v1/tasks/{id}/results"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dataset_con_tipo_desconocido_es_400() {
        let app = app("bad_type");
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/datasets/sample",
            Some(json!({ "data_type": "stocks" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_vacio() {
        let app = app("stats");
        let (status, body) = send(&app, "GET", "/api/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registry"]["total_tasks"], 0);
        assert_eq!(body["dispatcher"]["queued"], 0);
    }
}
