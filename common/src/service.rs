//! Capa de requests: valida contra el registry, crea la task en el
//! lifecycle y la entrega al dispatcher. Es lo que consume el master HTTP.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{Dataset, Model, NewDataset};
use crate::config::Settings;
use crate::data::{CsvDataPreparation, DataPreparation};
use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
use crate::error::{Error, Result};
use crate::forecast::BuiltinForecasters;
use crate::ids::{DatasetId, ModelId, TaskId};
use crate::job::{DataType, ModelType, TaskParameters, TaskSpec, TrainingConfig};
use crate::lifecycle::LifecycleController;
use crate::pipeline::PipelineRunner;
use crate::registry::{InMemoryRegistry, Registry, RegistryCounts};
use crate::results::{read_result, ArtifactLayout, ResultArtifact};
use crate::sweeper::RetentionSweeper;
use crate::task::{PageRequest, Task, TaskFilter, TaskPage, TaskStatus};

pub const RECENT_TASKS: usize = 5;
pub const MAX_SAMPLE_ROWS: usize = 1_000_000;

/* --------- Requests --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub dataset_id: DatasetId,
    pub model_type: String,
    /// Si falta se usa el del dataset.
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub config: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub model_id: ModelId,
    pub input_sequence: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonRequest {
    pub model_a_id: ModelId,
    pub model_b_id: ModelId,
    pub dataset_id: DatasetId,
}

/* --------- Respuestas --------- */

/// Task + resultado si ya está escrito.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub task: Task,
    pub task_results: Option<ResultArtifact>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub registry: RegistryCounts,
    pub dispatcher: DispatcherStats,
    pub recent_tasks: Vec<Task>,
}

pub struct ForecastService {
    lifecycle: Arc<LifecycleController>,
    dispatcher: Dispatcher,
    data: Arc<dyn DataPreparation>,
    layout: ArtifactLayout,
}

impl ForecastService {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        dispatcher: Dispatcher,
        data: Arc<dyn DataPreparation>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            lifecycle,
            dispatcher,
            data,
            layout,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    fn registry(&self) -> &dyn Registry {
        self.lifecycle.registry().as_ref()
    }

    fn dataset(&self, id: DatasetId) -> Result<Dataset> {
        self.registry()
            .get_dataset(id)?
            .ok_or_else(|| Error::not_found("dataset", id))
    }

    fn model(&self, id: ModelId) -> Result<Model> {
        self.registry()
            .get_model(id)?
            .ok_or_else(|| Error::not_found("model", id))
    }

    /// Crea la task y la encola. Si no se pudo encolar, la task queda
    /// cancelada para que no quede colgada en `pending`.
    fn create_and_dispatch(&self, spec: TaskSpec) -> Result<TaskId> {
        let params = spec.parameters.clone();
        let id = self.lifecycle.create(spec)?;
        if let Err(e) = self.dispatcher.submit(id, params) {
            warn!(task_id = %id, error = %e, "no se pudo encolar la task recién creada");
            let _ = self.lifecycle.cancel(id);
            return Err(e);
        }
        Ok(id)
    }

    /* --------- Submits --------- */

    pub fn submit_training(&self, req: TrainingRequest) -> Result<TaskId> {
        let dataset = self.dataset(req.dataset_id)?;
        let data_type = req
            .data_type
            .unwrap_or_else(|| dataset.data_type.to_string());
        self.create_and_dispatch(TaskSpec {
            kind: "training".into(),
            data_type,
            model_type: Some(req.model_type),
            parameters: TaskParameters::Training {
                dataset_id: dataset.id,
                model_config: req.config,
            },
            data_file_path: Some(dataset.file_path),
        })
    }

    pub fn submit_prediction(&self, req: PredictionRequest) -> Result<TaskId> {
        let model = self.usable_model(req.model_id)?;
        let needed = model.training_parameters.sequence_length;
        if req.input_sequence.len() < needed {
            return Err(Error::validation(format!(
                "model {} needs at least {needed} input values, got {}",
                model.id,
                req.input_sequence.len()
            )));
        }
        self.create_and_dispatch(TaskSpec {
            kind: "prediction".into(),
            data_type: model.data_type.to_string(),
            model_type: Some(model.model_type.to_string()),
            parameters: TaskParameters::Prediction {
                model_id: model.id,
                input_sequence: req.input_sequence,
            },
            data_file_path: None,
        })
    }

    pub fn submit_comparison(&self, req: ComparisonRequest) -> Result<TaskId> {
        self.usable_model(req.model_a_id)?;
        self.usable_model(req.model_b_id)?;
        let dataset = self.dataset(req.dataset_id)?;
        self.create_and_dispatch(TaskSpec {
            kind: "comparison".into(),
            data_type: dataset.data_type.to_string(),
            model_type: None,
            parameters: TaskParameters::Comparison {
                model_a_id: req.model_a_id,
                model_b_id: req.model_b_id,
                dataset_id: dataset.id,
            },
            data_file_path: Some(dataset.file_path),
        })
    }

    fn usable_model(&self, id: ModelId) -> Result<Model> {
        let model = self.model(id)?;
        if !model.is_active {
            return Err(Error::validation(format!("model {id} is inactive")));
        }
        Ok(model)
    }

    /* --------- Tasks --------- */

    pub fn get_task(&self, id: TaskId) -> Result<TaskSnapshot> {
        let task = self.lifecycle.get(id)?;
        let task_results = match (&task.status, &task.result_file_path) {
            (TaskStatus::Completed, Some(path)) => match read_result(Path::new(path)) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    warn!(task_id = %id, error = %e, "no se pudo leer el resultado");
                    None
                }
            },
            _ => None,
        };
        Ok(TaskSnapshot { task, task_results })
    }

    pub fn result_artifact(&self, id: TaskId) -> Result<ResultArtifact> {
        let task = self.lifecycle.get(id)?;
        let path = task
            .result_file_path
            .ok_or_else(|| Error::not_found("result", id))?;
        read_result(Path::new(&path)).map_err(|e| {
            warn!(task_id = %id, error = %e, "artifact ilegible");
            Error::not_found("result", id)
        })
    }

    /// Cancela en el registry y, si todavía no arrancó, lo saca de la cola.
    pub fn cancel_task(&self, id: TaskId) -> Result<Task> {
        let task = self.lifecycle.cancel(id)?;
        if self.dispatcher.withdraw(id) {
            debug!(task_id = %id, "cancelada antes de arrancar");
        }
        Ok(task)
    }

    pub fn list_tasks(&self, filter: &TaskFilter, page: PageRequest) -> Result<TaskPage> {
        Ok(self.registry().list_tasks(filter, page)?)
    }

    /// Vuelve a encolar lo que quedó `pending`/`running` de una corrida
    /// anterior del proceso.
    pub fn requeue_unfinished(&self) -> Result<usize> {
        let mut unfinished = self
            .registry()
            .tasks_with_status(&[TaskStatus::Pending, TaskStatus::Running])?;
        unfinished.sort_by_key(|t| t.id);
        let mut queued = 0;
        for task in unfinished {
            match self.dispatcher.submit(task.id, task.parameters) {
                Ok(()) => queued += 1,
                Err(Error::DuplicateDispatch(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if queued > 0 {
            info!(queued, "tasks sin terminar reencoladas");
        }
        Ok(queued)
    }

    /* --------- Models --------- */

    pub fn list_models(&self, active_only: bool) -> Result<Vec<Model>> {
        Ok(self.registry().list_models(active_only)?)
    }

    pub fn get_model(&self, id: ModelId) -> Result<Model> {
        self.model(id)
    }

    /// Baja lógica: el archivo del model no se toca.
    pub fn deactivate_model(&self, id: ModelId) -> Result<Model> {
        let model = self.registry().set_model_active(id, false)?;
        info!(model_id = %id, "model desactivado");
        Ok(model)
    }

    /* --------- Datasets --------- */

    pub fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.registry().list_datasets()?)
    }

    /// Si el análisis no estaba cacheado se calcula ahora y se guarda.
    pub fn get_dataset(&self, id: DatasetId) -> Result<Dataset> {
        let dataset = self.dataset(id)?;
        if dataset.analysis.is_some() {
            return Ok(dataset);
        }
        match self.data.load(Path::new(&dataset.file_path)) {
            Ok(table) => {
                let analysis = self.data.analyze(&table);
                Ok(self.registry().cache_dataset_analysis(id, analysis)?)
            }
            Err(e) => {
                warn!(dataset_id = %id, error = %e, "no se pudo analizar el dataset");
                Ok(dataset)
            }
        }
    }

    /// Registra un CSV existente. Si la ruta ya estaba registrada devuelve
    /// ese dataset.
    pub fn register_dataset(
        &self,
        path: &Path,
        name: Option<String>,
        data_type: DataType,
    ) -> Result<Dataset> {
        let file_path = path.display().to_string();
        if let Some(existing) = self
            .registry()
            .list_datasets()?
            .into_iter()
            .find(|d| d.file_path == file_path)
        {
            return Ok(existing);
        }

        let meta = fs::metadata(path).map_err(|e| {
            Error::validation(format!("dataset file {}: {e}", path.display()))
        })?;
        let table = self
            .data
            .load(path)
            .map_err(|e| Error::validation(format!("{e:#}")))?;
        let name = name.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_path.clone())
        });
        let dataset = self.registry().insert_dataset(NewDataset {
            name,
            data_type,
            file_path,
            file_size: meta.len(),
            analysis: self.data.analyze(&table),
        })?;
        info!(dataset_id = %dataset.id, rows = dataset.num_samples, "dataset registrado");
        Ok(dataset)
    }

    /// Registra todos los CSV que matchean el patrón. Los que fallan se
    /// loguean y se saltan.
    pub fn scan_datasets(&self, pattern: &str, data_type: DataType) -> Result<Vec<Dataset>> {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::validation(format!("bad glob '{pattern}': {e}")))?;
        let mut out = Vec::new();
        for entry in paths {
            let path: PathBuf = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "entrada ilegible en el scan");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            match self.register_dataset(&path, None, data_type) {
                Ok(dataset) => out.push(dataset),
                Err(e) => warn!(path = %path.display(), error = %e, "archivo salteado en el scan"),
            }
        }
        Ok(out)
    }

    pub fn generate_sample_dataset(&self, data_type: DataType, rows: usize) -> Result<Dataset> {
        if rows == 0 || rows > MAX_SAMPLE_ROWS {
            return Err(Error::validation(format!(
                "rows must be between 1 and {MAX_SAMPLE_ROWS}, got {rows}"
            )));
        }
        let path = self
            .layout
            .samples_dir()
            .join(format!("{data_type}_sample_{rows}.csv"));
        if !path.exists() {
            self.data
                .generate_sample(data_type, rows, &path)
                .map_err(|e| Error::Io(std::io::Error::other(format!("{e:#}"))))?;
        }
        self.register_dataset(&path, None, data_type)
    }

    /* --------- Stats --------- */

    pub fn stats(&self) -> Result<ServiceStats> {
        let recent = self.registry().list_tasks(
            &TaskFilter::default(),
            PageRequest::new(Some(1), Some(RECENT_TASKS)),
        )?;
        Ok(ServiceStats {
            registry: self.registry().counts()?,
            dispatcher: self.dispatcher.stats(),
            recent_tasks: recent.tasks,
        })
    }
}

/// Todo el grafo de objetos armado desde `Settings`.
pub struct Core {
    pub registry: Arc<dyn Registry>,
    pub runner: Arc<PipelineRunner>,
    pub service: Arc<ForecastService>,
    pub sweeper: Arc<RetentionSweeper>,
}

impl Core {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        fs::create_dir_all(&settings.data_root)?;
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::open(&settings.registry_path)?);
        let layout = ArtifactLayout::new(&settings.data_root);
        let data: Arc<dyn DataPreparation> = Arc::new(CsvDataPreparation);

        let lifecycle = Arc::new(LifecycleController::new(Arc::clone(&registry)));
        let runner = Arc::new(PipelineRunner::new(
            Arc::clone(&lifecycle),
            Arc::clone(&data),
            Arc::new(BuiltinForecasters),
            layout.clone(),
        ));
        let dispatcher = Dispatcher::new(DispatcherConfig {
            concurrency: settings.worker_concurrency,
            max_deliveries: settings.max_deliveries,
            ..DispatcherConfig::default()
        });
        let service = Arc::new(ForecastService::new(lifecycle, dispatcher, data, layout));
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&registry),
            settings.retention_days,
        ));

        info!(
            data_root = %settings.data_root.display(),
            concurrency = settings.worker_concurrency,
            retention_days = settings.retention_days,
            "core armado"
        );
        Ok(Self {
            registry,
            runner,
            service,
            sweeper,
        })
    }
}
