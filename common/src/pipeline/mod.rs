//! Ejecución por stages de cada tipo de job. Cada stage llama a un
//! colaborador y después deja un checkpoint de progreso vía el lifecycle.
//! Antes de arrancar cada stage se mira si la task fue cancelada.

mod comparison;
mod prediction;
mod training;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{Model, NewModel};
use crate::data::DataPreparation;
use crate::error::{Error, Result};
use crate::forecast::ForecasterFactory;
use crate::ids::TaskId;
use crate::job::{TaskKind, TaskParameters};
use crate::lifecycle::{LifecycleController, TransitionFields};
use crate::registry::Registry;
use crate::results::{remove_if_present, ArtifactLayout};
use crate::task::{Task, TaskStatus};

/// Cada cuántos items de la comparación se persiste progreso.
pub const BATCH_PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ValidateDataset,
    PrepareData,
    TrainModel,
    PersistModel,
    LoadModel,
    Predict,
    PersistResult,
    LoadModels,
    PrepareTestSet,
    BatchPredict,
    ComputeMetrics,
    Persist,
    Finalize,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ValidateDataset => "validate_dataset",
            Stage::PrepareData => "prepare_data",
            Stage::TrainModel => "train_model",
            Stage::PersistModel => "persist_model",
            Stage::LoadModel => "load_model",
            Stage::Predict => "predict",
            Stage::PersistResult => "persist_result",
            Stage::LoadModels => "load_models",
            Stage::PrepareTestSet => "prepare_test_set",
            Stage::BatchPredict => "batch_predict",
            Stage::ComputeMetrics => "compute_metrics",
            Stage::Persist => "persist",
            Stage::Finalize => "finalize",
        }
    }

    /// Progreso que queda guardado al terminar el stage.
    pub fn checkpoint(self) -> f64 {
        match self {
            Stage::ValidateDataset => 0.1,
            Stage::PrepareData | Stage::LoadModels => 0.2,
            Stage::LoadModel | Stage::PrepareTestSet => 0.3,
            Stage::Predict => 0.6,
            Stage::BatchPredict => 0.85,
            Stage::TrainModel
            | Stage::PersistModel
            | Stage::PersistResult
            | Stage::ComputeMetrics => 0.9,
            Stage::Persist => 0.95,
            Stage::Finalize => 1.0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const TRAINING_STAGES: &[Stage] = &[
    Stage::ValidateDataset,
    Stage::PrepareData,
    Stage::TrainModel,
    Stage::PersistModel,
    Stage::Finalize,
];

pub const PREDICTION_STAGES: &[Stage] = &[
    Stage::LoadModel,
    Stage::Predict,
    Stage::PersistResult,
    Stage::Finalize,
];

pub const COMPARISON_STAGES: &[Stage] = &[
    Stage::LoadModels,
    Stage::PrepareTestSet,
    Stage::BatchPredict,
    Stage::ComputeMetrics,
    Stage::Persist,
    Stage::Finalize,
];

pub fn stages_for(kind: TaskKind) -> &'static [Stage] {
    match kind {
        TaskKind::Training => TRAINING_STAGES,
        TaskKind::Prediction => PREDICTION_STAGES,
        TaskKind::Comparison => COMPARISON_STAGES,
    }
}

/// `train_model` va de 0.2 a 0.9 según las épocas cerradas.
pub fn training_progress(epoch: u32, total: u32) -> f64 {
    0.2 + 0.7 * f64::from(epoch) / f64::from(total.max(1))
}

/// `batch_predict` va de 0.3 a 0.85 según los items procesados.
pub fn batch_progress(processed: usize, total: usize) -> f64 {
    0.3 + 0.55 * processed as f64 / total.max(1) as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed { stage: Stage },
    /// La cancelación se vio al llegar a `at`.
    Cancelled { at: Stage },
    /// La task ya no estaba pendiente cuando llegó el job.
    Skipped { status: TaskStatus },
}

pub struct PipelineRunner {
    lifecycle: Arc<LifecycleController>,
    data: Arc<dyn DataPreparation>,
    forecasters: Arc<dyn ForecasterFactory>,
    layout: ArtifactLayout,
}

impl PipelineRunner {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        data: Arc<dyn DataPreparation>,
        forecasters: Arc<dyn ForecasterFactory>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            lifecycle,
            data,
            forecasters,
            layout,
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    /// Corre todos los stages del job. Errores de stage terminan en
    /// `RunOutcome::Failed` (la task queda `failed`); `Err` sólo para fallas
    /// del propio registry.
    pub fn run(&self, task_id: TaskId, params: &TaskParameters) -> Result<RunOutcome> {
        let task = self.lifecycle.get(task_id)?;
        if params.kind() != task.kind {
            return Err(Error::validation(format!(
                "job for task {task_id} carries {} parameters but the task is {}",
                params.kind(),
                task.kind
            )));
        }

        match task.status {
            TaskStatus::Pending => {
                match self
                    .lifecycle
                    .transition(task_id, TaskStatus::Running, TransitionFields::default())
                {
                    Ok(_) => info!(task_id = %task_id, kind = %task.kind, "task en ejecución"),
                    Err(Error::InvalidTransition { from, .. }) => {
                        info!(task_id = %task_id, status = %from, "task ya no está pendiente, se salta");
                        return Ok(RunOutcome::Skipped { status: from });
                    }
                    Err(e) => return Err(e),
                }
            }
            TaskStatus::Running => {
                warn!(task_id = %task_id, "task ya estaba running (redelivery), se retoma");
            }
            status => {
                info!(task_id = %task_id, status = %status, "task terminal, se salta");
                return Ok(RunOutcome::Skipped { status });
            }
        }

        let mut run = StageRun {
            runner: self,
            task,
            written: Vec::new(),
            scratch: Vec::new(),
        };
        let result = match params {
            TaskParameters::Training {
                dataset_id,
                model_config,
            } => training::run(&mut run, *dataset_id, model_config),
            TaskParameters::Prediction {
                model_id,
                input_sequence,
            } => prediction::run(&mut run, *model_id, input_sequence),
            TaskParameters::Comparison {
                model_a_id,
                model_b_id,
                dataset_id,
            } => comparison::run(&mut run, *model_a_id, *model_b_id, *dataset_id),
        };

        let outcome = match result {
            Ok(()) => {
                info!(task_id = %task_id, "task completada");
                Ok(RunOutcome::Completed)
            }
            Err(Abort::Failed(stage)) => Ok(RunOutcome::Failed { stage }),
            Err(Abort::Cancelled(stage)) => {
                info!(task_id = %task_id, stage = %stage, "task cancelada, se corta el pipeline");
                run.discard_artifacts();
                Ok(RunOutcome::Cancelled { at: stage })
            }
            Err(Abort::Internal(e)) => {
                warn!(task_id = %task_id, error = %e, "error interno, se descartan los artifacts del run");
                run.discard_artifacts();
                Err(e)
            }
        };
        run.remove_scratch();
        outcome
    }

    /// Marca `failed` una task que quedó a medias (worker muerto o error
    /// interno). Si ya es terminal no hace nada.
    pub fn abandon(&self, task_id: TaskId, reason: &str) -> Result<()> {
        match self
            .lifecycle
            .transition(task_id, TaskStatus::Failed, TransitionFields::failure(reason))
        {
            Ok(_) => {
                warn!(task_id = %task_id, reason, "task abandonada");
                Ok(())
            }
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(task_id = %task_id, status = %from, "abandon sobre task no running");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Por qué se cortó un run antes de terminar.
pub(crate) enum Abort {
    Failed(Stage),
    Cancelled(Stage),
    Internal(Error),
}

impl From<Error> for Abort {
    fn from(err: Error) -> Self {
        Abort::Internal(err)
    }
}

/// Progreso intermedio desde callbacks de un colaborador. No corta el
/// stage: los rechazos sólo se loguean.
#[derive(Clone)]
pub(crate) struct ProgressSink {
    lifecycle: Arc<LifecycleController>,
    task_id: TaskId,
}

impl ProgressSink {
    pub(crate) fn report(&self, value: f64) {
        match self.lifecycle.record_progress(self.task_id, value) {
            Ok(_) => {}
            Err(Error::ProgressRegression { current, .. }) => {
                debug!(task_id = %self.task_id, value, current, "progreso por debajo del guardado, se ignora");
            }
            Err(e) => {
                debug!(task_id = %self.task_id, error = %e, "progreso no registrado");
            }
        }
    }
}

/// Estado de un run: la task al arrancar y los archivos escritos.
pub(crate) struct StageRun<'r> {
    runner: &'r PipelineRunner,
    task: Task,
    written: Vec<PathBuf>,
    scratch: Vec<PathBuf>,
}

impl<'r> StageRun<'r> {
    pub(crate) fn task(&self) -> &Task {
        &self.task
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub(crate) fn data(&self) -> &'r dyn DataPreparation {
        self.runner.data.as_ref()
    }

    pub(crate) fn forecasters(&self) -> &'r dyn ForecasterFactory {
        self.runner.forecasters.as_ref()
    }

    pub(crate) fn registry(&self) -> &'r dyn Registry {
        self.runner.lifecycle.registry().as_ref()
    }

    pub(crate) fn layout(&self) -> &'r ArtifactLayout {
        &self.runner.layout
    }

    pub(crate) fn progress_sink(&self) -> ProgressSink {
        ProgressSink {
            lifecycle: Arc::clone(&self.runner.lifecycle),
            task_id: self.task.id,
        }
    }

    /// Archivo que se borra si el run termina cancelado.
    pub(crate) fn track(&mut self, path: PathBuf) {
        self.written.push(path);
    }

    /// Directorio de trabajo que se borra al final del run, pase lo que pase.
    pub(crate) fn scratch(&mut self, dir: PathBuf) {
        self.scratch.push(dir);
    }

    /// Chequeo de cancelación, colaborador, checkpoint. Una falla del
    /// colaborador deja la task `failed` y corta el pipeline.
    pub(crate) fn stage<T>(
        &self,
        stage: Stage,
        body: impl FnOnce() -> anyhow::Result<T>,
    ) -> std::result::Result<T, Abort> {
        self.ensure_not_cancelled(stage)?;
        debug!(task_id = %self.task.id, stage = %stage, "stage");
        match body() {
            Ok(out) => {
                self.checkpoint(stage)?;
                Ok(out)
            }
            Err(cause) => Err(self.fail(stage, cause)),
        }
    }

    fn ensure_not_cancelled(&self, stage: Stage) -> std::result::Result<(), Abort> {
        match self.runner.lifecycle.status(self.task.id)? {
            TaskStatus::Cancelled => Err(Abort::Cancelled(stage)),
            _ => Ok(()),
        }
    }

    fn checkpoint(&self, stage: Stage) -> std::result::Result<(), Abort> {
        let value = stage.checkpoint();
        match self.runner.lifecycle.record_progress(self.task.id, value) {
            Ok(_) => Ok(()),
            Err(Error::ProgressRegression { current, .. }) => {
                debug!(task_id = %self.task.id, stage = %stage, value, current, "checkpoint viejo (redelivery), no se escribe");
                Ok(())
            }
            Err(Error::InvalidTransition {
                from: TaskStatus::Cancelled,
                ..
            }) => Err(Abort::Cancelled(stage)),
            Err(e) => Err(Abort::Internal(e)),
        }
    }

    fn fail(&self, stage: Stage, cause: anyhow::Error) -> Abort {
        let failure = Error::StageFailure { stage, cause };
        warn!(task_id = %self.task.id, stage = %stage, error = %failure, "stage falló");
        match self.runner.lifecycle.transition(
            self.task.id,
            TaskStatus::Failed,
            TransitionFields::failure(failure.to_string()),
        ) {
            Ok(_) => Abort::Failed(stage),
            Err(Error::InvalidTransition {
                from: TaskStatus::Cancelled,
                ..
            }) => Abort::Cancelled(stage),
            Err(e) => Abort::Internal(e),
        }
    }

    pub(crate) fn finalize(&self, fields: TransitionFields) -> std::result::Result<Task, Abort> {
        self.ensure_not_cancelled(Stage::Finalize)?;
        self.runner
            .lifecycle
            .transition(self.task.id, TaskStatus::Completed, fields)
            .map_err(terminal_write_error)
    }

    pub(crate) fn finalize_training(
        &self,
        fields: TransitionFields,
        model: NewModel,
    ) -> std::result::Result<(Task, Model), Abort> {
        self.ensure_not_cancelled(Stage::Finalize)?;
        self.runner
            .lifecycle
            .complete_training(self.task.id, fields, model)
            .map_err(terminal_write_error)
    }

    fn discard_artifacts(&mut self) {
        for path in self.written.drain(..) {
            if let Err(e) = remove_if_present(&path) {
                warn!(task_id = %self.task.id, path = %path.display(), error = %e, "no se pudo borrar artifact de run abortado");
            }
        }
    }

    fn remove_scratch(&mut self) {
        for dir in self.scratch.drain(..) {
            let _ = fs::remove_dir_all(&dir);
        }
    }
}

/// Una escritura terminal rechazada porque la task ya está cancelada es una
/// cancelación, no un error.
fn terminal_write_error(err: Error) -> Abort {
    match err {
        Error::InvalidTransition {
            from: TaskStatus::Cancelled,
            ..
        } => Abort::Cancelled(Stage::Finalize),
        other => Abort::Internal(other),
    }
}
