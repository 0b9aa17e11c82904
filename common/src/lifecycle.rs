//! Máquina de estados de las tasks. Es el único componente que escribe
//! `status`, `progress` y los timestamps de una task.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{Model, NewModel};
use crate::error::{Error, Result};
use crate::ids::TaskId;
use crate::job::{DataType, ModelType, TaskKind, TaskParameters, TaskSpec};
use crate::registry::{Registry, RegistryError};
use crate::task::{Metrics, NewTask, Task, TaskStatus};

/// Reintentos ante conflicto de versión antes de rendirse.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Campos opcionales que acompañan a una transición.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub progress: Option<f64>,
    pub error_message: Option<String>,
    pub metrics: Option<Metrics>,
    pub model_file_path: Option<String>,
    pub result_file_path: Option<String>,
}

impl TransitionFields {
    pub fn progress(value: f64) -> Self {
        Self {
            progress: Some(value),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    fn is_progress_only(&self) -> bool {
        self.progress.is_some()
            && self.error_message.is_none()
            && self.metrics.is_none()
            && self.model_file_path.is_none()
            && self.result_file_path.is_none()
    }
}

pub struct LifecycleController {
    registry: Arc<dyn Registry>,
}

impl LifecycleController {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Valida el `TaskSpec` contra los tipos soportados y persiste la task en
    /// `pending`. Si falla la validación el registry no se toca.
    pub fn create(&self, spec: TaskSpec) -> Result<TaskId> {
        let new_task = validate_spec(spec)?;
        let task = self.registry.insert_task(new_task)?;
        info!(task_id = %task.id, kind = %task.kind, "task creada");
        Ok(task.id)
    }

    pub fn get(&self, id: TaskId) -> Result<Task> {
        self.registry
            .get_task(id)?
            .ok_or_else(|| Error::not_found("task", id))
    }

    /// Lectura puntual del estado (el runner la usa antes de cada stage).
    pub fn status(&self, id: TaskId) -> Result<TaskStatus> {
        Ok(self.get(id)?.status)
    }

    pub fn transition(&self, id: TaskId, to: TaskStatus, fields: TransitionFields) -> Result<Task> {
        let task = self.mutate(id, |task| apply_transition(task, to, &fields))?;
        debug!(task_id = %id, status = %task.status, progress = task.progress, "transición");
        Ok(task)
    }

    /// Sólo con la task en `running`; nunca hacia atrás. Un valor igual al
    /// guardado no escribe nada.
    pub fn record_progress(&self, id: TaskId, value: f64) -> Result<Task> {
        validate_progress(value)?;
        let current = self.get(id)?;
        if current.status == TaskStatus::Running && current.progress == value {
            return Ok(current);
        }
        self.mutate(id, |task| {
            if task.status != TaskStatus::Running {
                return Err(Error::InvalidTransition {
                    id,
                    from: task.status,
                    to: TaskStatus::Running,
                });
            }
            check_regression(task, value)?;
            task.progress = value;
            Ok(())
        })
    }

    pub fn cancel(&self, id: TaskId) -> Result<Task> {
        let task = self.transition(id, TaskStatus::Cancelled, TransitionFields::default())?;
        info!(task_id = %id, "task cancelada");
        Ok(task)
    }

    /// `running -> completed` más el alta del Model, en una sola escritura.
    pub fn complete_training(
        &self,
        id: TaskId,
        fields: TransitionFields,
        model: NewModel,
    ) -> Result<(Task, Model)> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut next = self.get(id)?;
            if next.kind != TaskKind::Training {
                return Err(Error::validation(format!(
                    "task {id} is a {} task and cannot register a model",
                    next.kind
                )));
            }
            apply_transition(&mut next, TaskStatus::Completed, &fields)?;
            match self
                .registry
                .replace_task_and_insert_model(next, model.clone())
            {
                Ok((task, model)) => {
                    info!(task_id = %id, model_id = %model.id, "training completado, model registrado");
                    return Ok((task, model));
                }
                Err(RegistryError::VersionConflict { .. }) => {
                    debug!(task_id = %id, attempt, "conflicto de versión, reintento");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(too_contended(id))
    }

    /// Lee, aplica `apply` a una copia y la escribe con CAS. Ante conflicto
    /// vuelve a leer y a validar.
    fn mutate<F>(&self, id: TaskId, mut apply: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<()>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut next = self.get(id)?;
            apply(&mut next)?;
            match self.registry.replace_task(next) {
                Ok(stored) => return Ok(stored),
                Err(RegistryError::VersionConflict { .. }) => {
                    debug!(task_id = %id, attempt, "conflicto de versión, reintento");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(too_contended(id))
    }
}

fn too_contended(id: TaskId) -> Error {
    warn!(task_id = %id, "demasiados escritores concurrentes");
    Error::Registry(RegistryError::Storage(format!(
        "task {id}: gave up after {MAX_CAS_ATTEMPTS} version conflicts"
    )))
}

fn validate_spec(spec: TaskSpec) -> Result<NewTask> {
    let kind: TaskKind = spec.kind.parse()?;
    if spec.parameters.kind() != kind {
        return Err(Error::validation(format!(
            "parameters are for a {} task, not {kind}",
            spec.parameters.kind()
        )));
    }
    let data_type: DataType = spec.data_type.parse()?;
    let model_type = match (kind, spec.model_type.as_deref()) {
        (TaskKind::Comparison, None) => None,
        (TaskKind::Comparison, Some(raw)) if raw.trim().eq_ignore_ascii_case("comparison") => None,
        (TaskKind::Comparison, Some(raw)) => {
            return Err(Error::validation(format!(
                "comparison tasks carry no model type, got '{raw}'"
            )))
        }
        (_, Some(raw)) => Some(raw.parse::<ModelType>()?),
        (_, None) => return Err(Error::validation(format!("{kind} tasks need a model type"))),
    };
    if let TaskParameters::Training { model_config, .. } = &spec.parameters {
        model_config.validate()?;
    }
    if let TaskParameters::Prediction { input_sequence, .. } = &spec.parameters {
        if input_sequence.is_empty() || input_sequence.iter().any(|v| !v.is_finite()) {
            return Err(Error::validation(
                "input_sequence must be a non-empty list of finite numbers",
            ));
        }
    }

    Ok(NewTask {
        kind,
        data_type,
        model_type,
        parameters: spec.parameters,
        data_file_path: spec.data_file_path,
        created_at: Utc::now(),
    })
}

fn validate_progress(value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(Error::validation(format!(
            "progress must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn check_regression(task: &Task, value: f64) -> Result<()> {
    if value < task.progress {
        return Err(Error::ProgressRegression {
            id: task.id,
            current: task.progress,
            requested: value,
        });
    }
    Ok(())
}

/// El reloj de pared puede ir para atrás; los timestamps no.
fn not_before(now: DateTime<Utc>, floor: DateTime<Utc>) -> DateTime<Utc> {
    now.max(floor)
}

fn apply_transition(task: &mut Task, to: TaskStatus, fields: &TransitionFields) -> Result<()> {
    let from = task.status;
    let invalid = || Error::InvalidTransition {
        id: task.id,
        from,
        to,
    };
    if !from.can_transition_to(to) {
        return Err(invalid());
    }
    if from == TaskStatus::Running && to == TaskStatus::Running && !fields.is_progress_only() {
        return Err(invalid());
    }
    if let Some(value) = fields.progress {
        validate_progress(value)?;
        check_regression(task, value)?;
    }
    if to == TaskStatus::Completed {
        check_artifacts(task, fields)?;
    }

    let now = Utc::now();
    let started_floor = task.started_at.unwrap_or(task.created_at);
    match to {
        TaskStatus::Running => {
            if from == TaskStatus::Pending {
                task.started_at = Some(not_before(now, task.created_at));
            }
            if let Some(value) = fields.progress {
                task.progress = value;
            }
        }
        TaskStatus::Completed => {
            task.progress = 1.0;
            task.completed_at = Some(not_before(now, started_floor));
            if let Some(metrics) = fields.metrics {
                task.set_metrics(metrics);
            }
            task.model_file_path = fields.model_file_path.clone();
            task.result_file_path = fields.result_file_path.clone();
        }
        TaskStatus::Failed => {
            task.completed_at = Some(not_before(now, started_floor));
            if let Some(value) = fields.progress {
                task.progress = value;
            }
            task.error_message = fields.error_message.clone();
        }
        TaskStatus::Cancelled => {
            task.completed_at = Some(not_before(now, started_floor));
        }
        TaskStatus::Pending => {}
    }
    task.status = to;
    Ok(())
}

/// Training deja un model artifact; prediction y comparison un result artifact.
fn check_artifacts(task: &Task, fields: &TransitionFields) -> Result<()> {
    let ok = match task.kind {
        TaskKind::Training => fields.model_file_path.is_some() && fields.result_file_path.is_none(),
        TaskKind::Prediction | TaskKind::Comparison => {
            fields.result_file_path.is_some() && fields.model_file_path.is_none()
        }
    };
    if !ok {
        return Err(Error::validation(format!(
            "a completed {} task must carry exactly its own artifact path",
            task.kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{DatasetId, ModelId};
    use crate::job::TrainingConfig;
    use crate::catalog::{Dataset, NewDataset};
    use crate::data::TableAnalysis;
    use crate::registry::{InMemoryRegistry, RegistryCounts};
    use crate::task::{PageRequest, TaskFilter, TaskPage};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn controller() -> LifecycleController {
        LifecycleController::new(Arc::new(InMemoryRegistry::new()))
    }

    fn prediction_spec() -> TaskSpec {
        TaskSpec {
            kind: "prediction".into(),
            data_type: "weather".into(),
            model_type: Some("lstm".into()),
            parameters: TaskParameters::Prediction {
                model_id: ModelId(1),
                input_sequence: vec![1.0, 2.0, 3.0],
            },
            data_file_path: None,
        }
    }

    fn training_spec() -> TaskSpec {
        TaskSpec {
            kind: "training".into(),
            data_type: "traffic".into(),
            model_type: Some("recurrent".into()),
            parameters: TaskParameters::Training {
                dataset_id: DatasetId(1),
                model_config: TrainingConfig::default(),
            },
            data_file_path: Some("/tmp/traffic.csv".into()),
        }
    }

    fn snapshot(lc: &LifecycleController, id: TaskId) -> Vec<u8> {
        serde_json::to_vec(&lc.get(id).unwrap()).unwrap()
    }

    #[test]
    fn create_deja_la_task_en_pending() {
        let lc = controller();
        let id = lc.create(prediction_spec()).unwrap();
        let task = lc.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.model_type, Some(ModelType::Recurrent));
        assert!(task.started_at.is_none() && task.completed_at.is_none());
        assert!(task.model_file_path.is_none() && task.result_file_path.is_none());
    }

    #[test]
    fn create_invalido_no_toca_el_registry() {
        let lc = controller();
        let mut spec = prediction_spec();
        spec.data_type = "solar".into();
        assert!(matches!(lc.create(spec), Err(Error::Validation(_))));

        let mut spec = prediction_spec();
        spec.kind = "training".into();
        assert!(matches!(lc.create(spec), Err(Error::Validation(_))));

        let mut spec = prediction_spec();
        spec.model_type = None;
        assert!(matches!(lc.create(spec), Err(Error::Validation(_))));

        assert_eq!(lc.registry().counts().unwrap().total_tasks, 0);
    }

    #[test]
    fn transiciones_fuera_del_grafo_no_cambian_nada() {
        let lc = controller();
        let id = lc.create(prediction_spec()).unwrap();
        let before = snapshot(&lc, id);

        for to in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Pending] {
            let err = lc.transition(id, to, TransitionFields::default()).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }), "{to}");
        }
        assert_eq!(snapshot(&lc, id), before);
    }

    #[test]
    fn timestamps_los_pone_el_controller() {
        let lc = controller();
        let id = lc.create(prediction_spec()).unwrap();
        let running = lc
            .transition(id, TaskStatus::Running, TransitionFields::default())
            .unwrap();
        let started = running.started_at.unwrap();
        assert!(running.created_at <= started);

        let done = lc
            .transition(
                id,
                TaskStatus::Completed,
                TransitionFields {
                    result_file_path: Some("/tmp/r.json".into()),
                    ..TransitionFields::default()
                },
            )
            .unwrap();
        assert_eq!(done.progress, 1.0);
        assert!(started <= done.completed_at.unwrap());
        assert_eq!(done.result_file_path.as_deref(), Some("/tmp/r.json"));
    }

    #[test]
    fn running_a_running_solo_acepta_progreso() {
        let lc = controller();
        let id = lc.create(prediction_spec()).unwrap();
        lc.transition(id, TaskStatus::Running, TransitionFields::default())
            .unwrap();

        let ok = lc
            .transition(id, TaskStatus::Running, TransitionFields::progress(0.4))
            .unwrap();
        assert_eq!(ok.progress, 0.4);

        let err = lc
            .transition(id, TaskStatus::Running, TransitionFields::failure("x"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn completed_exige_el_artifact_correcto() {
        let lc = controller();
        let id = lc.create(prediction_spec()).unwrap();
        lc.transition(id, TaskStatus::Running, TransitionFields::default())
            .unwrap();
        let err = lc
            .transition(
                id,
                TaskStatus::Completed,
                TransitionFields {
                    model_file_path: Some("/tmp/m.json".into()),
                    ..TransitionFields::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(lc.status(id).unwrap(), TaskStatus::Running);
    }

    #[test]
    fn progreso_rechaza_regresion_y_valores_fuera_de_rango() {
        let lc = controller();
        let id = lc.create(prediction_spec()).unwrap();
        assert!(matches!(
            lc.record_progress(id, 0.2),
            Err(Error::InvalidTransition { .. })
        ));

        lc.transition(id, TaskStatus::Running, TransitionFields::default())
            .unwrap();
        lc.record_progress(id, 0.5).unwrap();
        assert!(matches!(
            lc.record_progress(id, 0.3),
            Err(Error::ProgressRegression { .. })
        ));
        assert!(matches!(lc.record_progress(id, 1.5), Err(Error::Validation(_))));
        assert!(matches!(
            lc.record_progress(id, f64::NAN),
            Err(Error::Validation(_))
        ));
        assert_eq!(lc.get(id).unwrap().progress, 0.5);
    }

    #[test]
    fn cancel_en_pending_es_final() {
        let lc = controller();
        let id = lc.create(prediction_spec()).unwrap();
        let task = lc.cancel(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completed_at.is_some());

        for to in TaskStatus::ALL {
            assert!(lc.transition(id, to, TransitionFields::default()).is_err());
        }
        assert!(matches!(lc.cancel(id), Err(Error::InvalidTransition { .. })));
        assert!(matches!(
            lc.record_progress(id, 0.5),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn complete_training_registra_model_una_vez() {
        let lc = controller();
        let id = lc.create(training_spec()).unwrap();
        lc.transition(id, TaskStatus::Running, TransitionFields::default())
            .unwrap();

        let model = NewModel {
            model_type: ModelType::Recurrent,
            data_type: DataType::Traffic,
            model_path: "/tmp/m.json".into(),
            training_task_id: id,
            training_parameters: TrainingConfig::default(),
            validation: Metrics {
                mse: 1.0,
                mae: 0.5,
                rmse: 1.0,
            },
        };
        let fields = TransitionFields {
            metrics: Some(model.validation),
            model_file_path: Some(model.model_path.clone()),
            ..TransitionFields::default()
        };
        let (task, registered) = lc.complete_training(id, fields.clone(), model.clone()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.mse, Some(1.0));
        assert_eq!(registered.training_task_id, id);

        // segundo intento: transición inválida y ningún model nuevo
        assert!(lc.complete_training(id, fields, model).is_err());
        assert_eq!(lc.registry().list_models(false).unwrap().len(), 1);
    }

    type RegistryResult<T> = std::result::Result<T, RegistryError>;

    /// Registry que, armado, cancela la task por debajo justo antes de
    /// reenviar la siguiente escritura. Esa escritura llega con versión vieja.
    struct CancelsBeforeWrite {
        inner: InMemoryRegistry,
        armed: AtomicBool,
    }

    impl CancelsBeforeWrite {
        fn new() -> Self {
            Self { inner: InMemoryRegistry::new(), armed: AtomicBool::new(false) }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        fn cancel_underneath(&self, id: TaskId) -> RegistryResult<()> {
            if !self.armed.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            let mut task = self
                .inner
                .get_task(id)?
                .ok_or(RegistryError::Missing { entity: "task", id: id.0 })?;
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            self.inner.replace_task(task)?;
            Ok(())
        }
    }

    impl Registry for CancelsBeforeWrite {
        fn insert_task(&self, task: NewTask) -> RegistryResult<Task> {
            self.inner.insert_task(task)
        }
        fn get_task(&self, id: TaskId) -> RegistryResult<Option<Task>> {
            self.inner.get_task(id)
        }
        fn replace_task(&self, task: Task) -> RegistryResult<Task> {
            self.cancel_underneath(task.id)?;
            self.inner.replace_task(task)
        }
        fn replace_task_and_insert_model(
            &self,
            task: Task,
            model: NewModel,
        ) -> RegistryResult<(Task, Model)> {
            self.cancel_underneath(task.id)?;
            self.inner.replace_task_and_insert_model(task, model)
        }
        fn delete_task(&self, id: TaskId) -> RegistryResult<bool> {
            self.inner.delete_task(id)
        }
        fn list_tasks(&self, filter: &TaskFilter, page: PageRequest) -> RegistryResult<TaskPage> {
            self.inner.list_tasks(filter, page)
        }
        fn tasks_with_status(&self, statuses: &[TaskStatus]) -> RegistryResult<Vec<Task>> {
            self.inner.tasks_with_status(statuses)
        }
        fn expired_tasks(
            &self,
            statuses: &[TaskStatus],
            cutoff: DateTime<Utc>,
        ) -> RegistryResult<Vec<Task>> {
            self.inner.expired_tasks(statuses, cutoff)
        }
        fn insert_model(&self, model: NewModel) -> RegistryResult<Model> {
            self.inner.insert_model(model)
        }
        fn get_model(&self, id: ModelId) -> RegistryResult<Option<Model>> {
            self.inner.get_model(id)
        }
        fn list_models(&self, active_only: bool) -> RegistryResult<Vec<Model>> {
            self.inner.list_models(active_only)
        }
        fn set_model_active(&self, id: ModelId, active: bool) -> RegistryResult<Model> {
            self.inner.set_model_active(id, active)
        }
        fn insert_dataset(&self, dataset: NewDataset) -> RegistryResult<Dataset> {
            self.inner.insert_dataset(dataset)
        }
        fn get_dataset(&self, id: DatasetId) -> RegistryResult<Option<Dataset>> {
            self.inner.get_dataset(id)
        }
        fn list_datasets(&self) -> RegistryResult<Vec<Dataset>> {
            self.inner.list_datasets()
        }
        fn cache_dataset_analysis(
            &self,
            id: DatasetId,
            analysis: TableAnalysis,
        ) -> RegistryResult<Dataset> {
            self.inner.cache_dataset_analysis(id, analysis)
        }
        fn counts(&self) -> RegistryResult<RegistryCounts> {
            self.inner.counts()
        }
        fn flush(&self) -> RegistryResult<()> {
            self.inner.flush()
        }
    }

    fn racing_controller() -> (Arc<CancelsBeforeWrite>, LifecycleController) {
        let registry = Arc::new(CancelsBeforeWrite::new());
        let lc = LifecycleController::new(Arc::clone(&registry) as Arc<dyn Registry>);
        (registry, lc)
    }

    #[test]
    fn progreso_contra_cancel_concurrente_relee_y_rechaza() {
        let (registry, lc) = racing_controller();
        let id = lc.create(prediction_spec()).unwrap();
        lc.transition(id, TaskStatus::Running, TransitionFields::default())
            .unwrap();

        registry.arm();
        let err = lc.record_progress(id, 0.5).unwrap_err();
        assert!(
            matches!(
                err,
                Error::InvalidTransition { from: TaskStatus::Cancelled, to: TaskStatus::Running, .. }
            ),
            "{err:?}"
        );
        let task = lc.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.progress, 0.0);
    }

    #[test]
    fn complete_training_contra_cancel_no_registra_model() {
        let (registry, lc) = racing_controller();
        let id = lc.create(training_spec()).unwrap();
        lc.transition(id, TaskStatus::Running, TransitionFields::default())
            .unwrap();

        let model = NewModel {
            model_type: ModelType::Recurrent,
            data_type: DataType::Traffic,
            model_path: "/tmp/m.json".into(),
            training_task_id: id,
            training_parameters: TrainingConfig::default(),
            validation: Metrics::default(),
        };
        let fields = TransitionFields {
            model_file_path: Some(model.model_path.clone()),
            ..TransitionFields::default()
        };

        registry.arm();
        let err = lc.complete_training(id, fields, model).unwrap_err();
        assert!(
            matches!(err, Error::InvalidTransition { from: TaskStatus::Cancelled, .. }),
            "{err:?}"
        );
        assert_eq!(lc.status(id).unwrap(), TaskStatus::Cancelled);
        assert!(lc.registry().list_models(false).unwrap().is_empty());
        assert!(lc.get(id).unwrap().model_file_path.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        /// Cualquier secuencia de escrituras deja un historial no decreciente.
        #[test]
        fn progreso_nunca_retrocede(values in proptest::collection::vec(0.0f64..=1.0, 1..40)) {
            let lc = controller();
            let id = lc.create(prediction_spec()).unwrap();
            lc.transition(id, TaskStatus::Running, TransitionFields::default()).unwrap();

            let mut seen = vec![0.0];
            for v in values {
                let accepted = lc.record_progress(id, v).is_ok();
                prop_assert_eq!(accepted, v >= *seen.last().unwrap());
                seen.push(lc.get(id).unwrap().progress);
            }
            prop_assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        }

        /// El controller acepta exactamente las aristas del grafo.
        #[test]
        fn tabla_de_transiciones(path in proptest::collection::vec(0usize..5, 1..8)) {
            let lc = controller();
            let id = lc.create(prediction_spec()).unwrap();
            for idx in path {
                let to = TaskStatus::ALL[idx];
                let from = lc.status(id).unwrap();
                let before = snapshot(&lc, id);
                let fields = match to {
                    TaskStatus::Completed => TransitionFields {
                        result_file_path: Some("/tmp/r.json".into()),
                        ..TransitionFields::default()
                    },
                    TaskStatus::Running if from == TaskStatus::Running => TransitionFields::progress(0.5),
                    _ => TransitionFields::default(),
                };
                let result = lc.transition(id, to, fields);
                prop_assert_eq!(result.is_ok(), from.can_transition_to(to));
                if result.is_err() {
                    prop_assert_eq!(snapshot(&lc, id), before);
                }
            }
        }
    }
}
