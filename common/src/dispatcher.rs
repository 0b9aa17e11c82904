//! Cola FIFO + pool acotado de workers. Un task id tiene a lo sumo un job
//! encolado o corriendo; si el worker muere (panic) el job se reentrega
//! hasta `max_deliveries` veces.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ids::TaskId;
use crate::job::TaskParameters;
use crate::pipeline::{PipelineRunner, RunOutcome};

pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_DELIVERIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub concurrency: usize,
    pub max_deliveries: u32,
    /// Cada cuánto se revisa la cola aunque nadie avise.
    pub idle_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            idle_poll: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: TaskId,
    pub spec: TaskParameters,
    /// 1 en la primera entrega.
    pub delivery: u32,
}

#[derive(Debug, Clone)]
enum Ownership {
    Queued,
    Running { delivery_id: Uuid, since: Instant },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub queued: usize,
    pub running: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub skipped: u64,
    pub redelivered: u64,
}

#[derive(Default)]
struct Shared {
    // orden de locks: owned -> queue
    owned: Mutex<HashMap<TaskId, Ownership>>,
    queue: Mutex<VecDeque<Job>>,
    counters: Mutex<DispatcherStats>,
    notify: Notify,
}

/// Las secciones críticas son cortas y no dejan estado a medias, así que un
/// lock envenenado se sigue usando.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn submit(&self, task_id: TaskId, spec: TaskParameters) -> Result<()> {
        {
            let mut owned = lock(&self.shared.owned);
            if owned.contains_key(&task_id) {
                return Err(Error::DuplicateDispatch(task_id));
            }
            owned.insert(task_id, Ownership::Queued);
            lock(&self.shared.queue).push_back(Job {
                task_id,
                spec,
                delivery: 1,
            });
        }
        self.shared.notify.notify_one();
        debug!(task_id = %task_id, "job encolado");
        Ok(())
    }

    /// Saca de la cola un job que todavía no arrancó. Un job ya entregado no
    /// se toca: la cancelación lo corta en el próximo stage.
    pub fn withdraw(&self, task_id: TaskId) -> bool {
        let mut owned = lock(&self.shared.owned);
        if !matches!(owned.get(&task_id), Some(Ownership::Queued)) {
            return false;
        }
        owned.remove(&task_id);
        lock(&self.shared.queue).retain(|job| job.task_id != task_id);
        debug!(task_id = %task_id, "job retirado de la cola");
        true
    }

    pub fn is_owned(&self, task_id: TaskId) -> bool {
        lock(&self.shared.owned).contains_key(&task_id)
    }

    pub fn stats(&self) -> DispatcherStats {
        let mut stats = lock(&self.shared.counters).clone();
        let owned = lock(&self.shared.owned);
        stats.running = owned
            .values()
            .filter(|o| matches!(o, Ownership::Running { .. }))
            .count();
        stats.queued = lock(&self.shared.queue).len();
        stats
    }

    /// Espera a que no quede nada encolado ni corriendo.
    pub async fn wait_idle(&self) {
        while !lock(&self.shared.owned).is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Arranca el loop de despacho en una task de tokio.
    pub fn spawn(&self, runner: Arc<PipelineRunner>) -> DispatcherHandle {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(self.clone().dispatch_loop(runner, rx));
        DispatcherHandle { shutdown: tx, join }
    }

    fn claim_next(&self) -> Option<(Job, Uuid)> {
        let mut owned = lock(&self.shared.owned);
        let job = lock(&self.shared.queue).pop_front()?;
        let delivery_id = Uuid::new_v4();
        owned.insert(
            job.task_id,
            Ownership::Running {
                delivery_id,
                since: Instant::now(),
            },
        );
        Some((job, delivery_id))
    }

    fn release(&self, task_id: TaskId) {
        if let Some(Ownership::Running { delivery_id, since }) =
            lock(&self.shared.owned).remove(&task_id)
        {
            debug!(task_id = %task_id, %delivery_id, elapsed_ms = since.elapsed().as_millis() as u64, "job liberado");
        }
    }

    /// Vuelve a encolar sin soltar la propiedad del task id.
    fn redeliver(&self, job: Job) {
        {
            let mut owned = lock(&self.shared.owned);
            owned.insert(job.task_id, Ownership::Queued);
            lock(&self.shared.queue).push_back(job);
        }
        lock(&self.shared.counters).redelivered += 1;
        self.shared.notify.notify_one();
    }

    fn record(&self, outcome: Option<RunOutcome>) {
        let mut c = lock(&self.shared.counters);
        c.processed += 1;
        match outcome {
            Some(RunOutcome::Completed) => c.succeeded += 1,
            Some(RunOutcome::Failed { .. }) | None => c.failed += 1,
            Some(RunOutcome::Cancelled { .. }) => c.cancelled += 1,
            Some(RunOutcome::Skipped { .. }) => c.skipped += 1,
        }
    }

    async fn dispatch_loop(self, runner: Arc<PipelineRunner>, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        let sem = Arc::new(Semaphore::new(concurrency));
        info!(
            concurrency,
            max_deliveries = self.config.max_deliveries,
            "dispatcher arrancó"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // --------- Control de concurrencia ---------
            let permit = tokio::select! {
                p = sem.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let Some((job, delivery_id)) = self.claim_next() else {
                // no hay jobs: devolvemos el permiso y esperamos aviso
                drop(permit);
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = sleep(self.config.idle_poll) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            };

            let dispatcher = self.clone();
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                dispatcher.execute(runner, job, delivery_id).await;
                // liberar el slot al terminar
                drop(permit);
            });
        }

        // esperar a los jobs que ya estaban corriendo
        let _ = sem.acquire_many(concurrency as u32).await;
        let left = lock(&self.shared.queue).len();
        info!(queued = left, "dispatcher detenido");
    }

    async fn execute(&self, runner: Arc<PipelineRunner>, job: Job, delivery_id: Uuid) {
        let task_id = job.task_id;
        info!(task_id = %task_id, delivery = job.delivery, %delivery_id, "job entregado a un worker");

        let handle = tokio::task::spawn_blocking({
            let runner = Arc::clone(&runner);
            let spec = job.spec.clone();
            move || runner.run(task_id, &spec)
        });

        match handle.await {
            Ok(Ok(outcome)) => {
                info!(task_id = %task_id, ?outcome, "job terminado");
                self.record(Some(outcome));
                self.release(task_id);
            }
            Ok(Err(e)) => {
                error!(task_id = %task_id, error = %e, "error interno ejecutando el job");
                if let Err(e) = runner.abandon(task_id, &format!("internal error: {e}")) {
                    error!(task_id = %task_id, error = %e, "no se pudo marcar la task como failed");
                }
                self.record(None);
                self.release(task_id);
            }
            Err(join_err) => {
                warn!(task_id = %task_id, delivery = job.delivery, error = %join_err, "el worker murió durante el job");
                if job.delivery < self.config.max_deliveries {
                    self.redeliver(Job {
                        delivery: job.delivery + 1,
                        ..job
                    });
                } else {
                    let reason = format!(
                        "worker died during execution ({} deliveries)",
                        job.delivery
                    );
                    if let Err(e) = runner.abandon(task_id, &reason) {
                        error!(task_id = %task_id, error = %e, "no se pudo marcar la task como failed");
                    }
                    self.record(None);
                    self.release(task_id);
                }
            }
        }
    }
}

pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Deja de tomar jobs y espera a los que están corriendo. Lo encolado
    /// queda pendiente.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!("el loop del dispatcher terminó mal: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NewDataset;
    use crate::data::{CsvDataPreparation, DataPreparation};
    use crate::forecast::{BuiltinForecasters, Forecaster, ForecasterFactory};
    use crate::ids::{DatasetId, ModelId};
    use crate::job::{DataType, ModelType, TaskSpec, TrainingConfig};
    use crate::lifecycle::LifecycleController;
    use crate::registry::{InMemoryRegistry, Registry};
    use crate::results::ArtifactLayout;
    use crate::task::TaskStatus;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("dispatcher_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn config(concurrency: usize, max_deliveries: u32) -> DispatcherConfig {
        DispatcherConfig {
            concurrency,
            max_deliveries,
            idle_poll: Duration::from_millis(20),
        }
    }

    fn prediction_params(model: u64) -> TaskParameters {
        TaskParameters::Prediction {
            model_id: ModelId(model),
            input_sequence: vec![1.0; 10],
        }
    }

    struct Harness {
        lifecycle: Arc<LifecycleController>,
        runner: Arc<PipelineRunner>,
        dataset: (DatasetId, String),
    }

    fn harness(sub: &str, factory: Arc<dyn ForecasterFactory>) -> Harness {
        let dir = temp_dir(sub);
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let lifecycle = Arc::new(LifecycleController::new(Arc::clone(&registry)));

        let path = dir.join("weather.csv");
        let table = CsvDataPreparation
            .generate_sample(DataType::Weather, 150, &path)
            .unwrap();
        let dataset = registry
            .insert_dataset(NewDataset {
                name: "weather.csv".into(),
                data_type: DataType::Weather,
                file_path: path.display().to_string(),
                file_size: 0,
                analysis: CsvDataPreparation.analyze(&table),
            })
            .unwrap();

        let runner = Arc::new(PipelineRunner::new(
            Arc::clone(&lifecycle),
            Arc::new(CsvDataPreparation),
            factory,
            ArtifactLayout::new(&dir),
        ));
        Harness {
            lifecycle,
            runner,
            dataset: (dataset.id, dataset.file_path),
        }
    }

    impl Harness {
        fn prediction(&self) -> (TaskId, TaskParameters) {
            let params = prediction_params(999);
            let id = self
                .lifecycle
                .create(TaskSpec {
                    kind: "prediction".into(),
                    data_type: "weather".into(),
                    model_type: Some("recurrent".into()),
                    parameters: params.clone(),
                    data_file_path: None,
                })
                .unwrap();
            (id, params)
        }

        fn training(&self) -> (TaskId, TaskParameters) {
            let params = TaskParameters::Training {
                dataset_id: self.dataset.0,
                model_config: TrainingConfig {
                    epochs: 1,
                    ..TrainingConfig::default()
                },
            };
            let id = self
                .lifecycle
                .create(TaskSpec {
                    kind: "training".into(),
                    data_type: "weather".into(),
                    model_type: Some("recurrent".into()),
                    parameters: params.clone(),
                    data_file_path: Some(self.dataset.1.clone()),
                })
                .unwrap();
            (id, params)
        }
    }

    /// Hace panic en las primeras `panics` creaciones de backend.
    struct PanickingFactory {
        panics: AtomicU32,
    }

    impl ForecasterFactory for PanickingFactory {
        fn create(&self, model_type: ModelType) -> Box<dyn Forecaster> {
            let left = self.panics.load(Ordering::SeqCst);
            if left > 0 {
                self.panics.store(left - 1, Ordering::SeqCst);
                panic!("backend se cayó");
            }
            BuiltinForecasters.create(model_type)
        }
    }

    /// Bloquea la creación del backend hasta recibir una señal.
    struct GatedFactory {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl ForecasterFactory for GatedFactory {
        fn create(&self, model_type: ModelType) -> Box<dyn Forecaster> {
            let _ = self.gate.lock().unwrap().recv();
            BuiltinForecasters.create(model_type)
        }
    }

    #[test]
    fn submit_duplicado_se_rechaza() {
        let d = Dispatcher::new(config(1, 3));
        d.submit(TaskId(1), prediction_params(1)).unwrap();
        assert!(matches!(
            d.submit(TaskId(1), prediction_params(1)),
            Err(Error::DuplicateDispatch(TaskId(1)))
        ));
        d.submit(TaskId(2), prediction_params(1)).unwrap();
        assert_eq!(d.stats().queued, 2);
    }

    #[test]
    fn withdraw_libera_el_id() {
        let d = Dispatcher::new(config(1, 3));
        d.submit(TaskId(1), prediction_params(1)).unwrap();
        assert!(d.withdraw(TaskId(1)));
        assert!(!d.is_owned(TaskId(1)));
        assert_eq!(d.stats().queued, 0);
        assert!(!d.withdraw(TaskId(1)));
        d.submit(TaskId(1), prediction_params(1)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn procesa_todo_lo_encolado() {
        let h = harness("drain", Arc::new(BuiltinForecasters));
        let d = Dispatcher::new(config(3, 3));
        let ids: Vec<TaskId> = (0..6)
            .map(|_| {
                let (id, params) = h.prediction();
                d.submit(id, params).unwrap();
                id
            })
            .collect();

        let handle = d.spawn(Arc::clone(&h.runner));
        d.wait_idle().await;
        handle.shutdown().await;

        // el model 999 no existe: todas fallan en load_model
        for id in ids {
            assert_eq!(h.lifecycle.status(id).unwrap(), TaskStatus::Failed);
        }
        let stats = d.stats();
        assert_eq!(stats.processed, 6);
        assert_eq!(stats.failed, 6);
        assert_eq!(stats.queued + stats.running, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mientras_corre_no_se_puede_reenviar() {
        let (tx, rx) = mpsc::channel();
        let h = harness(
            "single_flight",
            Arc::new(GatedFactory {
                gate: Mutex::new(rx),
            }),
        );
        let d = Dispatcher::new(config(2, 3));
        let (id, params) = h.training();
        d.submit(id, params.clone()).unwrap();
        let handle = d.spawn(Arc::clone(&h.runner));

        while d.stats().running == 0 {
            sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(
            d.submit(id, params),
            Err(Error::DuplicateDispatch(_))
        ));

        tx.send(()).unwrap();
        d.wait_idle().await;
        handle.shutdown().await;
        assert_eq!(h.lifecycle.status(id).unwrap(), TaskStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panic_se_reentrega_hasta_completar() {
        let h = harness(
            "redeliver",
            Arc::new(PanickingFactory {
                panics: AtomicU32::new(2),
            }),
        );
        let d = Dispatcher::new(config(1, 3));
        let (id, params) = h.training();
        d.submit(id, params).unwrap();

        let handle = d.spawn(Arc::clone(&h.runner));
        d.wait_idle().await;
        handle.shutdown().await;

        let task = h.lifecycle.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let stats = d.stats();
        assert_eq!(stats.redelivered, 2);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sin_entregas_restantes_queda_failed() {
        let h = harness(
            "exhausted",
            Arc::new(PanickingFactory {
                panics: AtomicU32::new(10),
            }),
        );
        let d = Dispatcher::new(config(1, 2));
        let (id, params) = h.training();
        d.submit(id, params).unwrap();

        let handle = d.spawn(Arc::clone(&h.runner));
        d.wait_idle().await;
        handle.shutdown().await;

        let task = h.lifecycle.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("worker died"));
        assert_eq!(d.stats().redelivered, 1);
        assert!(!d.is_owned(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_deja_lo_encolado_pendiente() {
        let h = harness("shutdown", Arc::new(BuiltinForecasters));
        let d = Dispatcher::new(config(1, 3));
        let handle = d.spawn(Arc::clone(&h.runner));
        handle.shutdown().await;

        let (id, params) = h.prediction();
        d.submit(id, params).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.lifecycle.status(id).unwrap(), TaskStatus::Pending);
        assert_eq!(d.stats().queued, 1);
    }
}
