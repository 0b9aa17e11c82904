//! Núcleo de TimeVis: ciclo de vida de tasks de ML (training, prediction,
//! comparison), ejecución por stages, despacho a workers y limpieza.

pub mod catalog;
pub mod config;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod forecast;
pub mod ids;
pub mod job;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;
pub mod results;
pub mod service;
pub mod sweeper;
pub mod task;

/* --------- Re-exports de uso común --------- */

pub use catalog::{Dataset, Model};
pub use config::Settings;
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats};
pub use error::{Error, Result};
pub use ids::{DatasetId, ModelId, TaskId};
pub use job::{DataType, ModelType, TaskKind, TaskParameters, TaskSpec, TrainingConfig};
pub use lifecycle::{LifecycleController, TransitionFields};
pub use pipeline::{PipelineRunner, RunOutcome, Stage};
pub use registry::{InMemoryRegistry, Registry, RegistryCounts, RegistryError};
pub use results::{ArtifactLayout, ResultArtifact};
pub use service::{
    ComparisonRequest, Core, ForecastService, PredictionRequest, ServiceStats, TaskSnapshot,
    TrainingRequest,
};
pub use sweeper::{run_sweep_loop, RetentionSweeper, SweepReport};
pub use task::{Metrics, PageRequest, Task, TaskFilter, TaskPage, TaskStatus};
