use thiserror::Error;

use crate::ids::TaskId;
use crate::pipeline::Stage;
use crate::registry::RegistryError;
use crate::task::TaskStatus;

/// Errores de la librería. Las llamadas a colaboradores (datos, forecasters)
/// devuelven `anyhow::Result` y su causa viaja dentro de `StageFailure`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task {0} is already queued or running")]
    DuplicateDispatch(TaskId),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("stage {stage} failed: {cause:#}")]
    StageFailure {
        stage: Stage,
        #[source]
        cause: anyhow::Error,
    },

    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("progress regression for task {id}: {requested} < {current}")]
    ProgressRegression {
        id: TaskId,
        current: f64,
        requested: f64,
    },

    #[error(transparent)]
    Registry(RegistryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<u64>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Missing { entity, id } => Error::NotFound { entity, id },
            other => Error::Registry(other),
        }
    }
}
