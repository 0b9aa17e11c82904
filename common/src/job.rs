use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ids::{DatasetId, ModelId};

pub const MAX_SEQUENCE_LENGTH: usize = 512;
pub const DEFAULT_SEQUENCE_LENGTH: usize = 10;
pub const DEFAULT_EPOCHS: u32 = 10;
pub const DEFAULT_LEARNING_RATE: f64 = 0.01;
pub const DEFAULT_BATCH_SIZE: usize = 8;

/* --------- Tipos soportados --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Training,
    Prediction,
    Comparison,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Training => "training",
            TaskKind::Prediction => "prediction",
            TaskKind::Comparison => "comparison",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "training" => Ok(TaskKind::Training),
            "prediction" => Ok(TaskKind::Prediction),
            "comparison" => Ok(TaskKind::Comparison),
            other => Err(Error::validation(format!("unsupported task kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Weather,
    Electricity,
    Traffic,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::Weather, DataType::Electricity, DataType::Traffic];

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Weather => "weather",
            DataType::Electricity => "electricity",
            DataType::Traffic => "traffic",
        }
    }

    /// Columnas que produce el generador de datos sintéticos.
    pub fn sample_columns(self) -> [&'static str; 3] {
        match self {
            DataType::Weather => ["temperature", "humidity", "pressure"],
            DataType::Electricity => ["load", "voltage", "frequency"],
            DataType::Traffic => ["flow", "speed", "occupancy"],
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weather" => Ok(DataType::Weather),
            "electricity" => Ok(DataType::Electricity),
            "traffic" => Ok(DataType::Traffic),
            other => Err(Error::validation(format!("unsupported data type '{other}'"))),
        }
    }
}

/// Backend de forecasting. `lstm` y `qwen` se aceptan como alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[serde(alias = "lstm")]
    Recurrent,
    #[serde(alias = "qwen")]
    Generative,
}

impl ModelType {
    pub const ALL: [ModelType; 2] = [ModelType::Recurrent, ModelType::Generative];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Recurrent => "recurrent",
            ModelType::Generative => "generative",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recurrent" | "lstm" => Ok(ModelType::Recurrent),
            "generative" | "qwen" => Ok(ModelType::Generative),
            other => Err(Error::validation(format!("unsupported model type '{other}'"))),
        }
    }
}

/* --------- Configuración de entrenamiento --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Si falta se usa la primera columna numérica del dataset.
    #[serde(default)]
    pub target_column: Option<String>,
}

fn default_sequence_length() -> usize {
    DEFAULT_SEQUENCE_LENGTH
}

fn default_epochs() -> u32 {
    DEFAULT_EPOCHS
}

fn default_learning_rate() -> f64 {
    DEFAULT_LEARNING_RATE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
            epochs: DEFAULT_EPOCHS,
            learning_rate: DEFAULT_LEARNING_RATE,
            batch_size: DEFAULT_BATCH_SIZE,
            target_column: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sequence_length == 0 || self.sequence_length > MAX_SEQUENCE_LENGTH {
            return Err(Error::validation(format!(
                "sequence_length must be in 1..={MAX_SEQUENCE_LENGTH}, got {}",
                self.sequence_length
            )));
        }
        if self.epochs == 0 {
            return Err(Error::validation("epochs must be at least 1"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::validation("learning_rate must be a positive number"));
        }
        if self.batch_size == 0 {
            return Err(Error::validation("batch_size must be at least 1"));
        }
        if matches!(&self.target_column, Some(c) if c.trim().is_empty()) {
            return Err(Error::validation("target_column must not be blank"));
        }
        Ok(())
    }
}

/* --------- Snapshot de parámetros por tipo de job --------- */

/// Snapshot inmutable tomado al hacer submit. El tag siempre coincide con el
/// `kind` de la task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParameters {
    Training {
        dataset_id: DatasetId,
        model_config: TrainingConfig,
    },
    Prediction {
        model_id: ModelId,
        input_sequence: Vec<f64>,
    },
    Comparison {
        model_a_id: ModelId,
        model_b_id: ModelId,
        dataset_id: DatasetId,
    },
}

impl TaskParameters {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParameters::Training { .. } => TaskKind::Training,
            TaskParameters::Prediction { .. } => TaskKind::Prediction,
            TaskParameters::Comparison { .. } => TaskKind::Comparison,
        }
    }
}

/// Lo que llega del request layer antes de validar contra los tipos soportados.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: String,
    pub data_type: String,
    #[serde(default)]
    pub model_type: Option<String>,
    pub parameters: TaskParameters,
    #[serde(default)]
    pub data_file_path: Option<String>,
}
