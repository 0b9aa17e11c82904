//! Backends de forecasting detrás de un trait común. La fábrica elige la
//! variante según `ModelType`.

pub mod generative;
pub mod metrics;
pub mod recurrent;

use anyhow::{bail, Context};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::Windows;
use crate::job::{DataType, ModelType, TrainingConfig};
use crate::task::Metrics;

pub use generative::{DriftGenerator, GenerativeForecaster, TextGenerator};
pub use recurrent::RecurrentForecaster;

#[derive(Debug, Clone)]
pub struct ForecasterConfig {
    pub data_type: DataType,
    /// Donde el backend deja su artifact antes de que el runner lo mueva.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyperparams {
    pub sequence_length: usize,
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: usize,
}

impl From<&TrainingConfig> for Hyperparams {
    fn from(cfg: &TrainingConfig) -> Self {
        Self {
            sequence_length: cfg.sequence_length,
            epochs: cfg.epochs,
            learning_rate: cfg.learning_rate,
            batch_size: cfg.batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f64,
    pub validation: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            validation: 0.15,
        }
    }
}

/// Ventanas partidas en orden temporal (sin mezclar).
#[derive(Debug, Clone, Default)]
pub struct TrainingData {
    pub train: Windows,
    pub validation: Windows,
    pub test: Windows,
}

impl TrainingData {
    pub fn split(windows: Windows, ratios: SplitRatios) -> anyhow::Result<Self> {
        let n = windows.len();
        let n_train = (n as f64 * ratios.train) as usize;
        let n_val = (n as f64 * ratios.validation) as usize;
        if n_train == 0 {
            bail!("{n} windows are not enough for a training split");
        }

        let Windows {
            mut inputs,
            mut targets,
        } = windows;
        let test = Windows {
            inputs: inputs.split_off(n_train + n_val),
            targets: targets.split_off(n_train + n_val),
        };
        let validation = Windows {
            inputs: inputs.split_off(n_train),
            targets: targets.split_off(n_train),
        };
        Ok(Self {
            train: Windows { inputs, targets },
            validation,
            test,
        })
    }

    /// Conjunto para métricas: validación si hay, si no train.
    pub fn evaluation_set(&self) -> &Windows {
        if self.validation.is_empty() {
            &self.train
        } else {
            &self.validation
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub artifact_path: PathBuf,
    pub metrics: Metrics,
    pub epochs_run: u32,
}

/// Modelo cargado, listo para predecir.
pub trait Predictor: Send + Sync {
    fn sequence_length(&self) -> usize;
    /// Usa la cola de `sequence` que coincide con su largo.
    fn predict(&self, sequence: &[f64]) -> anyhow::Result<f64>;
}

pub trait Forecaster: Send {
    fn model_type(&self) -> ModelType;
    fn prepare(&mut self, config: &ForecasterConfig) -> anyhow::Result<()>;
    /// `on_epoch(epoch, total)` se llama al cerrar cada época.
    fn train(
        &self,
        data: &TrainingData,
        hyper: &Hyperparams,
        on_epoch: &mut dyn FnMut(u32, u32),
    ) -> anyhow::Result<TrainOutcome>;
    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn Predictor>>;

    fn predict(&self, handle: &dyn Predictor, sequence: &[f64]) -> anyhow::Result<f64> {
        handle.predict(sequence)
    }
}

pub trait ForecasterFactory: Send + Sync {
    fn create(&self, model_type: ModelType) -> Box<dyn Forecaster>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinForecasters;

impl ForecasterFactory for BuiltinForecasters {
    fn create(&self, model_type: ModelType) -> Box<dyn Forecaster> {
        match model_type {
            ModelType::Recurrent => Box::new(RecurrentForecaster::default()),
            ModelType::Generative => Box::new(GenerativeForecaster::default()),
        }
    }
}

pub(crate) fn trailing(sequence: &[f64], len: usize) -> anyhow::Result<&[f64]> {
    if sequence.len() < len {
        bail!(
            "input has {} values, model needs at least {len}",
            sequence.len()
        );
    }
    Ok(&sequence[sequence.len() - len..])
}

pub(crate) fn evaluate_windows(predictor: &dyn Predictor, windows: &Windows) -> anyhow::Result<Metrics> {
    let predictions = windows
        .inputs
        .iter()
        .map(|input| predictor.predict(input))
        .collect::<anyhow::Result<Vec<f64>>>()?;
    metrics::evaluate(&predictions, &windows.targets)
}

pub(crate) fn write_artifact<T: Serialize>(path: &Path, artifact: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(artifact)?;
    fs::write(path, body).with_context(|| format!("write {}", path.display()))
}

pub(crate) fn read_artifact<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read(path).with_context(|| format!("read model artifact {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse model artifact {}", path.display()))
}
