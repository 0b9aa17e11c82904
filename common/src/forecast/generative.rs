//! Backend "generative": arma un prompt con la ventana, le pide texto a un
//! `TextGenerator` y parsea el número de la respuesta. El entrenamiento sólo
//! calibra el factor de amortiguación de la tendencia.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

use super::{
    evaluate_windows, read_artifact, trailing, write_artifact, Forecaster,
    ForecasterConfig, Hyperparams, Predictor, TrainOutcome, TrainingData,
};
use crate::data::Windows;
use crate::job::{DataType, ModelType};

const ARTIFACT_FILE: &str = "generative_model.json";
/// Ventanas usadas para calibrar en cada época.
const CALIBRATION_WINDOWS: usize = 256;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").expect("valid regex"));

pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Generador de referencia: lee la serie del prompt y extrapola la tendencia
/// media, amortiguada por `damping`.
#[derive(Debug, Clone, Copy)]
pub struct DriftGenerator {
    pub damping: f64,
}

impl TextGenerator for DriftGenerator {
    fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let values = prompt_series(prompt)?;
        let last = *values.last().context("prompt has an empty series")?;
        let drift = if values.len() > 1 {
            (last - values[0]) / (values.len() - 1) as f64
        } else {
            0.0
        };
        Ok(format!("The next value is {:.6}.", last + self.damping * drift))
    }
}

pub fn build_prompt(data_type: DataType, window: &[f64]) -> String {
    let values: Vec<String> = window.iter().map(|v| format!("{v:.6}")).collect();
    format!(
        "Below is an hourly {data_type} time series.\nValues: {}\nPredict the next value.",
        values.join(", ")
    )
}

fn prompt_series(prompt: &str) -> anyhow::Result<Vec<f64>> {
    let line = prompt
        .lines()
        .find_map(|l| l.strip_prefix("Values:"))
        .context("prompt has no 'Values:' line")?;
    NUMBER_RE
        .find_iter(line)
        .map(|m| m.as_str().parse::<f64>().map_err(Into::into))
        .collect()
}

/// Primer número que aparece en la respuesta.
pub fn parse_prediction(text: &str) -> anyhow::Result<f64> {
    let m = NUMBER_RE
        .find(text)
        .with_context(|| format!("no number in generated text '{text}'"))?;
    let value: f64 = m.as_str().parse()?;
    if !value.is_finite() {
        bail!("generated value is not finite");
    }
    Ok(value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerativeArtifact {
    model_type: ModelType,
    data_type: DataType,
    sequence_length: usize,
    damping: f64,
    trained_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct GenerativeForecaster {
    config: Option<ForecasterConfig>,
}

impl Forecaster for GenerativeForecaster {
    fn model_type(&self) -> ModelType {
        ModelType::Generative
    }

    fn prepare(&mut self, config: &ForecasterConfig) -> anyhow::Result<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    /// Cada época prueba un damping de la grilla [0, 1] y se queda con el de
    /// menor MSE sobre train.
    fn train(
        &self,
        data: &TrainingData,
        hyper: &Hyperparams,
        on_epoch: &mut dyn FnMut(u32, u32),
    ) -> anyhow::Result<TrainOutcome> {
        let cfg = self.config.as_ref().context("forecaster not prepared")?;
        if data.train.is_empty() {
            bail!("empty training split");
        }
        let calibration = tail(&data.train, CALIBRATION_WINDOWS);

        let mut best: Option<(f64, f64)> = None;
        for epoch in 1..=hyper.epochs {
            let damping = if hyper.epochs > 1 {
                f64::from(epoch - 1) / f64::from(hyper.epochs - 1)
            } else {
                0.5
            };
            let candidate = GenerativePredictor::new(cfg.data_type, hyper.sequence_length, damping);
            let mse = evaluate_windows(&candidate, &calibration)?.mse;
            debug!(epoch, damping, mse, "generative epoch");
            if best.map_or(true, |(_, best_mse)| mse < best_mse) {
                best = Some((damping, mse));
            }
            on_epoch(epoch, hyper.epochs);
        }
        let (damping, _) = best.context("no epochs run")?;

        let artifact = GenerativeArtifact {
            model_type: ModelType::Generative,
            data_type: cfg.data_type,
            sequence_length: hyper.sequence_length,
            damping,
            trained_at: Utc::now(),
        };
        let predictor = GenerativePredictor::new(cfg.data_type, hyper.sequence_length, damping);
        let metrics = evaluate_windows(&predictor, data.evaluation_set())?;

        let artifact_path = cfg.work_dir.join(ARTIFACT_FILE);
        write_artifact(&artifact_path, &artifact)?;
        Ok(TrainOutcome {
            artifact_path,
            metrics,
            epochs_run: hyper.epochs,
        })
    }

    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn Predictor>> {
        let artifact: GenerativeArtifact = read_artifact(path)?;
        if artifact.model_type != ModelType::Generative {
            bail!("{} is a {} artifact", path.display(), artifact.model_type);
        }
        Ok(Box::new(GenerativePredictor::new(
            artifact.data_type,
            artifact.sequence_length,
            artifact.damping,
        )))
    }
}

struct GenerativePredictor {
    data_type: DataType,
    sequence_length: usize,
    generator: Box<dyn TextGenerator>,
}

impl GenerativePredictor {
    fn new(data_type: DataType, sequence_length: usize, damping: f64) -> Self {
        Self {
            data_type,
            sequence_length,
            generator: Box::new(DriftGenerator { damping }),
        }
    }
}

impl Predictor for GenerativePredictor {
    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn predict(&self, sequence: &[f64]) -> anyhow::Result<f64> {
        let window = trailing(sequence, self.sequence_length)?;
        let prompt = build_prompt(self.data_type, window);
        let text = self.generator.generate(&prompt)?;
        parse_prediction(&text)
    }
}

fn tail(windows: &Windows, max: usize) -> Windows {
    let skip = windows.len().saturating_sub(max);
    Windows {
        inputs: windows.inputs[skip..].to_vec(),
        targets: windows.targets[skip..].to_vec(),
    }
}
