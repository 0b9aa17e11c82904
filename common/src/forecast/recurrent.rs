//! Backend "recurrent": autoregresión lineal sobre la ventana normalizada,
//! entrenada con descenso por gradiente en mini-batches.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::{
    evaluate_windows, read_artifact, trailing, write_artifact, Forecaster, ForecasterConfig,
    Hyperparams, Predictor, TrainOutcome, TrainingData,
};
use crate::job::{DataType, ModelType};

const ARTIFACT_FILE: &str = "recurrent_model.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecurrentArtifact {
    model_type: ModelType,
    data_type: DataType,
    sequence_length: usize,
    weights: Vec<f64>,
    bias: f64,
    mean: f64,
    scale: f64,
    trained_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RecurrentForecaster {
    config: Option<ForecasterConfig>,
}

impl Forecaster for RecurrentForecaster {
    fn model_type(&self) -> ModelType {
        ModelType::Recurrent
    }

    fn prepare(&mut self, config: &ForecasterConfig) -> anyhow::Result<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn train(
        &self,
        data: &TrainingData,
        hyper: &Hyperparams,
        on_epoch: &mut dyn FnMut(u32, u32),
    ) -> anyhow::Result<TrainOutcome> {
        let cfg = self.config.as_ref().context("forecaster not prepared")?;
        let n = hyper.sequence_length;
        if data.train.is_empty() {
            bail!("empty training split");
        }
        if data.train.inputs.iter().any(|w| w.len() != n) {
            bail!("training windows do not match sequence length {n}");
        }

        let (mean, scale) = normalization(&data.train.inputs, &data.train.targets);
        let xs: Vec<Vec<f64>> = data
            .train
            .inputs
            .iter()
            .map(|w| w.iter().map(|v| (v - mean) / scale).collect())
            .collect();
        let ys: Vec<f64> = data.train.targets.iter().map(|v| (v - mean) / scale).collect();

        // arranca como "persistencia": predice el último valor
        let mut weights = vec![0.0; n];
        weights[n - 1] = 1.0;
        let mut bias = 0.0;

        let batch = hyper.batch_size.max(1);
        for epoch in 1..=hyper.epochs {
            let mut epoch_loss = 0.0;
            for (bx, by) in xs.chunks(batch).zip(ys.chunks(batch)) {
                let mut grad_w = vec![0.0; n];
                let mut grad_b = 0.0;
                for (x, y) in bx.iter().zip(by) {
                    let err = bias + dot(&weights, x) - y;
                    epoch_loss += err * err;
                    for (g, xi) in grad_w.iter_mut().zip(x) {
                        *g += 2.0 * err * xi;
                    }
                    grad_b += 2.0 * err;
                }
                let m = bx.len() as f64;
                for (w, g) in weights.iter_mut().zip(&grad_w) {
                    *w -= hyper.learning_rate * g / m;
                }
                bias -= hyper.learning_rate * grad_b / m;
            }
            if !bias.is_finite() || weights.iter().any(|w| !w.is_finite()) {
                bail!("training diverged at epoch {epoch}");
            }
            debug!(epoch, loss = epoch_loss / xs.len() as f64, "recurrent epoch");
            on_epoch(epoch, hyper.epochs);
        }

        let artifact = RecurrentArtifact {
            model_type: ModelType::Recurrent,
            data_type: cfg.data_type,
            sequence_length: n,
            weights,
            bias,
            mean,
            scale,
            trained_at: Utc::now(),
        };
        let predictor = RecurrentPredictor {
            artifact: artifact.clone(),
        };
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
        let artifact: RecurrentArtifact = read_artifact(path)?;
        if artifact.model_type != ModelType::Recurrent {
            bail!("{} is a {} artifact", path.display(), artifact.model_type);
        }
        if artifact.weights.len() != artifact.sequence_length {
            bail!("corrupt artifact {}: weight count mismatch", path.display());
        }
        Ok(Box::new(RecurrentPredictor { artifact }))
    }
}

struct RecurrentPredictor {
    artifact: RecurrentArtifact,
}

impl Predictor for RecurrentPredictor {
    fn sequence_length(&self) -> usize {
        self.artifact.sequence_length
    }

    fn predict(&self, sequence: &[f64]) -> anyhow::Result<f64> {
        let a = &self.artifact;
        let window = trailing(sequence, a.sequence_length)?;
        let z: Vec<f64> = window.iter().map(|v| (v - a.mean) / a.scale).collect();
        Ok((a.bias + dot(&a.weights, &z)) * a.scale + a.mean)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Media y desvío de todos los valores vistos en train. Desvío 0 => 1.
fn normalization(inputs: &[Vec<f64>], targets: &[f64]) -> (f64, f64) {
    let values: Vec<f64> = inputs.iter().flatten().chain(targets).copied().collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    (mean, if std > f64::EPSILON { std } else { 1.0 })
}
