//! Layout de archivos bajo `data_root` y los Result Artifacts que dejan las
//! tasks de prediction y comparison.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::ids::{DatasetId, ModelId, TaskId};
use crate::job::{DataType, ModelType};
use crate::task::Metrics;

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn model_path(&self, model_type: ModelType, data_type: DataType, task_id: TaskId) -> PathBuf {
        self.models_dir()
            .join(format!("{model_type}_{data_type}_{task_id}.json"))
    }

    /// Scratch de un run de training; el backend deja acá su artifact.
    pub fn workspace_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join("workspace").join(format!("task_{task_id}"))
    }

    pub fn results_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join("results").join(format!("task_{task_id}"))
    }

    pub fn prediction_path(&self, task_id: TaskId) -> PathBuf {
        self.results_dir(task_id).join("prediction_results.json")
    }

    pub fn comparison_path(&self, task_id: TaskId) -> PathBuf {
        self.results_dir(task_id).join("comparison_results.json")
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.root.join("samples")
    }

    /// Mueve el artifact entrenado a su lugar definitivo.
    pub fn persist_model(&self, trained: &Path, dest: &Path) -> anyhow::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
        }
        if fs::rename(trained, dest).is_err() {
            // otro filesystem: copiar y borrar
            fs::copy(trained, dest).with_context(|| {
                format!("copy {} -> {}", trained.display(), dest.display())
            })?;
            remove_if_present(trained)?;
        }
        Ok(())
    }
}

/* --------- Result Artifacts --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl Timing {
    pub fn since(started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now().max(started_at);
        Self {
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub task_id: TaskId,
    pub model_id: ModelId,
    pub model_type: ModelType,
    pub data_type: DataType,
    pub input_sequence: Vec<f64>,
    pub prediction: f64,
    pub timing: Timing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparedModel {
    pub model_id: ModelId,
    pub model_type: ModelType,
    pub sequence_length: usize,
    pub metrics: Metrics,
}

/// Tres series del mismo largo, alineadas por índice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSeries {
    pub model_a: Vec<f64>,
    pub model_b: Vec<f64>,
    pub actual: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub task_id: TaskId,
    pub dataset_id: DatasetId,
    pub window_length: usize,
    pub test_sequences: usize,
    pub model_a: ComparedModel,
    pub model_b: ComparedModel,
    pub predictions: ComparisonSeries,
    pub timing: Timing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultArtifact {
    Prediction(PredictionResult),
    Comparison(ComparisonResult),
}

/// Escribe el artifact una sola vez: si el archivo ya existe, falla.
pub fn write_once(path: &Path, artifact: &ResultArtifact) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create result artifact {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, artifact)?;
    writer.flush()?;
    Ok(())
}

pub fn read_result(path: &Path) -> anyhow::Result<ResultArtifact> {
    let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Borra el archivo; que no exista no es error. Si el directorio padre queda
/// vacío también se borra.
pub fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        let _ = fs::remove_dir(parent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("results_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn prediction(task_id: u64) -> ResultArtifact {
        ResultArtifact::Prediction(PredictionResult {
            task_id: TaskId(task_id),
            model_id: ModelId(1),
            model_type: ModelType::Recurrent,
            data_type: DataType::Weather,
            input_sequence: vec![1.0, 2.0],
            prediction: 3.0,
            timing: Timing::since(Utc::now()),
        })
    }

    #[test]
    fn write_once_no_pisa() {
        let layout = ArtifactLayout::new(temp_dir("once"));
        let path = layout.prediction_path(TaskId(7));
        write_once(&path, &prediction(7)).unwrap();
        assert!(write_once(&path, &prediction(8)).is_err());

        match read_result(&path).unwrap() {
            ResultArtifact::Prediction(p) => assert_eq!(p.task_id, TaskId(7)),
            other => panic!("unexpected artifact {other:?}"),
        }
    }

    #[test]
    fn remove_tolera_archivo_ausente() {
        let layout = ArtifactLayout::new(temp_dir("remove"));
        let path = layout.prediction_path(TaskId(1));
        write_once(&path, &prediction(1)).unwrap();
        remove_if_present(&path).unwrap();
        assert!(!path.exists());
        assert!(!layout.results_dir(TaskId(1)).exists());
        remove_if_present(&path).unwrap();
    }

    #[test]
    fn persist_model_mueve_el_archivo() {
        let layout = ArtifactLayout::new(temp_dir("persist"));
        let scratch = layout.workspace_dir(TaskId(3));
        fs::create_dir_all(&scratch).unwrap();
        let trained = scratch.join("model.json");
        fs::write(&trained, "{}").unwrap();

        let dest = layout.model_path(ModelType::Generative, DataType::Traffic, TaskId(3));
        layout.persist_model(&trained, &dest).unwrap();
        assert!(dest.ends_with("models/generative_traffic_3.json"));
        assert!(dest.exists() && !trained.exists());
    }
}
