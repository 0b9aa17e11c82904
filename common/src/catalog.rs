//! Registros de Model y Dataset. Se crean como efecto lateral de otros
//! ciclos de vida y no se mutan después (salvo `is_active` y el análisis
//! cacheado del dataset).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::TableAnalysis;
use crate::ids::{DatasetId, ModelId, TaskId};
use crate::job::{DataType, ModelType, TrainingConfig};
use crate::task::Metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub model_type: ModelType,
    pub data_type: DataType,
    pub model_path: String,
    pub training_task_id: TaskId,
    pub training_parameters: TrainingConfig,
    pub validation: Metrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewModel {
    pub model_type: ModelType,
    pub data_type: DataType,
    pub model_path: String,
    pub training_task_id: TaskId,
    pub training_parameters: TrainingConfig,
    pub validation: Metrics,
}

impl NewModel {
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.model_type, self.data_type, self.training_task_id
        )
    }

    pub fn into_model(self, id: ModelId, now: DateTime<Utc>) -> Model {
        Model {
            id,
            name: self.name(),
            model_type: self.model_type,
            data_type: self.data_type,
            model_path: self.model_path,
            training_task_id: self.training_task_id,
            training_parameters: self.training_parameters,
            validation: self.validation,
            created_at: now,
            updated_at: now,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingInfo {
    pub target_column: Option<String>,
    pub numeric_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub data_type: DataType,
    pub file_path: String,
    pub file_size: u64,
    pub num_samples: usize,
    pub num_features: usize,
    pub time_range_start: Option<DateTime<Utc>>,
    pub time_range_end: Option<DateTime<Utc>>,
    pub preprocessing: PreprocessingInfo,
    #[serde(default)]
    pub analysis: Option<TableAnalysis>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDataset {
    pub name: String,
    pub data_type: DataType,
    pub file_path: String,
    pub file_size: u64,
    pub analysis: TableAnalysis,
}

impl NewDataset {
    pub fn into_dataset(self, id: DatasetId, now: DateTime<Utc>) -> Dataset {
        let analysis = self.analysis;
        let (time_range_start, time_range_end) = match analysis.time_range {
            Some((start, end)) => (Some(start), Some(end)),
            None => (None, None),
        };
        Dataset {
            id,
            name: self.name,
            data_type: self.data_type,
            file_path: self.file_path,
            file_size: self.file_size,
            num_samples: analysis.rows,
            num_features: analysis.columns,
            time_range_start,
            time_range_end,
            preprocessing: PreprocessingInfo {
                target_column: analysis.numeric_columns.first().cloned(),
                numeric_columns: analysis.numeric_columns.clone(),
            },
            analysis: Some(analysis),
            uploaded_at: now,
        }
    }
}
