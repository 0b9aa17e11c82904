use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ids::TaskId;
use crate::job::{DataType, ModelType, TaskKind, TaskParameters};

/// Estados de una task. `pending` es el inicial; `completed`, `failed` y
/// `cancelled` son terminales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Grafo de transiciones permitido. `running -> running` sólo sirve para
    /// escribir progreso; eso lo controla el lifecycle.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::validation(format!("unknown task status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub mse: f64,
    pub mae: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub data_type: DataType,
    pub model_type: Option<ModelType>,
    pub status: TaskStatus,
    pub progress: f64,
    pub parameters: TaskParameters,

    pub data_file_path: Option<String>,
    pub model_file_path: Option<String>,
    pub result_file_path: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub mse: Option<f64>,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub error_message: Option<String>,

    /// Contador para compare-and-swap en el registry.
    pub version: u64,
}

impl Task {
    pub fn metrics(&self) -> Option<Metrics> {
        match (self.mse, self.mae, self.rmse) {
            (Some(mse), Some(mae), Some(rmse)) => Some(Metrics { mse, mae, rmse }),
            _ => None,
        }
    }

    pub fn set_metrics(&mut self, metrics: Metrics) {
        self.mse = Some(metrics.mse);
        self.mae = Some(metrics.mae);
        self.rmse = Some(metrics.rmse);
    }
}

/// Task ya validada, lista para que el registry le asigne id y versión.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub data_type: DataType,
    pub model_type: Option<ModelType>,
    pub parameters: TaskParameters,
    pub data_file_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewTask {
    pub fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            kind: self.kind,
            data_type: self.data_type,
            model_type: self.model_type,
            status: TaskStatus::Pending,
            progress: 0.0,
            parameters: self.parameters,
            data_file_path: self.data_file_path,
            model_file_path: None,
            result_file_path: None,
            created_at: self.created_at,
            started_at: None,
            completed_at: None,
            mse: None,
            mae: None,
            rmse: None,
            error_message: None,
            version: 0,
        }
    }
}

/* --------- Listado paginado --------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.kind.map_or(true, |k| task.kind == k) && self.status.map_or(true, |s| task.status == s)
    }
}

pub const DEFAULT_PER_PAGE: usize = 20;
pub const MAX_PER_PAGE: usize = 100;

/// Página 1-based.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl PageRequest {
    pub fn new(page: Option<usize>, per_page: Option<usize>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl TaskPage {
    /// `sorted` ya viene en el orden final (más nuevas primero).
    pub fn slice(sorted: Vec<Task>, req: PageRequest) -> Self {
        let total = sorted.len();
        let pages = total.div_ceil(req.per_page);
        let tasks = sorted
            .into_iter()
            .skip((req.page - 1).saturating_mul(req.per_page))
            .take(req.per_page)
            .collect();
        Self {
            tasks,
            total,
            page: req.page,
            per_page: req.per_page,
            pages,
            has_next: req.page < pages,
            has_prev: req.page > 1,
        }
    }
}
