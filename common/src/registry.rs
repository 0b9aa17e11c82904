//! Almacén de Task / Model / Dataset. Acceso a datos puro: las reglas de
//! negocio viven en el lifecycle. Cada escritura de una task es un
//! compare-and-swap sobre `version`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{Dataset, Model, NewDataset, NewModel};
use crate::data::TableAnalysis;
use crate::ids::{DatasetId, ModelId, TaskId};
use crate::task::{NewTask, PageRequest, Task, TaskFilter, TaskPage, TaskStatus};

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("version conflict on task {id}: expected {expected}, found {found}")]
    VersionConflict { id: TaskId, expected: u64, found: u64 },

    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: u64 },

    #[error("registry storage error: {0}")]
    Storage(String),
}

fn missing(entity: &'static str, id: impl Into<u64>) -> RegistryError {
    RegistryError::Missing {
        entity,
        id: id.into(),
    }
}

pub trait Registry: Send + Sync {
    fn insert_task(&self, task: NewTask) -> Result<Task, RegistryError>;
    fn get_task(&self, id: TaskId) -> Result<Option<Task>, RegistryError>;
    /// Reemplaza la fila si `task.version` coincide con la guardada; devuelve
    /// la fila con la versión incrementada.
    fn replace_task(&self, task: Task) -> Result<Task, RegistryError>;
    /// Igual que `replace_task` pero inserta el Model en la misma escritura.
    fn replace_task_and_insert_model(
        &self,
        task: Task,
        model: NewModel,
    ) -> Result<(Task, Model), RegistryError>;
    fn delete_task(&self, id: TaskId) -> Result<bool, RegistryError>;
    /// Más nuevas primero.
    fn list_tasks(&self, filter: &TaskFilter, page: PageRequest) -> Result<TaskPage, RegistryError>;
    fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, RegistryError>;
    /// Tasks en `statuses` con `completed_at` estrictamente anterior a `cutoff`.
    fn expired_tasks(
        &self,
        statuses: &[TaskStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, RegistryError>;

    fn insert_model(&self, model: NewModel) -> Result<Model, RegistryError>;
    fn get_model(&self, id: ModelId) -> Result<Option<Model>, RegistryError>;
    fn list_models(&self, active_only: bool) -> Result<Vec<Model>, RegistryError>;
    fn set_model_active(&self, id: ModelId, active: bool) -> Result<Model, RegistryError>;

    fn insert_dataset(&self, dataset: NewDataset) -> Result<Dataset, RegistryError>;
    fn get_dataset(&self, id: DatasetId) -> Result<Option<Dataset>, RegistryError>;
    fn list_datasets(&self) -> Result<Vec<Dataset>, RegistryError>;
    fn cache_dataset_analysis(
        &self,
        id: DatasetId,
        analysis: TableAnalysis,
    ) -> Result<Dataset, RegistryError>;

    fn counts(&self) -> Result<RegistryCounts, RegistryError>;
    fn flush(&self) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub total_tasks: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub active_models: usize,
    pub models_by_type: BTreeMap<String, usize>,
    pub total_datasets: usize,
}

/* --------- Implementación en memoria + snapshot JSON --------- */

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_task_id: u64,
    next_model_id: u64,
    next_dataset_id: u64,
    tasks: Vec<Task>,
    models: Vec<Model>,
    datasets: Vec<Dataset>,
}

#[derive(Debug, Default)]
struct Tables {
    next_task_id: u64,
    next_model_id: u64,
    next_dataset_id: u64,
    tasks: BTreeMap<TaskId, Task>,
    models: BTreeMap<ModelId, Model>,
    datasets: BTreeMap<DatasetId, Dataset>,
}

impl Tables {
    fn from_snapshot(snap: Snapshot) -> Self {
        let max_task = snap.tasks.iter().map(|t| t.id.0).max().unwrap_or(0);
        let max_model = snap.models.iter().map(|m| m.id.0).max().unwrap_or(0);
        let max_dataset = snap.datasets.iter().map(|d| d.id.0).max().unwrap_or(0);
        Self {
            next_task_id: snap.next_task_id.max(max_task),
            next_model_id: snap.next_model_id.max(max_model),
            next_dataset_id: snap.next_dataset_id.max(max_dataset),
            tasks: snap.tasks.into_iter().map(|t| (t.id, t)).collect(),
            models: snap.models.into_iter().map(|m| (m.id, m)).collect(),
            datasets: snap.datasets.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            next_task_id: self.next_task_id,
            next_model_id: self.next_model_id,
            next_dataset_id: self.next_dataset_id,
            tasks: self.tasks.values().cloned().collect(),
            models: self.models.values().cloned().collect(),
            datasets: self.datasets.values().cloned().collect(),
        }
    }

    fn alloc_model_id(&mut self) -> ModelId {
        self.next_model_id += 1;
        ModelId(self.next_model_id)
    }

    /// Chequeo CAS; deja la fila lista para escribir con la versión nueva.
    fn checked_replacement(&self, mut task: Task) -> Result<Task, RegistryError> {
        let stored = self.tasks.get(&task.id).ok_or_else(|| missing("task", task.id))?;
        if stored.version != task.version {
            return Err(RegistryError::VersionConflict {
                id: task.id,
                expected: task.version,
                found: stored.version,
            });
        }
        task.version += 1;
        Ok(task)
    }
}

pub struct InMemoryRegistry {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    /// Registry sin archivo detrás (tests, herramientas).
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            path: None,
        }
    }

    /// Abre el snapshot en `path` si existe; si no, arranca vacío y lo crea en
    /// el primer `flush`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = fs::read(&path)
                .map_err(|e| RegistryError::Storage(format!("read {}: {e}", path.display())))?;
            let snap: Snapshot = serde_json::from_slice(&raw)
                .map_err(|e| RegistryError::Storage(format!("parse {}: {e}", path.display())))?;
            let tables = Tables::from_snapshot(snap);
            info!(
                path = %path.display(),
                tasks = tables.tasks.len(),
                models = tables.models.len(),
                datasets = tables.datasets.len(),
                "registry cargado"
            );
            tables
        } else {
            info!(path = %path.display(), "registry nuevo");
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RegistryError> {
        self.tables
            .read()
            .map_err(|_| RegistryError::Storage("registry lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RegistryError> {
        self.tables
            .write()
            .map_err(|_| RegistryError::Storage("registry lock poisoned".into()))
    }
}

impl Registry for InMemoryRegistry {
    fn insert_task(&self, task: NewTask) -> Result<Task, RegistryError> {
        let mut t = self.write()?;
        t.next_task_id += 1;
        let task = task.into_task(TaskId(t.next_task_id));
        t.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>, RegistryError> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    fn replace_task(&self, task: Task) -> Result<Task, RegistryError> {
        let mut t = self.write()?;
        let next = t.checked_replacement(task)?;
        t.tasks.insert(next.id, next.clone());
        Ok(next)
    }

    fn replace_task_and_insert_model(
        &self,
        task: Task,
        model: NewModel,
    ) -> Result<(Task, Model), RegistryError> {
        let mut t = self.write()?;
        let next = t.checked_replacement(task)?;
        let model = model.into_model(t.alloc_model_id(), Utc::now());
        t.tasks.insert(next.id, next.clone());
        t.models.insert(model.id, model.clone());
        Ok((next, model))
    }

    fn delete_task(&self, id: TaskId) -> Result<bool, RegistryError> {
        Ok(self.write()?.tasks.remove(&id).is_some())
    }

    fn list_tasks(&self, filter: &TaskFilter, page: PageRequest) -> Result<TaskPage, RegistryError> {
        let mut tasks: Vec<Task> = self
            .read()?
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(TaskPage::slice(tasks, page))
    }

    fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, RegistryError> {
        Ok(self
            .read()?
            .tasks
            .values()
            .filter(|task| statuses.contains(&task.status))
            .cloned()
            .collect())
    }

    fn expired_tasks(
        &self,
        statuses: &[TaskStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, RegistryError> {
        Ok(self
            .read()?
            .tasks
            .values()
            .filter(|task| statuses.contains(&task.status))
            .filter(|task| task.completed_at.is_some_and(|done| done < cutoff))
            .cloned()
            .collect())
    }

    fn insert_model(&self, model: NewModel) -> Result<Model, RegistryError> {
        let mut t = self.write()?;
        let model = model.into_model(t.alloc_model_id(), Utc::now());
        t.models.insert(model.id, model.clone());
        Ok(model)
    }

    fn get_model(&self, id: ModelId) -> Result<Option<Model>, RegistryError> {
        Ok(self.read()?.models.get(&id).cloned())
    }

    fn list_models(&self, active_only: bool) -> Result<Vec<Model>, RegistryError> {
        let mut models: Vec<Model> = self
            .read()?
            .models
            .values()
            .filter(|m| !active_only || m.is_active)
            .cloned()
            .collect();
        models.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(models)
    }

    fn set_model_active(&self, id: ModelId, active: bool) -> Result<Model, RegistryError> {
        let mut t = self.write()?;
        let model = t.models.get_mut(&id).ok_or_else(|| missing("model", id))?;
        model.is_active = active;
        model.updated_at = Utc::now();
        debug!(model_id = %id, active, "model actualizado");
        Ok(model.clone())
    }

    fn insert_dataset(&self, dataset: NewDataset) -> Result<Dataset, RegistryError> {
        let mut t = self.write()?;
        t.next_dataset_id += 1;
        let dataset = dataset.into_dataset(DatasetId(t.next_dataset_id), Utc::now());
        t.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    fn get_dataset(&self, id: DatasetId) -> Result<Option<Dataset>, RegistryError> {
        Ok(self.read()?.datasets.get(&id).cloned())
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>, RegistryError> {
        let mut datasets: Vec<Dataset> = self.read()?.datasets.values().cloned().collect();
        datasets.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(b.id.cmp(&a.id)));
        Ok(datasets)
    }

    fn cache_dataset_analysis(
        &self,
        id: DatasetId,
        analysis: TableAnalysis,
    ) -> Result<Dataset, RegistryError> {
        let mut t = self.write()?;
        let dataset = t.datasets.get_mut(&id).ok_or_else(|| missing("dataset", id))?;
        dataset.analysis = Some(analysis);
        Ok(dataset.clone())
    }

    fn counts(&self) -> Result<RegistryCounts, RegistryError> {
        let t = self.read()?;
        let mut counts = RegistryCounts {
            total_tasks: t.tasks.len(),
            total_datasets: t.datasets.len(),
            ..RegistryCounts::default()
        };
        for status in TaskStatus::ALL {
            counts.tasks_by_status.insert(status.to_string(), 0);
        }
        for task in t.tasks.values() {
            *counts
                .tasks_by_status
                .entry(task.status.to_string())
                .or_insert(0) += 1;
        }
        for model in t.models.values().filter(|m| m.is_active) {
            counts.active_models += 1;
            *counts
                .models_by_type
                .entry(model.model_type.to_string())
                .or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn flush(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(&self.read()?.snapshot())
            .map_err(|e| RegistryError::Storage(format!("serialize registry: {e}")))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Storage(format!("mkdir {}: {e}", parent.display())))?;
        }
        // escribir a un tmp y renombrar, para no dejar un snapshot a medias
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .map_err(|e| RegistryError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| RegistryError::Storage(format!("rename {}: {e}", path.display())))?;
        debug!(path = %path.display(), "registry flushed");
        Ok(())
    }
}
