//! Limpieza periódica de tasks terminadas viejas y sus artifacts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::Registry;
use crate::results::remove_if_present;
use crate::task::TaskStatus;

pub const DEFAULT_RETENTION_DAYS: i64 = 7;
/// Cien años. Más que eso no cabe en un corte de `DateTime<Utc>`.
pub const MAX_RETENTION_DAYS: i64 = 36_500;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cancelled no entra: esas tasks se quedan hasta que alguien las borre.
pub const SWEPT_STATUSES: [TaskStatus; 2] = [TaskStatus::Completed, TaskStatus::Failed];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
    pub skipped: usize,
}

pub struct RetentionSweeper {
    registry: Arc<dyn Registry>,
    retention: ChronoDuration,
}

impl RetentionSweeper {
    pub fn new(registry: Arc<dyn Registry>, retention_days: i64) -> Self {
        Self {
            registry,
            retention: ChronoDuration::try_days(retention_days).unwrap_or(ChronoDuration::MAX),
        }
    }

    /// Una pasada. Un registro que no se pudo limpiar no corta el resto.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            // el corte queda antes de cualquier fecha representable
            debug!(retention_days = self.retention.num_days(), "retención fuera de rango, nada vence");
            return Ok(SweepReport::default());
        };
        let expired = self.registry.expired_tasks(&SWEPT_STATUSES, cutoff)?;
        let mut report = SweepReport {
            examined: expired.len(),
            ..SweepReport::default()
        };

        for task in expired {
            if let Some(artifact) = task.result_file_path.as_deref() {
                if let Err(e) = remove_if_present(Path::new(artifact)) {
                    warn!(task_id = %task.id, artifact, error = %e, "no se pudo borrar el artifact, queda para el próximo sweep");
                    report.skipped += 1;
                    continue;
                }
            }
            match self.registry.delete_task(task.id) {
                Ok(true) => {
                    debug!(task_id = %task.id, status = %task.status, "task vencida borrada");
                    report.deleted += 1;
                }
                Ok(false) => {
                    // otro sweep llegó antes
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "no se pudo borrar la task");
                    report.skipped += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                deleted = report.deleted,
                skipped = report.skipped,
                "sweep de retención terminado"
            );
        }
        Ok(report)
    }
}

/// Loop del sweeper: duerme `interval` y hace una pasada, hasta que llegue la
/// señal de shutdown.
pub async fn run_sweep_loop(
    sweeper: Arc<RetentionSweeper>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        if let Err(e) = sweeper.sweep_once(Utc::now()) {
            warn!("error en sweep de retención: {:?}", e);
        }
    }
    debug!("sweeper detenido");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ModelId;
    use crate::job::{DataType, ModelType, TaskKind, TaskParameters};
    use crate::registry::InMemoryRegistry;
    use crate::task::{NewTask, Task};
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("sweeper_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    /// Inserta una task terminal con `completed_at` = now - `age_days`.
    fn finished(
        registry: &dyn Registry,
        status: TaskStatus,
        age_days: i64,
        artifact: Option<&Path>,
    ) -> Task {
        let now = Utc::now();
        let mut task = registry
            .insert_task(NewTask {
                kind: TaskKind::Prediction,
                data_type: DataType::Weather,
                model_type: Some(ModelType::Recurrent),
                parameters: TaskParameters::Prediction {
                    model_id: ModelId(1),
                    input_sequence: vec![1.0; 10],
                },
                data_file_path: None,
                created_at: now - ChronoDuration::days(age_days + 1),
            })
            .unwrap();
        task.status = status;
        task.started_at = Some(task.created_at);
        task.completed_at = Some(now - ChronoDuration::days(age_days));
        task.result_file_path = artifact.map(|p| p.display().to_string());
        registry.replace_task(task).unwrap()
    }

    #[test]
    fn borra_vencidas_y_conserva_recientes() {
        let dir = temp_dir("retention");
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let old_artifact = dir.join("old.json");
        let new_artifact = dir.join("new.json");
        fs::write(&old_artifact, "{}").unwrap();
        fs::write(&new_artifact, "{}").unwrap();

        let old = finished(registry.as_ref(), TaskStatus::Completed, 8, Some(&old_artifact));
        let recent = finished(registry.as_ref(), TaskStatus::Completed, 3, Some(&new_artifact));

        let sweeper = RetentionSweeper::new(Arc::clone(&registry), DEFAULT_RETENTION_DAYS);
        let report = sweeper.sweep_once(Utc::now()).unwrap();

        assert_eq!(report.deleted, 1);
        assert!(registry.get_task(old.id).unwrap().is_none());
        assert!(!old_artifact.exists());
        assert!(registry.get_task(recent.id).unwrap().is_some());
        assert!(new_artifact.exists());
    }

    #[test]
    fn artifact_faltante_no_frena_el_borrado() {
        let dir = temp_dir("missing_artifact");
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let gone = dir.join("nunca_existio.json");
        let failed = finished(registry.as_ref(), TaskStatus::Failed, 10, Some(&gone));
        let no_artifact = finished(registry.as_ref(), TaskStatus::Failed, 10, None);

        let report = RetentionSweeper::new(Arc::clone(&registry), 7)
            .sweep_once(Utc::now())
            .unwrap();
        assert_eq!(report, SweepReport { examined: 2, deleted: 2, skipped: 0 });
        assert!(registry.get_task(failed.id).unwrap().is_none());
        assert!(registry.get_task(no_artifact.id).unwrap().is_none());
    }

    #[test]
    fn cancelled_no_se_barre() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let cancelled = finished(registry.as_ref(), TaskStatus::Cancelled, 30, None);

        let report = RetentionSweeper::new(Arc::clone(&registry), 7)
            .sweep_once(Utc::now())
            .unwrap();
        assert_eq!(report.examined, 0);
        assert!(registry.get_task(cancelled.id).unwrap().is_some());
    }

    #[test]
    fn retencion_enorme_no_vence_nada() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let old = finished(registry.as_ref(), TaskStatus::Completed, 400, None);

        for days in [1_000_000_000, i64::MAX] {
            let report = RetentionSweeper::new(Arc::clone(&registry), days)
                .sweep_once(Utc::now())
                .unwrap();
            assert_eq!(report, SweepReport::default());
        }
        assert!(registry.get_task(old.id).unwrap().is_some());
    }

    #[test]
    fn artifact_que_no_se_puede_borrar_queda_para_despues() {
        let dir = temp_dir("stuck_artifact");
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        // un directorio con contenido no se borra con remove_file
        let stuck = dir.join("stuck");
        fs::create_dir_all(stuck.join("inner")).unwrap();
        let kept = finished(registry.as_ref(), TaskStatus::Completed, 9, Some(&stuck));
        let other = finished(registry.as_ref(), TaskStatus::Completed, 9, None);

        let report = RetentionSweeper::new(Arc::clone(&registry), 7)
            .sweep_once(Utc::now())
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted, 1);
        assert!(registry.get_task(kept.id).unwrap().is_some());
        assert!(registry.get_task(other.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn el_loop_corta_con_shutdown() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let sweeper = Arc::new(RetentionSweeper::new(registry, 7));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweep_loop(sweeper, Duration::from_secs(3600), rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
