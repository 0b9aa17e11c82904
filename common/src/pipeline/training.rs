use anyhow::Context;
use std::path::Path;
use tracing::{debug, warn};

use super::{training_progress, Abort, Stage, StageRun};
use crate::catalog::NewModel;
use crate::data::CleanOptions;
use crate::error::Error;
use crate::forecast::{ForecasterConfig, Hyperparams, SplitRatios, TrainingData};
use crate::ids::DatasetId;
use crate::job::TrainingConfig;
use crate::lifecycle::TransitionFields;

pub(super) fn run(
    run: &mut StageRun<'_>,
    dataset_id: DatasetId,
    config: &TrainingConfig,
) -> Result<(), Abort> {
    let task_id = run.task_id();
    let data_type = run.task().data_type;
    let model_type = run.task().model_type.ok_or_else(|| {
        Abort::Internal(Error::validation(format!(
            "training task {task_id} has no model type"
        )))
    })?;
    let data_path = run.task().data_file_path.clone().ok_or_else(|| {
        Abort::Internal(Error::validation(format!(
            "training task {task_id} has no data file"
        )))
    })?;
    let data = run.data();

    let (table, target) = run.stage(Stage::ValidateDataset, || {
        let table = data.load(Path::new(&data_path))?;
        let target = match &config.target_column {
            Some(column) => column.clone(),
            None => table
                .numeric_columns()
                .into_iter()
                .next()
                .context("dataset has no numeric column")?,
        };
        let report = data.validate(&table, &target);
        report.ensure_trainable(config.sequence_length)?;
        for finding in report.warnings() {
            warn!(task_id = %task_id, dataset_id = %dataset_id, column = %target, "{finding}");
        }
        Ok((table, target))
    })?;

    let prepared = run.stage(Stage::PrepareData, || {
        let cleaned = data.clean(table, &CleanOptions::default())?;
        let windows = data.window_sequences(&cleaned, &target, config.sequence_length)?;
        debug!(task_id = %task_id, windows = windows.len(), "ventanas listas");
        TrainingData::split(windows, SplitRatios::default())
    })?;

    let workspace = run.layout().workspace_dir(task_id);
    run.scratch(workspace.clone());
    let factory = run.forecasters();
    let progress = run.progress_sink();
    let hyper = Hyperparams::from(config);
    let outcome = run.stage(Stage::TrainModel, || {
        let mut forecaster = factory.create(model_type);
        forecaster.prepare(&ForecasterConfig {
            data_type,
            work_dir: workspace.clone(),
        })?;
        forecaster.train(&prepared, &hyper, &mut |epoch, total| {
            progress.report(training_progress(epoch, total))
        })
    })?;

    let model_path = run.layout().model_path(model_type, data_type, task_id);
    run.track(model_path.clone());
    let layout = run.layout();
    run.stage(Stage::PersistModel, || {
        layout.persist_model(&outcome.artifact_path, &model_path)
    })?;

    let model_path = model_path.display().to_string();
    let fields = TransitionFields {
        metrics: Some(outcome.metrics),
        model_file_path: Some(model_path.clone()),
        ..TransitionFields::default()
    };
    let model = NewModel {
        model_type,
        data_type,
        model_path,
        training_task_id: task_id,
        training_parameters: config.clone(),
        validation: outcome.metrics,
    };
    run.finalize_training(fields, model)?;
    Ok(())
}
