use anyhow::Context;
use chrono::Utc;
use std::path::Path;
use tracing::debug;

use super::{batch_progress, Abort, Stage, StageRun, BATCH_PROGRESS_EVERY};
use crate::catalog::Model;
use crate::data::CleanOptions;
use crate::forecast::{metrics, Forecaster, ForecasterFactory, Predictor};
use crate::ids::{DatasetId, ModelId};
use crate::lifecycle::TransitionFields;
use crate::registry::Registry;
use crate::results::{
    write_once, ComparedModel, ComparisonResult, ComparisonSeries, ResultArtifact, Timing,
};

struct Loaded {
    record: Model,
    forecaster: Box<dyn Forecaster>,
    handle: Box<dyn Predictor>,
}

impl Loaded {
    fn predict(&self, window: &[f64]) -> anyhow::Result<f64> {
        self.forecaster.predict(self.handle.as_ref(), window)
    }
}

fn load(
    registry: &dyn Registry,
    factory: &dyn ForecasterFactory,
    id: ModelId,
) -> anyhow::Result<Loaded> {
    let record = registry
        .get_model(id)?
        .with_context(|| format!("model {id} not found"))?;
    let forecaster = factory.create(record.model_type);
    let handle = forecaster
        .load(Path::new(&record.model_path))
        .with_context(|| format!("load model {id}"))?;
    Ok(Loaded {
        record,
        forecaster,
        handle,
    })
}

pub(super) fn run(
    run: &mut StageRun<'_>,
    model_a_id: ModelId,
    model_b_id: ModelId,
    dataset_id: DatasetId,
) -> Result<(), Abort> {
    let task_id = run.task_id();
    let started_at = Utc::now();
    let registry = run.registry();
    let factory = run.forecasters();
    let data = run.data();

    let (a, b) = run.stage(Stage::LoadModels, || {
        Ok((
            load(registry, factory, model_a_id)?,
            load(registry, factory, model_b_id)?,
        ))
    })?;
    // cada modelo toma la cola de la ventana que coincide con su largo
    let window = a.handle.sequence_length().max(b.handle.sequence_length());

    let data_file = run.task().data_file_path.clone();
    let test = run.stage(Stage::PrepareTestSet, || {
        let dataset = registry
            .get_dataset(dataset_id)?
            .with_context(|| format!("dataset {dataset_id} not found"))?;
        let path = data_file.unwrap_or_else(|| dataset.file_path.clone());
        let table = data.load(Path::new(&path))?;
        let target = a
            .record
            .training_parameters
            .target_column
            .clone()
            .or_else(|| dataset.preprocessing.target_column.clone())
            .or_else(|| table.numeric_columns().into_iter().next())
            .context("dataset has no numeric column")?;
        let cleaned = data.clean(table, &CleanOptions::default())?;
        data.window_sequences(&cleaned, &target, window)
    })?;

    let progress = run.progress_sink();
    let series = run.stage(Stage::BatchPredict, || {
        let total = test.len();
        let mut series = ComparisonSeries::default();
        for (i, (input, actual)) in test.inputs.iter().zip(&test.targets).enumerate() {
            series.model_a.push(a.predict(input)?);
            series.model_b.push(b.predict(input)?);
            series.actual.push(*actual);

            let processed = i + 1;
            if processed % BATCH_PROGRESS_EVERY == 0 {
                progress.report(batch_progress(processed, total));
            }
        }
        debug!(task_id = %task_id, items = total, "batch terminado");
        Ok(series)
    })?;

    let (metrics_a, metrics_b) = run.stage(Stage::ComputeMetrics, || {
        Ok((
            metrics::evaluate(&series.model_a, &series.actual)?,
            metrics::evaluate(&series.model_b, &series.actual)?,
        ))
    })?;

    let path = run.layout().comparison_path(task_id);
    run.track(path.clone());
    let artifact = ResultArtifact::Comparison(ComparisonResult {
        task_id,
        dataset_id,
        window_length: window,
        test_sequences: series.actual.len(),
        model_a: compared(&a, metrics_a),
        model_b: compared(&b, metrics_b),
        predictions: series,
        timing: Timing::since(started_at),
    });
    run.stage(Stage::Persist, || write_once(&path, &artifact))?;

    run.finalize(TransitionFields {
        result_file_path: Some(path.display().to_string()),
        ..TransitionFields::default()
    })?;
    Ok(())
}

fn compared(loaded: &Loaded, metrics: crate::task::Metrics) -> ComparedModel {
    ComparedModel {
        model_id: loaded.record.id,
        model_type: loaded.record.model_type,
        sequence_length: loaded.handle.sequence_length(),
        metrics,
    }
}
