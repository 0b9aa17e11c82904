use anyhow::Context;
use chrono::Utc;
use std::path::Path;

use super::{Abort, Stage, StageRun};
use crate::ids::ModelId;
use crate::lifecycle::TransitionFields;
use crate::results::{write_once, PredictionResult, ResultArtifact, Timing};

pub(super) fn run(run: &mut StageRun<'_>, model_id: ModelId, input: &[f64]) -> Result<(), Abort> {
    let task_id = run.task_id();
    let started_at = Utc::now();
    let registry = run.registry();
    let factory = run.forecasters();

    let (model, forecaster, handle) = run.stage(Stage::LoadModel, || {
        let model = registry
            .get_model(model_id)?
            .with_context(|| format!("model {model_id} not found"))?;
        let forecaster = factory.create(model.model_type);
        let handle = forecaster.load(Path::new(&model.model_path))?;
        Ok((model, forecaster, handle))
    })?;

    let prediction = run.stage(Stage::Predict, || {
        forecaster.predict(handle.as_ref(), input)
    })?;

    let path = run.layout().prediction_path(task_id);
    run.track(path.clone());
    let artifact = ResultArtifact::Prediction(PredictionResult {
        task_id,
        model_id,
        model_type: model.model_type,
        data_type: model.data_type,
        input_sequence: input.to_vec(),
        prediction,
        timing: Timing::since(started_at),
    });
    run.stage(Stage::PersistResult, || write_once(&path, &artifact))?;

    run.finalize(TransitionFields {
        result_file_path: Some(path.display().to_string()),
        ..TransitionFields::default()
    })?;
    Ok(())
}
