use anyhow::bail;

use crate::task::Metrics;

pub fn evaluate(predictions: &[f64], actual: &[f64]) -> anyhow::Result<Metrics> {
    if predictions.len() != actual.len() {
        bail!(
            "{} predictions for {} actual values",
            predictions.len(),
            actual.len()
        );
    }
    if actual.is_empty() {
        bail!("no values to evaluate");
    }

    let n = actual.len() as f64;
    let (sq, abs) = predictions
        .iter()
        .zip(actual)
        .fold((0.0, 0.0), |(sq, abs), (p, a)| {
            let err = p - a;
            (sq + err * err, abs + err.abs())
        });
    let mse = sq / n;
    Ok(Metrics {
        mse,
        mae: abs / n,
        rmse: mse.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metricas_basicas() {
        let m = evaluate(&[1.0, 2.0, 5.0], &[1.0, 3.0, 3.0]).unwrap();
        assert!((m.mse - 5.0 / 3.0).abs() < 1e-12);
        assert!((m.mae - 1.0).abs() < 1e-12);
        assert!((m.rmse - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn largos_distintos_fallan() {
        assert!(evaluate(&[1.0], &[1.0, 2.0]).is_err());
        assert!(evaluate(&[], &[]).is_err());
    }
}
