//! Preparación de datos tabulares: carga de CSV, análisis, validación,
//! limpieza y ventaneo de la columna objetivo. También genera datasets
//! sintéticos para pruebas y demos.

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use crate::job::DataType;

pub const SAMPLE_SEED: u64 = 42;
pub const MIN_SERIES_LENGTH: usize = 100;
pub const MAX_MISSING_RATIO: f64 = 0.1;
pub const MAX_OUTLIER_RATIO: f64 = 0.05;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/* --------- Tabla --------- */

/// Tabla cruda: encabezados + celdas como texto. Los tipos se infieren al
/// pedir una columna.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> anyhow::Result<Self> {
        if headers.is_empty() {
            bail!("table has no columns");
        }
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != headers.len()) {
            bail!(
                "row {} has {} cells, expected {}",
                i + 1,
                row.len(),
                headers.len()
            );
        }
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// `None` si la columna no existe o algún valor no es numérico. Las
    /// celdas vacías quedan como `None` dentro del vector.
    pub fn numeric_column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.column_index(name)?;
        let mut out = Vec::with_capacity(self.rows.len());
        let mut any = false;
        for row in &self.rows {
            let cell = row[idx].trim();
            if is_missing(cell) {
                out.push(None);
                continue;
            }
            match cell.parse::<f64>() {
                Ok(v) if v.is_finite() => {
                    any = true;
                    out.push(Some(v));
                }
                _ => return None,
            }
        }
        any.then_some(out)
    }

    pub fn numeric_columns(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| self.numeric_column(h).is_some())
            .cloned()
            .collect()
    }

    fn timestamp_column(&self, idx: usize) -> Option<Vec<DateTime<Utc>>> {
        let mut out = Vec::new();
        for row in &self.rows {
            let cell = row[idx].trim();
            if is_missing(cell) {
                continue;
            }
            out.push(parse_timestamp(cell)?);
        }
        (!out.is_empty()).then_some(out)
    }
}

fn is_missing(cell: &str) -> bool {
    cell.is_empty()
        || matches!(
            cell.to_ascii_lowercase().as_str(),
            "nan" | "na" | "null" | "none"
        )
}

fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(cell)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(cell, TIMESTAMP_FORMAT)
                .ok()
                .map(|n| n.and_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(cell, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|n| n.and_utc())
        })
}

/* --------- Resultados de análisis / validación --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableAnalysis {
    pub rows: usize,
    pub columns: usize,
    pub column_names: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub datetime_columns: Vec<String>,
    pub missing_values: BTreeMap<String, usize>,
    pub statistics: BTreeMap<String, ColumnStats>,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub target_column: String,
    pub rows: usize,
    pub target_column_exists: bool,
    pub has_numeric_data: bool,
    pub missing_ratio: f64,
    pub outlier_ratio: f64,
}

impl ValidationReport {
    pub fn low_missing_ratio(&self) -> bool {
        self.missing_ratio < MAX_MISSING_RATIO
    }

    pub fn sufficient_length(&self) -> bool {
        self.rows >= MIN_SERIES_LENGTH
    }

    pub fn reasonable_outliers(&self) -> bool {
        self.outlier_ratio < MAX_OUTLIER_RATIO
    }

    /// Fallas duras: sin columna objetivo, columna no numérica, o no alcanza
    /// para una sola ventana.
    pub fn ensure_trainable(&self, sequence_length: usize) -> anyhow::Result<()> {
        if !self.target_column_exists {
            bail!("target column '{}' not found", self.target_column);
        }
        if !self.has_numeric_data {
            bail!("target column '{}' is not numeric", self.target_column);
        }
        if self.rows <= sequence_length {
            bail!(
                "{} rows are not enough for sequence length {}",
                self.rows,
                sequence_length
            );
        }
        Ok(())
    }

    /// Hallazgos blandos; se loguean pero no frenan el training.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.sufficient_length() {
            out.push(format!(
                "short series: {} rows (< {MIN_SERIES_LENGTH})",
                self.rows
            ));
        }
        if !self.low_missing_ratio() {
            out.push(format!("missing ratio {:.3}", self.missing_ratio));
        }
        if !self.reasonable_outliers() {
            out.push(format!("outlier ratio {:.3}", self.outlier_ratio));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMissing {
    Forward,
    Backward,
    Mean,
    Drop,
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanOptions {
    pub drop_duplicates: bool,
    pub fill: FillMissing,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            drop_duplicates: true,
            fill: FillMissing::Forward,
        }
    }
}

/// Ventanas de entrada y el valor siguiente a cada una.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Windows {
    pub inputs: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl Windows {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/* --------- Colaborador --------- */

pub trait DataPreparation: Send + Sync {
    fn load(&self, path: &Path) -> anyhow::Result<Table>;
    fn analyze(&self, table: &Table) -> TableAnalysis;
    fn validate(&self, table: &Table, target_column: &str) -> ValidationReport;
    fn clean(&self, table: Table, options: &CleanOptions) -> anyhow::Result<Table>;
    fn window_sequences(
        &self,
        table: &Table,
        target_column: &str,
        length: usize,
    ) -> anyhow::Result<Windows>;
    /// Escribe un CSV horario sintético en `path` y devuelve la tabla.
    fn generate_sample(&self, data_type: DataType, rows: usize, path: &Path)
        -> anyhow::Result<Table>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvDataPreparation;

impl DataPreparation for CsvDataPreparation {
    fn load(&self, path: &Path) -> anyhow::Result<Table> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if ext.as_deref() != Some("csv") {
            bail!("unsupported file format: {}", path.display());
        }

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("open {}", path.display()))?;
        let headers: Vec<String> = rdr
            .headers()
            .with_context(|| format!("read headers of {}", path.display()))?
            .iter()
            .map(String::from)
            .collect();

        let mut rows = Vec::new();
        for (i, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("row {} of {}", i + 1, path.display()))?;
            rows.push(record.iter().map(String::from).collect());
        }
        Table::new(headers, rows)
    }

    fn analyze(&self, table: &Table) -> TableAnalysis {
        let mut missing_values = BTreeMap::new();
        let mut statistics = BTreeMap::new();
        let mut numeric_columns = Vec::new();
        let mut datetime_columns = Vec::new();
        let mut time_range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

        for (idx, name) in table.headers.iter().enumerate() {
            let missing = table.rows.iter().filter(|r| is_missing(r[idx].trim())).count();
            missing_values.insert(name.clone(), missing);

            if let Some(values) = table.numeric_column(name) {
                let present: Vec<f64> = values.into_iter().flatten().collect();
                statistics.insert(name.clone(), column_stats(&present));
                numeric_columns.push(name.clone());
            } else if let Some(stamps) = table.timestamp_column(idx) {
                datetime_columns.push(name.clone());
                if time_range.is_none() {
                    let start = stamps.iter().min().copied();
                    let end = stamps.iter().max().copied();
                    time_range = start.zip(end);
                }
            }
        }

        TableAnalysis {
            rows: table.len(),
            columns: table.headers.len(),
            column_names: table.headers.clone(),
            numeric_columns,
            datetime_columns,
            missing_values,
            statistics,
            time_range,
        }
    }

    fn validate(&self, table: &Table, target_column: &str) -> ValidationReport {
        let mut report = ValidationReport {
            target_column: target_column.to_string(),
            rows: table.len(),
            target_column_exists: table.column_index(target_column).is_some(),
            has_numeric_data: false,
            missing_ratio: 0.0,
            outlier_ratio: 0.0,
        };
        let Some(values) = table.numeric_column(target_column) else {
            return report;
        };
        report.has_numeric_data = true;

        let present: Vec<f64> = values.iter().flatten().copied().collect();
        if !values.is_empty() {
            report.missing_ratio = (values.len() - present.len()) as f64 / values.len() as f64;
        }
        report.outlier_ratio = iqr_outlier_ratio(&present);
        report
    }

    fn clean(&self, table: Table, options: &CleanOptions) -> anyhow::Result<Table> {
        let Table { headers, mut rows } = table;

        if options.drop_duplicates {
            let mut seen = HashSet::new();
            rows.retain(|row| seen.insert(row.clone()));
        }

        match options.fill {
            FillMissing::Forward => fill_along(&mut rows, headers.len(), false),
            FillMissing::Backward => fill_along(&mut rows, headers.len(), true),
            FillMissing::Drop => rows.retain(|row| !row.iter().any(|c| is_missing(c.trim()))),
            FillMissing::Mean => {
                let table = Table::new(headers.clone(), rows)?;
                let mut filled = table.rows.clone();
                for (idx, name) in headers.iter().enumerate() {
                    let Some(values) = table.numeric_column(name) else {
                        continue;
                    };
                    let present: Vec<f64> = values.iter().flatten().copied().collect();
                    let mean = column_stats(&present).mean;
                    for (row, value) in filled.iter_mut().zip(values) {
                        if value.is_none() {
                            row[idx] = format!("{mean}");
                        }
                    }
                }
                rows = filled;
            }
            FillMissing::Keep => {}
        }

        Table::new(headers, rows)
    }

    fn window_sequences(
        &self,
        table: &Table,
        target_column: &str,
        length: usize,
    ) -> anyhow::Result<Windows> {
        if length == 0 {
            bail!("sequence length must be at least 1");
        }
        let values = table
            .numeric_column(target_column)
            .with_context(|| format!("column '{target_column}' is missing or not numeric"))?;
        if values.len() <= length {
            bail!(
                "{} rows are not enough for sequence length {length}",
                values.len()
            );
        }

        let mut windows = Windows::default();
        for start in 0..values.len() - length {
            let slice = &values[start..=start + length];
            // ventanas con huecos (p.ej. NaN inicial sin ffill) se descartan
            let Some(full) = slice.iter().copied().collect::<Option<Vec<f64>>>() else {
                continue;
            };
            windows.inputs.push(full[..length].to_vec());
            windows.targets.push(full[length]);
        }
        if windows.is_empty() {
            bail!("no complete window of length {length} in column '{target_column}'");
        }
        Ok(windows)
    }

    fn generate_sample(
        &self,
        data_type: DataType,
        rows: usize,
        path: &Path,
    ) -> anyhow::Result<Table> {
        let table = sample_table(data_type, rows)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
        }
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("create {}", path.display()))?;
        wtr.write_record(&table.headers)?;
        for row in &table.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(table)
    }
}

/// Forward (o backward) fill por columna. Lo que no tiene valor previo queda
/// vacío.
fn fill_along(rows: &mut [Vec<String>], width: usize, backward: bool) {
    for col in 0..width {
        let mut last: Option<String> = None;
        let mut visit = |row: &mut Vec<String>| {
            if is_missing(row[col].trim()) {
                if let Some(v) = &last {
                    row[col] = v.clone();
                }
            } else {
                last = Some(row[col].clone());
            }
        };
        if backward {
            rows.iter_mut().rev().for_each(&mut visit);
        } else {
            rows.iter_mut().for_each(&mut visit);
        }
    }
}

fn column_stats(values: &[f64]) -> ColumnStats {
    if values.is_empty() {
        return ColumnStats {
            count: 0,
            mean: 0.0,
            std: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = if values.len() > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    ColumnStats {
        count: values.len(),
        mean,
        std: var.sqrt(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Cuantil con interpolación lineal sobre un slice ordenado.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn iqr_outlier_ratio(values: &[f64]) -> f64 {
    if values.len() < 4 {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let (low, high) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
    let outliers = values.iter().filter(|v| **v < low || **v > high).count();
    outliers as f64 / values.len() as f64
}

/* --------- Datos sintéticos --------- */

fn sample_table(data_type: DataType, rows: usize) -> anyhow::Result<Table> {
    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let start = NaiveDate::from_ymd_opt(2020, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .context("invalid sample start date")?
        .and_utc();

    let mut headers = vec!["datetime".to_string()];
    headers.extend(data_type.sample_columns().iter().map(|c| c.to_string()));

    let mut out = Vec::with_capacity(rows);
    for i in 0..rows {
        let t = i as f64;
        let daily = (2.0 * PI * t / 24.0).sin();
        let weekly = (2.0 * PI * t / (24.0 * 7.0)).sin();
        let values: [f64; 3] = match data_type {
            DataType::Weather => {
                let yearly = (2.0 * PI * t / (24.0 * 365.0)).sin();
                [
                    15.0 + 10.0 * yearly + 5.0 * daily + 2.0 * gaussian(&mut rng),
                    (60.0 - 20.0 * daily + 5.0 * gaussian(&mut rng)).clamp(0.0, 100.0),
                    1013.0 + 10.0 * weekly + 2.0 * gaussian(&mut rng),
                ]
            }
            DataType::Electricity => [
                1000.0 + 300.0 * daily + 100.0 * weekly + 50.0 * gaussian(&mut rng),
                220.0 + 5.0 * gaussian(&mut rng),
                50.0 + 0.1 * gaussian(&mut rng),
            ],
            DataType::Traffic => {
                let flow = (500.0 + 300.0 * daily + 50.0 * gaussian(&mut rng)).max(0.0);
                [
                    flow,
                    (60.0 - 20.0 * daily + 5.0 * gaussian(&mut rng)).max(5.0),
                    (flow / 10.0 + 2.0 * gaussian(&mut rng)).clamp(0.0, 100.0),
                ]
            }
        };

        let stamp = start + Duration::hours(i as i64);
        let mut row = vec![stamp.format(TIMESTAMP_FORMAT).to_string()];
        row.extend(values.iter().map(|v| format!("{v:.4}")));
        out.push(row);
    }
    Table::new(headers, out)
}

/// Box-Muller sobre dos uniformes.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
