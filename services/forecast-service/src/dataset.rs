//! CSV dataset loading into feature rows and target vectors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("reading dataset {path}")]
    Csv { path: PathBuf, #[source] source: csv::Error },
    #[error("dataset {path} is missing columns {columns:?}")]
    MissingColumns { path: PathBuf, columns: Vec<String> },
    #[error("dataset {path} line {line}: column `{column}` value {value:?} is not a number")]
    Malformed { path: PathBuf, line: u64, column: String, value: String },
    #[error("dataset {0} has no rows")]
    Empty(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole { Categorical, Numeric }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub role: ColumnRole,
}

impl ColumnSpec {
    pub fn categorical(name: &str) -> Self { Self { name: name.to_string(), role: ColumnRole::Categorical } }
    pub fn numeric(name: &str) -> Self { Self { name: name.to_string(), role: ColumnRole::Numeric } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Text(String),
    Number(f64),
}

pub type FeatureRow = Vec<FeatureValue>;

#[derive(Debug, Clone, Default)]
pub struct TrainingFrame {
    pub features: Vec<FeatureRow>,
    pub targets: Vec<Vec<f64>>,
}

impl TrainingFrame {
    pub fn len(&self) -> usize { self.features.len() }
    pub fn is_empty(&self) -> bool { self.features.is_empty() }
}

pub fn load_frame(path: &Path, features: &[ColumnSpec], targets: &[String]) -> Result<TrainingFrame, DatasetError> {
    let csv_err = |source: csv::Error| DatasetError::Csv { path: path.to_path_buf(), source };
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path).map_err(csv_err)?;
    let headers = rdr.headers().map_err(csv_err)?.clone();
    let index_of = |name: &str| headers.iter().position(|h| h == name);

    let missing: Vec<String> = features.iter().map(|c| c.name.as_str())
        .chain(targets.iter().map(String::as_str))
        .filter(|name| index_of(*name).is_none())
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(DatasetError::MissingColumns { path: path.to_path_buf(), columns: missing });
    }
    // all present, checked above
    let feature_idx: Vec<usize> = features.iter().filter_map(|c| index_of(c.name.as_str())).collect();
    let target_idx: Vec<usize> = targets.iter().filter_map(|t| index_of(t.as_str())).collect();

    let mut frame = TrainingFrame::default();
    for record in rdr.records() {
        let record = record.map_err(csv_err)?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let number = |idx: usize, column: &str| -> Result<f64, DatasetError> {
            let raw = record.get(idx).unwrap_or("");
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(DatasetError::Malformed { path: path.to_path_buf(), line, column: column.to_string(), value: raw.to_string() }),
            }
        };
        let mut row = Vec::with_capacity(features.len());
        for (spec, &idx) in features.iter().zip(&feature_idx) {
            row.push(match spec.role {
                ColumnRole::Categorical => FeatureValue::Text(record.get(idx).unwrap_or("").to_string()),
                ColumnRole::Numeric => FeatureValue::Number(number(idx, spec.name.as_str())?),
            });
        }
        let mut target = Vec::with_capacity(targets.len());
        for (name, &idx) in targets.iter().zip(&target_idx) {
            target.push(number(idx, name.as_str())?);
        }
        frame.features.push(row);
        frame.targets.push(target);
    }
    if frame.is_empty() {
        return Err(DatasetError::Empty(path.to_path_buf()));
    }
    Ok(frame)
}
