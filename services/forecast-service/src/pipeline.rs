//! Fitted prediction pipelines: a feature encoder (one-hot categorical,
//! standardized numeric) feeding a multi-output ridge regressor.

use crate::dataset::{ColumnRole, ColumnSpec, FeatureRow, FeatureValue, TrainingFrame};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("estimator is not fitted")]
    NotFitted,
    #[error("expected {expected} feature values, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("column `{column}` expects a {expected} value")]
    WrongType { column: String, expected: &'static str },
    #[error("column `{column}` has no trained category {value:?}")]
    UnknownCategory { column: String, value: String },
    #[error("training frame has {features} feature rows but {targets} target rows")]
    ShapeMismatch { features: usize, targets: usize },
    #[error("normal equations are singular; cannot fit")]
    Singular,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnState {
    spec: ColumnSpec,
    /// Sorted category vocabulary (categorical columns only).
    #[serde(default)]
    vocabulary: Vec<String>,
    #[serde(default)]
    mean: f64,
    #[serde(default = "one")]
    scale: f64,
}

fn one() -> f64 { 1.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureEncoder {
    columns: Vec<ColumnState>,
}

impl FeatureEncoder {
    pub fn new(columns: &[ColumnSpec]) -> Self {
        Self { columns: columns.iter().map(|spec| ColumnState { spec: spec.clone(), vocabulary: Vec::new(), mean: 0.0, scale: 1.0 }).collect() }
    }

    pub fn fit(&mut self, rows: &[FeatureRow]) -> Result<(), PipelineError> {
        for (i, col) in self.columns.iter_mut().enumerate() {
            match col.spec.role {
                ColumnRole::Categorical => {
                    let mut seen = BTreeSet::new();
                    for row in rows {
                        match row.get(i) {
                            Some(FeatureValue::Text(s)) => { seen.insert(s.clone()); }
                            Some(_) => return Err(PipelineError::WrongType { column: col.spec.name.clone(), expected: "text" }),
                            None => return Err(PipelineError::Arity { expected: i + 1, got: row.len() }),
                        }
                    }
                    col.vocabulary = seen.into_iter().collect();
                }
                ColumnRole::Numeric => {
                    let mut values = Vec::with_capacity(rows.len());
                    for row in rows {
                        match row.get(i) {
                            Some(FeatureValue::Number(v)) => values.push(*v),
                            Some(_) => return Err(PipelineError::WrongType { column: col.spec.name.clone(), expected: "numeric" }),
                            None => return Err(PipelineError::Arity { expected: i + 1, got: row.len() }),
                        }
                    }
                    let n = values.len().max(1) as f64;
                    let mean = values.iter().sum::<f64>() / n;
                    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                    col.mean = mean;
                    col.scale = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
                }
            }
        }
        Ok(())
    }

    /// Width of the encoded vector.
    pub fn width(&self) -> usize {
        self.columns.iter().map(|c| match c.spec.role { ColumnRole::Categorical => c.vocabulary.len(), ColumnRole::Numeric => 1 }).sum()
    }

    pub fn transform(&self, row: &FeatureRow) -> Result<Vec<f64>, PipelineError> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::Arity { expected: self.columns.len(), got: row.len() });
        }
        let mut out = Vec::with_capacity(self.width());
        for (col, value) in self.columns.iter().zip(row) {
            match (col.spec.role, value) {
                (ColumnRole::Categorical, FeatureValue::Text(s)) => {
                    let idx = col.vocabulary.binary_search(s)
                        .map_err(|_| PipelineError::UnknownCategory { column: col.spec.name.clone(), value: s.clone() })?;
                    out.extend((0..col.vocabulary.len()).map(|j| if j == idx { 1.0 } else { 0.0 }));
                }
                (ColumnRole::Numeric, FeatureValue::Number(v)) => out.push((v - col.mean) / col.scale),
                (ColumnRole::Categorical, _) => return Err(PipelineError::WrongType { column: col.spec.name.clone(), expected: "text" }),
                (ColumnRole::Numeric, _) => return Err(PipelineError::WrongType { column: col.spec.name.clone(), expected: "numeric" }),
            }
        }
        Ok(out)
    }

    pub fn vocabularies(&self) -> BTreeMap<String, Vec<String>> {
        self.columns.iter()
            .filter(|c| c.spec.role == ColumnRole::Categorical)
            .map(|c| (c.spec.name.clone(), c.vocabulary.clone()))
            .collect()
    }
}

/// Least squares with an L2 penalty on every coefficient except the intercept.
/// One coefficient vector per target column; the intercept is stored last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeRegressor {
    alpha: f64,
    #[serde(default)]
    coefficients: Vec<Vec<f64>>,
}

impl RidgeRegressor {
    pub fn new(alpha: f64) -> Self { Self { alpha: alpha.max(1e-9), coefficients: Vec::new() } }

    pub fn is_fitted(&self) -> bool { !self.coefficients.is_empty() }

    pub fn fit(&mut self, x: &[Vec<f64>], y: &[Vec<f64>]) -> Result<(), PipelineError> {
        if x.len() != y.len() { return Err(PipelineError::ShapeMismatch { features: x.len(), targets: y.len() }); }
        let width = x.first().map(|r| r.len()).unwrap_or(0);
        let outputs = y.first().map(|r| r.len()).unwrap_or(0);
        let d = width + 1;
        let mut gram = vec![vec![0.0; d]; d];
        let mut rhs = vec![vec![0.0; d]; outputs];
        for (row, target) in x.iter().zip(y) {
            for i in 0..d {
                let xi = if i < width { row[i] } else { 1.0 };
                for j in i..d {
                    let xj = if j < width { row[j] } else { 1.0 };
                    gram[i][j] += xi * xj;
                }
                for (t, yt) in target.iter().enumerate() { rhs[t][i] += xi * yt; }
            }
        }
        for i in 0..d {
            for j in 0..i { gram[i][j] = gram[j][i]; }
            if i < width { gram[i][i] += self.alpha; }
        }
        self.coefficients = rhs.into_iter().map(|b| solve(gram.clone(), b)).collect::<Result<_, _>>()?;
        Ok(())
    }

    pub fn predict_one(&self, x: &[f64]) -> Result<Vec<f64>, PipelineError> {
        if !self.is_fitted() { return Err(PipelineError::NotFitted); }
        self.coefficients.iter().map(|w| {
            if w.len() != x.len() + 1 { return Err(PipelineError::Arity { expected: w.len() - 1, got: x.len() }); }
            Ok(x.iter().zip(w).map(|(a, b)| a * b).sum::<f64>() + w[x.len()])
        }).collect()
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, PipelineError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .ok_or(PipelineError::Singular)?;
        if a[pivot][col].abs() < 1e-12 { return Err(PipelineError::Singular); }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 { continue; }
            for k in col..n { a[row][k] -= factor * a[col][k]; }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

/// An untrained or trained estimator: encoder plus regressor, fitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimator {
    encoder: FeatureEncoder,
    regressor: RidgeRegressor,
}

impl Estimator {
    pub fn ridge(columns: &[ColumnSpec], alpha: f64) -> Self {
        Self { encoder: FeatureEncoder::new(columns), regressor: RidgeRegressor::new(alpha) }
    }

    pub fn fit(&mut self, frame: &TrainingFrame) -> Result<(), PipelineError> {
        if frame.features.len() != frame.targets.len() {
            return Err(PipelineError::ShapeMismatch { features: frame.features.len(), targets: frame.targets.len() });
        }
        self.encoder.fit(&frame.features)?;
        let x = frame.features.iter().map(|r| self.encoder.transform(r)).collect::<Result<Vec<_>, _>>()?;
        self.regressor.fit(&x, &frame.targets)
    }

    pub fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<Vec<f64>>, PipelineError> {
        rows.iter().map(|r| self.regressor.predict_one(&self.encoder.transform(r)?)).collect()
    }

    pub fn vocabularies(&self) -> BTreeMap<String, Vec<String>> { self.encoder.vocabularies() }
}

/// Single named stage wrapping the estimator; preprocessing stages would be
/// added ahead of it without changing this interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    stage: String,
    estimator: Estimator,
}

impl Pipeline {
    pub fn single(estimator: Estimator) -> Self { Self { stage: "model".into(), estimator } }
    pub fn stage(&self) -> &str { &self.stage }
    pub fn fit(&mut self, frame: &TrainingFrame) -> Result<(), PipelineError> { self.estimator.fit(frame) }
    pub fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<Vec<f64>>, PipelineError> { self.estimator.predict(rows) }
    pub fn vocabularies(&self) -> BTreeMap<String, Vec<String>> { self.estimator.vocabularies() }
}
