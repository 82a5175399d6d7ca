//! Ridge regression over assembled feature rows.
//!
//! Fitting goes through the normal equations with f64 accumulation and a
//! Cholesky solve; the intercept rides along as an extra unregularized
//! column. The l2 strength is chosen by the shared random search, sampled
//! log-uniformly over [1e-9, 1e5].

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::{ModelError, Result};
use crate::features::assemble_features;
use crate::models::metrics::AccuracyReport;
use crate::models::search::{log_uniform, random_search, TuningConfig};
use crate::models::{
    check_model_tag, write_model_tag, RegressionBackend, SharedColumns, SharedFeatures,
};

pub const MODEL_TYPE: &str = "ridge";

const L2_LOW: f64 = 1e-9;
const L2_HIGH: f64 = 1e5;
const WEIGHTS_FILE: &str = "weights.json";

#[derive(Debug, Clone, Copy)]
struct RidgeParams {
    l2: f64,
}

impl fmt::Display for RidgeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l2: {}", self.l2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RidgeState {
    weights: Vec<f64>,
    intercept: f64,
    l2: f64,
}

pub struct RidgeBackend {
    generator: SharedFeatures,
    columns: SharedColumns,
    tuning: TuningConfig,
    state: Option<RidgeState>,
}

impl RidgeBackend {
    pub fn new(generator: SharedFeatures, columns: SharedColumns) -> Self {
        Self {
            generator,
            columns,
            tuning: TuningConfig::default(),
            state: None,
        }
    }

    pub fn with_tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    fn features_of(&self, data: &Dataset) -> Result<Vec<Vec<f32>>> {
        assemble_features(
            self.generator.as_ref(),
            self.columns.as_ref(),
            &data.all_smiles(),
            &data.all_columns(),
        )
    }

    fn state(&self) -> Result<&RidgeState> {
        self.state
            .as_ref()
            .ok_or_else(|| ModelError::training("ridge backend has not been trained"))
    }
}

impl RegressionBackend for RidgeBackend {
    fn train(&mut self, train: &Dataset, validation: &Dataset) -> Result<()> {
        let train_x = self.features_of(train)?;
        let train_y = train.all_retentions();
        let val_x = self.features_of(validation)?;
        let val_y = validation.all_retentions();

        let outcome = random_search(
            &self.tuning,
            |rng| RidgeParams {
                l2: log_uniform(rng, L2_LOW, L2_HIGH),
            },
            |params| {
                let (weights, intercept) = fit_ridge(&train_x, &train_y, params.l2)?;
                let predictions = apply_linear(&val_x, &weights, intercept);
                AccuracyReport::compute(&predictions, &val_y, false)
            },
        )?;

        log::info!(
            "ridge search done ({} ok, {} failed), refitting with {}",
            outcome.evaluated,
            outcome.failed,
            outcome.best_params
        );
        let l2 = outcome.best_params.l2;
        let (weights, intercept) = fit_ridge(&train_x, &train_y, l2)?;
        self.state = Some(RidgeState {
            weights,
            intercept,
            l2,
        });
        Ok(())
    }

    fn predict(&self, smiles: &[String], columns: &[i32]) -> Result<Vec<f32>> {
        let state = self.state()?;
        let rows = assemble_features(
            self.generator.as_ref(),
            self.columns.as_ref(),
            smiles,
            columns,
        )?;
        for row in &rows {
            if row.len() != state.weights.len() {
                return Err(ModelError::consistency(format!(
                    "feature width {} does not match fitted width {}",
                    row.len(),
                    state.weights.len()
                )));
            }
        }
        Ok(apply_linear(&rows, &state.weights, state.intercept))
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let state = self.state()?;
        write_model_tag(dir, MODEL_TYPE)?;
        let file = File::create(dir.join(WEIGHTS_FILE))?;
        serde_json::to_writer(BufWriter::new(file), state)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        check_model_tag(dir, MODEL_TYPE)?;
        let file = File::open(dir.join(WEIGHTS_FILE))?;
        self.state = Some(serde_json::from_reader(BufReader::new(file))?);
        Ok(())
    }

    fn model_type(&self) -> &'static str {
        MODEL_TYPE
    }

    fn create_similar(&self) -> Box<dyn RegressionBackend> {
        Box::new(Self {
            generator: self.generator.clone(),
            columns: self.columns.clone(),
            tuning: self.tuning.clone(),
            state: None,
        })
    }

    fn set_tuning_log(&mut self, path: Option<PathBuf>) {
        self.tuning.log = path;
    }
}

/// Fits weights and intercept minimizing ||Xw + b - y||² + l2·||w||².
/// The intercept is not regularized.
fn fit_ridge(features: &[Vec<f32>], labels: &[f32], l2: f64) -> Result<(Vec<f64>, f64)> {
    if features.is_empty() {
        return Err(ModelError::training("cannot fit ridge on an empty set"));
    }
    let width = features[0].len();
    let dim = width + 1; // intercept column appended last

    let mut gram = vec![vec![0.0f64; dim]; dim];
    let mut moment = vec![0.0f64; dim];
    for (row, &y) in features.iter().zip(labels.iter()) {
        for i in 0..width {
            let xi = row[i] as f64;
            for j in i..width {
                gram[i][j] += xi * row[j] as f64;
            }
            gram[i][width] += xi;
            moment[i] += xi * y as f64;
        }
        gram[width][width] += 1.0;
        moment[width] += y as f64;
    }
    for i in 0..dim {
        for j in 0..i {
            gram[i][j] = gram[j][i];
        }
    }
    for (i, row) in gram.iter_mut().enumerate().take(width) {
        row[i] += l2;
    }

    let solution = cholesky_solve(gram, &moment)?;
    let intercept = solution[width];
    let mut weights = solution;
    weights.truncate(width);
    Ok((weights, intercept))
}

/// Solves a symmetric positive-definite system in place.
pub(crate) fn cholesky_solve(mut a: Vec<Vec<f64>>, b: &[f64]) -> Result<Vec<f64>> {
    let n = b.len();
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i][j];
            for k in 0..j {
                sum -= a[i][k] * a[j][k];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(ModelError::training(
                        "normal equations are not positive definite",
                    ));
                }
                a[i][j] = sum.sqrt();
            } else {
                a[i][j] = sum / a[j][j];
            }
        }
    }
    // Forward then back substitution on the factor.
    let mut x = b.to_vec();
    for i in 0..n {
        for k in 0..i {
            x[i] -= a[i][k] * x[k];
        }
        x[i] /= a[i][i];
    }
    for i in (0..n).rev() {
        for k in (i + 1)..n {
            x[i] -= a[k][i] * x[k];
        }
        x[i] /= a[i][i];
    }
    Ok(x)
}

/// Unregularized least squares through the same solver, with a small jitter
/// to keep the factorization stable on collinear designs.
pub(crate) fn fit_least_squares(features: &[Vec<f32>], labels: &[f32]) -> Result<(Vec<f64>, f64)> {
    fit_ridge(features, labels, 1e-6)
}

pub(crate) fn apply_linear(features: &[Vec<f32>], weights: &[f64], intercept: f64) -> Vec<f32> {
    features
        .iter()
        .map(|row| {
            let dot: f64 = row
                .iter()
                .zip(weights.iter())
                .map(|(&x, &w)| x as f64 * w)
                .sum();
            (dot + intercept) as f32
        })
        .collect()
}
