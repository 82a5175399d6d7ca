//! Gradient-boosted regression trees with row subsampling and nested early
//! stopping: trees grow in fixed increments, the validation median absolute
//! error is checked after each increment, and boosting stops once no relative
//! improvement of at least 1% has shown up inside the patience window or the
//! tree ceiling is reached. The retained model is truncated to the best
//! validated round.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::{rng_from, Dataset};
use crate::error::{ModelError, Result};
use crate::features::assemble_features;
use crate::models::metrics::{median, AccuracyReport};
use crate::models::search::{log_uniform, random_search, uniform, uniform_int, TuningConfig};
use crate::models::{
    check_model_tag, write_model_tag, RegressionBackend, SharedColumns, SharedFeatures,
};

pub const MODEL_TYPE: &str = "gbt";

const VALIDATE_EVERY: usize = 50;
const PATIENCE_TREES: usize = 249;
const MIN_RELATIVE_IMPROVEMENT: f32 = 0.01;
const MAX_TREES: usize = 5000;
const TREES_FILE: &str = "trees.json";

#[derive(Debug, Clone, Copy)]
struct GbtParams {
    eta: f64,
    lambda: f64,
    subsample: f64,
    max_depth: u32,
    min_child_weight: u32,
    seed: u64,
}

impl GbtParams {
    fn sample(rng: &mut rand_pcg::Pcg64) -> Self {
        Self {
            eta: log_uniform(rng, 0.01, 0.45),
            lambda: log_uniform(rng, 0.01, 15.0),
            subsample: uniform(rng, 0.3, 1.0),
            max_depth: uniform_int(rng, 1, 24),
            min_child_weight: uniform_int(rng, 1, 24),
            seed: rng.gen(),
        }
    }
}

impl fmt::Display for GbtParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "eta: {} lambda: {} subsample: {} max_depth: {} min_child_weight: {}",
            self.eta, self.lambda, self.subsample, self.max_depth, self.min_child_weight
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TreeNode {
    Leaf {
        value: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn predict(&self, row: &[f32]) -> f32 {
        match self {
            TreeNode::Leaf { value } => *value,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] < *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GbtModel {
    base: f32,
    eta: f32,
    trees: Vec<TreeNode>,
}

impl GbtModel {
    fn predict_row(&self, row: &[f32]) -> f32 {
        let boost: f32 = self.trees.iter().map(|t| t.predict(row)).sum();
        self.base + self.eta * boost
    }
}

pub struct GbtBackend {
    generator: SharedFeatures,
    columns: SharedColumns,
    tuning: TuningConfig,
    model: Option<GbtModel>,
}

impl GbtBackend {
    pub fn new(generator: SharedFeatures, columns: SharedColumns) -> Self {
        Self {
            generator,
            columns,
            tuning: TuningConfig::default(),
            model: None,
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

    fn model(&self) -> Result<&GbtModel> {
        self.model
            .as_ref()
            .ok_or_else(|| ModelError::training("gbt backend has not been trained"))
    }
}

impl RegressionBackend for GbtBackend {
    fn train(&mut self, train: &Dataset, validation: &Dataset) -> Result<()> {
        let train_x = self.features_of(train)?;
        let train_y = train.all_retentions();
        let val_x = self.features_of(validation)?;
        let val_y = validation.all_retentions();

        let outcome = random_search(
            &self.tuning,
            GbtParams::sample,
            |params| {
                let (_, report) = fit_gbt(&train_x, &train_y, &val_x, &val_y, params)?;
                Ok(report)
            },
        )?;

        log::info!(
            "gbt search done ({} ok, {} failed), refitting with {}",
            outcome.evaluated,
            outcome.failed,
            outcome.best_params
        );
        let (model, report) = fit_gbt(&train_x, &train_y, &val_x, &val_y, &outcome.best_params)?;
        log::info!("gbt refit: {} trees, {report}", model.trees.len());
        self.model = Some(model);
        Ok(())
    }

    fn predict(&self, smiles: &[String], columns: &[i32]) -> Result<Vec<f32>> {
        let model = self.model()?;
        let rows = assemble_features(
            self.generator.as_ref(),
            self.columns.as_ref(),
            smiles,
            columns,
        )?;
        Ok(rows.iter().map(|row| model.predict_row(row)).collect())
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let model = self.model()?;
        write_model_tag(dir, MODEL_TYPE)?;
        let file = File::create(dir.join(TREES_FILE))?;
        serde_json::to_writer(BufWriter::new(file), model)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        check_model_tag(dir, MODEL_TYPE)?;
        let file = File::open(dir.join(TREES_FILE))?;
        self.model = Some(serde_json::from_reader(BufReader::new(file))?);
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
            model: None,
        })
    }

    fn set_tuning_log(&mut self, path: Option<PathBuf>) {
        self.tuning.log = path;
    }
}

/// One full boosted fit with early stopping. Returns the truncated model and
/// the validation report at its best round.
fn fit_gbt(
    train_x: &[Vec<f32>],
    train_y: &[f32],
    val_x: &[Vec<f32>],
    val_y: &[f32],
    params: &GbtParams,
) -> Result<(GbtModel, AccuracyReport)> {
    if train_x.is_empty() || val_x.is_empty() {
        return Err(ModelError::training("cannot boost on an empty set"));
    }
    let n = train_x.len();
    let base = crate::models::metrics::mean(train_y);
    let eta = params.eta as f32;
    let mut rng = rng_from(Some(params.seed));

    let mut trees: Vec<TreeNode> = Vec::new();
    let mut train_pred = vec![base; n];
    let mut val_pred = vec![base; val_x.len()];

    let mut best_mdae = f32::INFINITY;
    let mut best_len = 0usize;
    let mut best_val_pred = val_pred.clone();

    let rows_per_tree = ((n as f64 * params.subsample).round() as usize).clamp(1, n);

    for round in 1..=MAX_TREES {
        let residuals: Vec<f32> = train_y
            .iter()
            .zip(train_pred.iter())
            .map(|(&y, &p)| y - p)
            .collect();
        let rows = rand::seq::index::sample(&mut rng, n, rows_per_tree).into_vec();
        let tree = grow_tree(
            train_x,
            &residuals,
            &rows,
            params.max_depth,
            params.lambda,
            params.min_child_weight as usize,
        );
        for (pred, row) in train_pred.iter_mut().zip(train_x.iter()) {
            *pred += eta * tree.predict(row);
        }
        for (pred, row) in val_pred.iter_mut().zip(val_x.iter()) {
            *pred += eta * tree.predict(row);
        }
        trees.push(tree);

        if round % VALIDATE_EVERY == 0 {
            let deltas: Vec<f32> = val_y
                .iter()
                .zip(val_pred.iter())
                .map(|(&y, &p)| (y - p).abs())
                .collect();
            let mdae = median(&deltas);
            if mdae < best_mdae * (1.0 - MIN_RELATIVE_IMPROVEMENT) {
                best_mdae = mdae;
                best_len = round;
                best_val_pred.copy_from_slice(&val_pred);
            } else if round - best_len > PATIENCE_TREES {
                break;
            }
        }
    }

    trees.truncate(best_len);
    let model = GbtModel { base, eta, trees };
    let report = AccuracyReport::compute(&best_val_pred, val_y, false)?;
    Ok((model, report))
}

/// Grows one regression tree on the residuals of the sampled rows.
fn grow_tree(
    x: &[Vec<f32>],
    grad: &[f32],
    rows: &[usize],
    depth_left: u32,
    lambda: f64,
    min_child: usize,
) -> TreeNode {
    let grad_sum: f64 = rows.iter().map(|&i| grad[i] as f64).sum();
    let leaf = || TreeNode::Leaf {
        value: (grad_sum / (rows.len() as f64 + lambda)) as f32,
    };
    if depth_left == 0 || rows.len() < 2 * min_child {
        return leaf();
    }

    let width = x[rows[0]].len();
    let parent_score = grad_sum * grad_sum / (rows.len() as f64 + lambda);
    let best = (0..width)
        .into_par_iter()
        .filter_map(|feature| best_split(x, grad, rows, feature, lambda, min_child, parent_score))
        .max_by(|a, b| a.gain.total_cmp(&b.gain));

    let Some(split) = best else {
        return leaf();
    };
    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
        .iter()
        .copied()
        .partition(|&i| x[i][split.feature] < split.threshold);
    TreeNode::Split {
        feature: split.feature,
        threshold: split.threshold,
        left: Box::new(grow_tree(
            x,
            grad,
            &left_rows,
            depth_left - 1,
            lambda,
            min_child,
        )),
        right: Box::new(grow_tree(
            x,
            grad,
            &right_rows,
            depth_left - 1,
            lambda,
            min_child,
        )),
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f32,
    gain: f64,
}

fn best_split(
    x: &[Vec<f32>],
    grad: &[f32],
    rows: &[usize],
    feature: usize,
    lambda: f64,
    min_child: usize,
    parent_score: f64,
) -> Option<SplitCandidate> {
    let mut ordered: Vec<(f32, f64)> = rows
        .iter()
        .map(|&i| (x[i][feature], grad[i] as f64))
        .collect();
    ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = ordered.iter().map(|&(_, g)| g).sum();
    let n = ordered.len();
    let mut left_sum = 0.0f64;
    let mut best: Option<SplitCandidate> = None;

    for i in 0..n - 1 {
        left_sum += ordered[i].1;
        if ordered[i].0 == ordered[i + 1].0 {
            continue;
        }
        let left_n = i + 1;
        let right_n = n - left_n;
        if left_n < min_child || right_n < min_child {
            continue;
        }
        let right_sum = total - left_sum;
        let gain = left_sum * left_sum / (left_n as f64 + lambda)
            + right_sum * right_sum / (right_n as f64 + lambda)
            - parent_score;
        if gain > 0.0 && best.as_ref().map_or(true, |b| gain > b.gain) {
            best = Some(SplitCandidate {
                feature,
                threshold: (ordered[i].0 + ordered[i + 1].0) / 2.0,
                gain,
            });
        }
    }
    best
}
