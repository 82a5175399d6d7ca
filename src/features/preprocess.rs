//! Feature post-processing fitted on the training set and replayed verbatim
//! at inference time: NaN replacement, constant-column removal, and 0..1
//! scaling. The fitted state is serializable so a saved model reproduces the
//! exact training-time feature space.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::features::FeatureGenerator;

/// A fitted, replayable transform over feature matrices.
pub trait FeaturePreprocessor: Send + Sync {
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<()>;

    fn apply(&self, features: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>>;

    /// Output width given the input width, once fitted.
    fn output_width(&self, input_width: usize) -> usize;
}

/// Replaces NaN and infinite values with zero. Stateless.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceNans;

impl FeaturePreprocessor for ReplaceNans {
    fn fit(&mut self, _features: &[Vec<f32>]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, mut features: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        for row in &mut features {
            for v in row.iter_mut() {
                if !v.is_finite() {
                    *v = 0.0;
                }
            }
        }
        Ok(features)
    }

    fn output_width(&self, input_width: usize) -> usize {
        input_width
    }
}

/// Drops columns whose value never varies on the training set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropConstant {
    keep: Vec<usize>,
    fitted_width: usize,
}

impl FeaturePreprocessor for DropConstant {
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<()> {
        let first = features
            .first()
            .ok_or_else(|| ModelError::training("cannot fit preprocessor on empty matrix"))?;
        self.fitted_width = first.len();
        self.keep = (0..first.len())
            .filter(|&j| features.iter().any(|row| (row[j] - first[j]).abs() > 1e-5))
            .collect();
        Ok(())
    }

    fn apply(&self, features: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        features
            .into_iter()
            .map(|row| {
                if row.len() != self.fitted_width {
                    return Err(ModelError::consistency(format!(
                        "row width {} does not match fitted width {}",
                        row.len(),
                        self.fitted_width
                    )));
                }
                Ok(self.keep.iter().map(|&j| row[j]).collect())
            })
            .collect()
    }

    fn output_width(&self, _input_width: usize) -> usize {
        self.keep.len()
    }
}

/// Min-max scales every column into [0, 1] using training-set bounds.
/// Out-of-range inference values extrapolate linearly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScaleToUnit {
    mins: Vec<f32>,
    spans: Vec<f32>,
}

impl FeaturePreprocessor for ScaleToUnit {
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<()> {
        let first = features
            .first()
            .ok_or_else(|| ModelError::training("cannot fit preprocessor on empty matrix"))?;
        let width = first.len();
        let mut mins = vec![f32::INFINITY; width];
        let mut maxs = vec![f32::NEG_INFINITY; width];
        for row in features {
            for j in 0..width {
                mins[j] = mins[j].min(row[j]);
                maxs[j] = maxs[j].max(row[j]);
            }
        }
        self.spans = mins
            .iter()
            .zip(maxs.iter())
            .map(|(&lo, &hi)| if hi > lo { hi - lo } else { 1.0 })
            .collect();
        self.mins = mins;
        Ok(())
    }

    fn apply(&self, mut features: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        for row in &mut features {
            if row.len() != self.mins.len() {
                return Err(ModelError::consistency(format!(
                    "row width {} does not match fitted width {}",
                    row.len(),
                    self.mins.len()
                )));
            }
            for j in 0..row.len() {
                row[j] = (row[j] - self.mins[j]) / self.spans[j];
            }
        }
        Ok(features)
    }

    fn output_width(&self, input_width: usize) -> usize {
        input_width
    }
}

/// Standard chain: NaN replacement, constant-column drop, then unit scaling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessorChain {
    replace_nans: ReplaceNans,
    drop_constant: DropConstant,
    scale: ScaleToUnit,
}

impl PreprocessorChain {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

impl FeaturePreprocessor for PreprocessorChain {
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<()> {
        self.replace_nans.fit(features)?;
        let cleaned = self.replace_nans.apply(features.to_vec())?;
        self.drop_constant.fit(&cleaned)?;
        let reduced = self.drop_constant.apply(cleaned)?;
        self.scale.fit(&reduced)
    }

    fn apply(&self, features: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let features = self.replace_nans.apply(features)?;
        let features = self.drop_constant.apply(features)?;
        self.scale.apply(features)
    }

    fn output_width(&self, input_width: usize) -> usize {
        self.scale
            .output_width(self.drop_constant.output_width(input_width))
    }
}

/// A feature generator composed with a fitted preprocessor chain.
pub struct PreprocessedFeatureGenerator<G: FeatureGenerator> {
    inner: G,
    chain: PreprocessorChain,
    width: usize,
}

impl<G: FeatureGenerator> PreprocessedFeatureGenerator<G> {
    /// Fits the chain on the features of `train_smiles` and freezes it.
    pub fn fit(inner: G, train_smiles: &[String]) -> Result<Self> {
        inner.precompute(train_smiles)?;
        let raw = inner.features(train_smiles)?;
        let mut chain = PreprocessorChain::default();
        chain.fit(&raw)?;
        let width = chain.output_width(inner.num_features());
        Ok(Self {
            inner,
            chain,
            width,
        })
    }

    pub fn from_parts(inner: G, chain: PreprocessorChain) -> Self {
        let width = chain.output_width(inner.num_features());
        Self {
            inner,
            chain,
            width,
        }
    }

    pub fn chain(&self) -> &PreprocessorChain {
        &self.chain
    }
}

impl<G: FeatureGenerator> FeatureGenerator for PreprocessedFeatureGenerator<G> {
    fn precompute(&self, smiles: &[String]) -> Result<()> {
        self.inner.precompute(smiles)
    }

    fn features(&self, smiles: &[String]) -> Result<Vec<Vec<f32>>> {
        self.chain.apply(self.inner.features(smiles)?)
    }

    fn num_features(&self) -> usize {
        self.width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::CachedFeatureGenerator;

    #[test]
    fn replace_nans_zeroes_nonfinite() {
        let p = ReplaceNans;
        let out = p
            .apply(vec![vec![1.0, f32::NAN, f32::INFINITY]])
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0, 0.0]]);
    }

    #[test]
    fn drop_constant_removes_flat_columns() {
        let mut p = DropConstant::default();
        let data = vec![vec![1.0, 5.0, 0.0], vec![2.0, 5.0, 0.0], vec![3.0, 5.0, 0.0]];
        p.fit(&data).unwrap();
        let out = p.apply(data).unwrap();
        assert_eq!(out, vec![vec![1.0], vec![2.0], vec![3.0]]);
    }

    #[test]
    fn scale_to_unit_bounds_training_data() {
        let mut p = ScaleToUnit::default();
        let data = vec![vec![0.0], vec![5.0], vec![10.0]];
        p.fit(&data).unwrap();
        let out = p.apply(data).unwrap();
        assert_eq!(out, vec![vec![0.0], vec![0.5], vec![1.0]]);
        // Out-of-range values extrapolate rather than clamp.
        let out = p.apply(vec![vec![20.0]]).unwrap();
        assert_eq!(out, vec![vec![2.0]]);
    }

    #[test]
    fn chain_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preproc.json");
        let mut chain = PreprocessorChain::default();
        let data = vec![vec![1.0, 7.0], vec![3.0, 7.0], vec![5.0, 7.0]];
        chain.fit(&data).unwrap();
        chain.save(&path).unwrap();
        let loaded = PreprocessorChain::load(&path).unwrap();
        let a = chain.apply(data.clone()).unwrap();
        let b = loaded.apply(data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn preprocessed_generator_reports_reduced_width() {
        let gen = CachedFeatureGenerator::new(2, |s: &str| Ok(vec![s.len() as f32, 1.0]));
        let train: Vec<String> = vec!["C".into(), "CC".into(), "CCC".into()];
        let gen = PreprocessedFeatureGenerator::fit(gen, &train).unwrap();
        assert_eq!(gen.num_features(), 1);
        let rows = gen.features(&train).unwrap();
        assert_eq!(rows, vec![vec![0.0], vec![0.5], vec![1.0]]);
    }
}
