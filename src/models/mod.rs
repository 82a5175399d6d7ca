//! Regression backends over retention datasets.
//!
//! Every model persists to a directory whose `model_type.txt` names the
//! backend; loading a directory whose tag does not match the expected type
//! is a consistency error, never a silent fallback.

pub mod cluster_ensemble;
pub mod gbt;
pub mod metrics;
pub mod ridge;
pub mod search;
pub mod stacking;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dataset::Dataset;
use crate::error::{ModelError, Result};
use crate::features::{ColumnFeatures, FeatureGenerator};
use metrics::AccuracyReport;

pub type SharedFeatures = Arc<dyn FeatureGenerator>;
pub type SharedColumns = Arc<dyn ColumnFeatures>;

/// A trainable retention-index regressor.
///
/// `train` runs the backend's full protocol, hyperparameter search included.
/// `create_similar` clones the configuration (feature generator, tuning
/// settings) and discards any learned state, producing a fresh untrained
/// instance for ensembles to fan out.
pub trait RegressionBackend: Send + Sync {
    fn train(&mut self, train: &Dataset, validation: &Dataset) -> Result<()>;

    fn predict(&self, smiles: &[String], columns: &[i32]) -> Result<Vec<f32>>;

    fn save(&self, dir: &Path) -> Result<()>;

    fn load(&mut self, dir: &Path) -> Result<()>;

    fn model_type(&self) -> &'static str;

    fn create_similar(&self) -> Box<dyn RegressionBackend>;

    fn set_tuning_log(&mut self, path: Option<PathBuf>);

    fn predict_dataset(&self, data: &Dataset) -> Result<Vec<f32>> {
        self.predict(&data.all_smiles(), &data.all_columns())
    }

    fn validate(&self, data: &Dataset, extended: bool) -> Result<AccuracyReport> {
        let predictions = self.predict_dataset(data)?;
        AccuracyReport::compute(&predictions, &data.all_retentions(), extended)
    }
}

/// Constructs an untrained backend of the given tag.
pub fn backend_from_tag(
    tag: &str,
    generator: SharedFeatures,
    columns: SharedColumns,
) -> Result<Box<dyn RegressionBackend>> {
    match tag {
        ridge::MODEL_TYPE => Ok(Box::new(ridge::RidgeBackend::new(generator, columns))),
        gbt::MODEL_TYPE => Ok(Box::new(gbt::GbtBackend::new(generator, columns))),
        cluster_ensemble::MODEL_TYPE => Ok(Box::new(cluster_ensemble::ClusterEnsemble::for_load(
            generator, columns,
        ))),
        stacking::MODEL_TYPE => Ok(Box::new(stacking::StackingEnsemble::for_load(
            generator, columns,
        ))),
        other => Err(ModelError::unknown_model_type(other)),
    }
}

/// Reads the tag of a saved model directory and loads the matching backend.
pub fn load_backend(
    dir: impl AsRef<Path>,
    generator: SharedFeatures,
    columns: SharedColumns,
) -> Result<Box<dyn RegressionBackend>> {
    let dir = dir.as_ref();
    let tag = read_model_tag(dir)?;
    let mut backend = backend_from_tag(&tag, generator, columns)?;
    backend.load(dir)?;
    Ok(backend)
}

pub(crate) const MODEL_TAG_FILE: &str = "model_type.txt";

pub(crate) fn write_model_tag(dir: &Path, tag: &str) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(MODEL_TAG_FILE), format!("{tag}\n"))?;
    Ok(())
}

pub(crate) fn read_model_tag(dir: &Path) -> Result<String> {
    let raw = fs::read_to_string(dir.join(MODEL_TAG_FILE))?;
    Ok(raw.trim().to_string())
}

pub(crate) fn check_model_tag(dir: &Path, expected: &str) -> Result<()> {
    let found = read_model_tag(dir)?;
    if found != expected {
        return Err(ModelError::consistency(format!(
            "model directory {} holds type {found:?}, expected {expected:?}",
            dir.display()
        )));
    }
    Ok(())
}
