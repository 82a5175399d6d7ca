//! Stacking of heterogeneous backends behind a least-squares combiner.
//!
//! The combiner is fit exclusively on base predictions over the validation
//! set; it never sees a training-set prediction, so base overfit cannot leak
//! into the blend weights.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::{ModelError, Result};
use crate::models::ridge::{apply_linear, fit_least_squares};
use crate::models::{
    check_model_tag, load_backend, write_model_tag, RegressionBackend, SharedColumns,
    SharedFeatures,
};

pub const MODEL_TYPE: &str = "stacking";

const COMBINER_FILE: &str = "combiner.json";
const INFO_FILE: &str = "info.txt";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Combiner {
    weights: Vec<f64>,
    intercept: f64,
}

pub struct StackingEnsemble {
    generator: SharedFeatures,
    columns: SharedColumns,
    bases: Vec<Box<dyn RegressionBackend>>,
    train_only_combiner: bool,
    combiner: Option<Combiner>,
}

impl StackingEnsemble {
    pub fn new(
        generator: SharedFeatures,
        columns: SharedColumns,
        bases: Vec<Box<dyn RegressionBackend>>,
    ) -> Self {
        Self {
            generator,
            columns,
            bases,
            train_only_combiner: false,
            combiner: None,
        }
    }

    /// Shell filled in by [`RegressionBackend::load`].
    pub(crate) fn for_load(generator: SharedFeatures, columns: SharedColumns) -> Self {
        Self::new(generator, columns, Vec::new())
    }

    /// Keep the already-trained bases frozen and refit only the combiner.
    pub fn with_frozen_bases(mut self) -> Self {
        self.train_only_combiner = true;
        self
    }

    fn combiner(&self) -> Result<&Combiner> {
        self.combiner
            .as_ref()
            .ok_or_else(|| ModelError::training("stacking ensemble has not been trained"))
    }

    /// One row per input, one column per base model.
    fn base_predictions(&self, smiles: &[String], columns: &[i32]) -> Result<Vec<Vec<f32>>> {
        let mut rows = vec![Vec::with_capacity(self.bases.len()); smiles.len()];
        for base in &self.bases {
            let predictions = base.predict(smiles, columns)?;
            for (row, value) in rows.iter_mut().zip(predictions) {
                row.push(value);
            }
        }
        Ok(rows)
    }
}

impl RegressionBackend for StackingEnsemble {
    fn train(&mut self, train: &Dataset, validation: &Dataset) -> Result<()> {
        if self.bases.is_empty() {
            return Err(ModelError::invalid_parameter(
                "stacking ensemble needs at least one base model",
            ));
        }
        if !self.train_only_combiner {
            for (i, base) in self.bases.iter_mut().enumerate() {
                log::info!("training stacking base {i} ({})", base.model_type());
                base.train(train, validation)?;
            }
        }
        let design = self.base_predictions(&validation.all_smiles(), &validation.all_columns())?;
        let (weights, intercept) = fit_least_squares(&design, &validation.all_retentions())?;
        self.combiner = Some(Combiner { weights, intercept });
        Ok(())
    }

    fn predict(&self, smiles: &[String], columns: &[i32]) -> Result<Vec<f32>> {
        let combiner = self.combiner()?;
        let design = self.base_predictions(smiles, columns)?;
        Ok(apply_linear(&design, &combiner.weights, combiner.intercept))
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let combiner = self.combiner()?;
        write_model_tag(dir, MODEL_TYPE)?;
        std::fs::write(dir.join(INFO_FILE), format!("{}\n", self.bases.len()))?;
        for (i, base) in self.bases.iter().enumerate() {
            base.save(&dir.join(format!("base_{i}")))?;
        }
        let file = File::create(dir.join(COMBINER_FILE))?;
        serde_json::to_writer(BufWriter::new(file), combiner)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        check_model_tag(dir, MODEL_TYPE)?;
        let raw = std::fs::read_to_string(dir.join(INFO_FILE))?;
        let count: usize = raw
            .trim()
            .parse()
            .map_err(|_| ModelError::parse(format!("bad base-model count {raw:?}")))?;
        let mut bases = Vec::with_capacity(count);
        for i in 0..count {
            bases.push(load_backend(
                dir.join(format!("base_{i}")),
                self.generator.clone(),
                self.columns.clone(),
            )?);
        }
        let file = File::open(dir.join(COMBINER_FILE))?;
        let combiner: Combiner = serde_json::from_reader(BufReader::new(file))?;
        if combiner.weights.len() != count {
            return Err(ModelError::consistency(format!(
                "combiner has {} weights for {count} base models",
                combiner.weights.len()
            )));
        }
        self.bases = bases;
        self.combiner = Some(combiner);
        Ok(())
    }

    fn model_type(&self) -> &'static str {
        MODEL_TYPE
    }

    fn create_similar(&self) -> Box<dyn RegressionBackend> {
        // The combiner-only flag is configuration, not fitted state, so the
        // clone keeps it.
        Box::new(Self {
            generator: self.generator.clone(),
            columns: self.columns.clone(),
            bases: self.bases.iter().map(|b| b.create_similar()).collect(),
            train_only_combiner: self.train_only_combiner,
            combiner: None,
        })
    }

    fn set_tuning_log(&mut self, path: Option<PathBuf>) {
        for base in &mut self.bases {
            base.set_tuning_log(path.clone());
        }
    }
}
