//! Compound-disjoint k-fold cross-validation.
//!
//! Folds are cut on compounds, never on records, so no structure ever sits on
//! both sides of a fold boundary. The last designated fold, sized one fold
//! plus any division remainder, stays on the training side of every cycle and
//! is never scored; only the first k-1 folds are held out in turn. The pooled
//! report over all held-out predictions is the canonical result; per-fold
//! reports are kept for inspection.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::dataset::identity::CompoundIdentity;
use crate::dataset::{rng_from, Dataset, SplitSize};
use crate::error::{ModelError, Result};
use crate::models::metrics::AccuracyReport;
use crate::models::RegressionBackend;

pub struct CrossValidator {
    folds: usize,
    validation_fraction: f32,
    seed: Option<u64>,
    log: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CrossValidationOutcome {
    /// One report per held-out fold, so k-1 entries for k folds.
    pub fold_reports: Vec<AccuracyReport>,
    /// Computed over the union of all held-out predictions.
    pub pooled: AccuracyReport,
}

impl CrossValidator {
    pub fn new(folds: usize) -> Self {
        Self {
            folds,
            validation_fraction: 0.1,
            seed: None,
            log: None,
        }
    }

    /// Fraction of each fold's training compounds carved out as the internal
    /// validation set for hyperparameter search and early stopping.
    pub fn with_validation_fraction(mut self, fraction: f32) -> Self {
        self.validation_fraction = fraction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }

    pub fn run(
        &self,
        data: &Dataset,
        prototype: &dyn RegressionBackend,
        identity: &dyn CompoundIdentity,
    ) -> Result<CrossValidationOutcome> {
        if self.folds < 2 {
            return Err(ModelError::invalid_parameter(
                "cross-validation needs at least 2 folds",
            ));
        }
        let mut log_file = match &self.log {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };

        // Canonicalize once so fold membership and overlap checks share one
        // identity scheme.
        let mut data = data.clone();
        data.canonicalize_all(identity)?;

        let mut compounds: Vec<String> = data.compounds().into_iter().collect();
        compounds.sort_unstable();
        if compounds.len() < self.folds {
            return Err(ModelError::invalid_parameter(format!(
                "{} compounds cannot form {} folds",
                compounds.len(),
                self.folds
            )));
        }
        {
            use rand::seq::SliceRandom;
            let mut rng = rng_from(self.seed);
            compounds.shuffle(&mut rng);
        }
        let fold_size = compounds.len() / self.folds;
        // The last fold absorbs the division remainder and is never held out.
        let fold_of: HashMap<&str, usize> = compounds
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), (i / fold_size).min(self.folds - 1)))
            .collect();

        let held_out = self.folds - 1;
        let mut fold_reports = Vec::with_capacity(held_out);
        let mut pooled_predictions = Vec::new();
        let mut pooled_labels = Vec::new();

        for fold in 0..held_out {
            let mut test = Dataset::empty();
            let mut train = Dataset::empty();
            for record in data.iter() {
                if fold_of.get(record.smiles.as_str()) == Some(&fold) {
                    test.push(record.clone());
                } else {
                    train.push(record.clone());
                }
            }
            train.filter_out_compounds(&test, identity)?;
            let overlap = train.count_identical(&test, identity)?;
            if overlap != 0 {
                return Err(ModelError::consistency(format!(
                    "fold {fold}: {overlap} compounds shared between train and test"
                )));
            }

            let validation = train.split_by_compounds(
                SplitSize::Fraction(self.validation_fraction),
                self.seed.map(|s| s.wrapping_add(fold as u64)),
            );

            let mut model = prototype.create_similar();
            model.train(&train, &validation)?;
            let predictions = model.predict_dataset(&test)?;
            let labels = test.all_retentions();
            let report = AccuracyReport::compute(&predictions, &labels, false)?;
            log::info!("fold {fold}: {report}");
            if let Some(file) = log_file.as_mut() {
                writeln!(
                    file,
                    "{} fold {fold} (test {} records): {report}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    test.len()
                )?;
            }
            pooled_predictions.extend(predictions);
            pooled_labels.extend(labels);
            fold_reports.push(report);
        }

        let pooled = AccuracyReport::compute(&pooled_predictions, &pooled_labels, true)?;
        log::info!("pooled over {held_out} held-out folds: {pooled}");
        if let Some(file) = log_file.as_mut() {
            writeln!(
                file,
                "{} pooled: {pooled}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            )?;
        }
        Ok(CrossValidationOutcome {
            fold_reports,
            pooled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::identity::RawSmiles;
    use crate::dataset::Record;
    use crate::features::{CachedFeatureGenerator, NoColumnFeatures};
    use crate::models::ridge::RidgeBackend;
    use crate::models::search::TuningConfig;
    use crate::models::{SharedColumns, SharedFeatures};
    use std::sync::Arc;

    fn linear_dataset(n: usize) -> Dataset {
        let mut records = Vec::new();
        for i in 1..=n {
            // Two repeat measurements per compound.
            records.push(Record::new("C".repeat(i), 100.0 * i as f32 + 50.0, 0));
            records.push(Record::new("C".repeat(i), 100.0 * i as f32 + 51.0, 1));
        }
        Dataset::new(records)
    }

    fn ridge_prototype() -> RidgeBackend {
        let gen: SharedFeatures = Arc::new(CachedFeatureGenerator::new(1, |s: &str| {
            Ok(vec![s.len() as f32])
        }));
        let cols: SharedColumns = Arc::new(NoColumnFeatures);
        RidgeBackend::new(gen, cols).with_tuning(TuningConfig::new(8).with_seed(31))
    }

    #[test]
    fn pooled_report_covers_all_folded_records() {
        let data = linear_dataset(40);
        let cv = CrossValidator::new(4).with_seed(2);
        let outcome = cv.run(&data, &ridge_prototype(), &RawSmiles).unwrap();
        // 40 compounds over 4 folds: the first three folds of 10 compounds
        // each get scored, the fourth stays in every training set.
        assert_eq!(outcome.fold_reports.len(), 3);
        assert!(outcome.pooled.mae < 5.0, "MAE {}", outcome.pooled.mae);
        assert!(outcome.pooled.extended.is_some());
    }

    #[test]
    fn last_fold_and_remainder_never_get_scored() {
        // 41 compounds over 4 folds: three held-out folds of 10 compounds,
        // the last 11 (a full fold plus the remainder) only ever train.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cv.txt");
        let data = linear_dataset(41);
        let cv = CrossValidator::new(4).with_seed(7).with_log(&path);
        let outcome = cv.run(&data, &ridge_prototype(), &RawSmiles).unwrap();
        assert_eq!(outcome.fold_reports.len(), 3);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut scored = 0usize;
        for line in contents.lines() {
            if let Some(rest) = line.split("(test ").nth(1) {
                scored += rest
                    .split_whitespace()
                    .next()
                    .unwrap()
                    .parse::<usize>()
                    .unwrap();
            }
        }
        // 3 held-out folds x 10 compounds x 2 records each.
        assert_eq!(scored, 60);
    }

    #[test]
    fn too_few_folds_is_invalid() {
        let data = linear_dataset(10);
        let cv = CrossValidator::new(1);
        let err = cv.run(&data, &ridge_prototype(), &RawSmiles).unwrap_err();
        assert!(matches!(err, ModelError::InvalidParameter(_)));
    }

    #[test]
    fn log_file_gets_fold_and_pooled_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cv.txt");
        let data = linear_dataset(20);
        let cv = CrossValidator::new(2).with_seed(3).with_log(&path);
        cv.run(&data, &ridge_prototype(), &RawSmiles).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        // Two folds give one held-out fold line, plus the pooled block.
        assert_eq!(contents.matches("fold").count(), 1);
        assert!(contents.contains("pooled:"));
    }
}
