//! Validation accuracy measures and the fixed-order report line.
//!
//! The report's token layout is a compatibility contract: downstream tooling
//! parses values by position (`RMSE: <v> MAE: <v> MdAE: <v> MPE: <v>
//! MdPE: <v>`), so field order and labels must not change.

use std::fmt;

use crate::error::{ModelError, Result};

/// Which scalar a caller wants out of a report. Hyperparameter selection is
/// always scored by [`AccuracyMeasure::MdAe`]; reporting can use any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyMeasure {
    Rmse,
    Mae,
    MdAe,
    /// Mean relative error, in percent.
    Mpe,
    /// Median relative error, in percent.
    MdPe,
}

/// Percentile bands of absolute and relative errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorBands {
    pub d80_abs: f32,
    pub d90_abs: f32,
    pub d95_abs: f32,
    pub d80_rel_pct: f32,
    pub d90_rel_pct: f32,
    pub d95_rel_pct: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendedMetrics {
    pub r2: f32,
    pub corr: f32,
    pub bands: ErrorBands,
}

/// Accuracy summary for one prediction/label pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyReport {
    pub rmse: f32,
    pub mae: f32,
    pub mdae: f32,
    pub mpe_pct: f32,
    pub mdpe_pct: f32,
    pub extended: Option<ExtendedMetrics>,
}

impl AccuracyReport {
    pub fn compute(predictions: &[f32], labels: &[f32], extended: bool) -> Result<Self> {
        if predictions.len() != labels.len() {
            return Err(ModelError::consistency(format!(
                "{} predictions against {} labels",
                predictions.len(),
                labels.len()
            )));
        }
        if predictions.is_empty() {
            return Err(ModelError::consistency(
                "cannot compute accuracy of an empty prediction set",
            ));
        }
        let deltas: Vec<f32> = predictions
            .iter()
            .zip(labels.iter())
            .map(|(&p, &l)| (l - p).abs())
            .collect();
        let rel_deltas: Vec<f32> = deltas
            .iter()
            .zip(labels.iter())
            .map(|(&d, &l)| d / l)
            .collect();
        let sq_mean = mean(&deltas.iter().map(|d| d * d).collect::<Vec<f32>>());

        let extended = if extended {
            let mut abs_sorted = deltas.clone();
            abs_sorted.sort_by(|a, b| a.total_cmp(b));
            let mut rel_sorted = rel_deltas.clone();
            rel_sorted.sort_by(|a, b| a.total_cmp(b));
            Some(ExtendedMetrics {
                r2: r2(labels, predictions),
                corr: corr(labels, predictions),
                bands: ErrorBands {
                    d80_abs: percentile(&abs_sorted, 0.80),
                    d90_abs: percentile(&abs_sorted, 0.90),
                    d95_abs: percentile(&abs_sorted, 0.95),
                    d80_rel_pct: 100.0 * percentile(&rel_sorted, 0.80),
                    d90_rel_pct: 100.0 * percentile(&rel_sorted, 0.90),
                    d95_rel_pct: 100.0 * percentile(&rel_sorted, 0.95),
                },
            })
        } else {
            None
        };

        Ok(Self {
            rmse: sq_mean.sqrt(),
            mae: mean(&deltas),
            mdae: median(&deltas),
            mpe_pct: 100.0 * mean(&rel_deltas),
            mdpe_pct: 100.0 * median(&rel_deltas),
            extended,
        })
    }

    pub fn value(&self, measure: AccuracyMeasure) -> f32 {
        match measure {
            AccuracyMeasure::Rmse => self.rmse,
            AccuracyMeasure::Mae => self.mae,
            AccuracyMeasure::MdAe => self.mdae,
            AccuracyMeasure::Mpe => self.mpe_pct,
            AccuracyMeasure::MdPe => self.mdpe_pct,
        }
    }

    /// Parses a measure out of a report line by its fixed token position.
    pub fn parse_measure(line: &str, measure: AccuracyMeasure) -> Result<f32> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let idx = match measure {
            AccuracyMeasure::Rmse => 1,
            AccuracyMeasure::Mae => 3,
            AccuracyMeasure::MdAe => 5,
            AccuracyMeasure::Mpe => 7,
            AccuracyMeasure::MdPe => 9,
        };
        tokens
            .get(idx)
            .ok_or_else(|| ModelError::parse(format!("report line too short: {line:?}")))?
            .parse()
            .map_err(|_| ModelError::parse(format!("bad value at token {idx} in {line:?}")))
    }
}

impl fmt::Display for AccuracyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RMSE: {} MAE: {} MdAE: {} MPE: {} MdPE: {}",
            self.rmse, self.mae, self.mdae, self.mpe_pct, self.mdpe_pct
        )?;
        if let Some(ext) = &self.extended {
            write!(f, "\nR2: {} r: {}", ext.r2, ext.corr)?;
            write!(
                f,
                "\nd80abs {} d90abs {} d95abs {}",
                ext.bands.d80_abs, ext.bands.d90_abs, ext.bands.d95_abs
            )?;
            write!(
                f,
                "\nd80rel {} d90rel {} d95rel {}",
                ext.bands.d80_rel_pct, ext.bands.d90_rel_pct, ext.bands.d95_rel_pct
            )?;
        }
        Ok(())
    }
}

pub(crate) fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let sum: f64 = values.iter().map(|&v| v as f64).sum();
    (sum / values.len() as f64) as f32
}

pub(crate) fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[f32], q: f32) -> f32 {
    let idx = (q * (sorted.len() - 1) as f32).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn r2(labels: &[f32], predictions: &[f32]) -> f32 {
    let mean_label = mean(labels) as f64;
    let mut ss_res = 0.0f64;
    let mut ss_tot = 0.0f64;
    for (&l, &p) in labels.iter().zip(predictions.iter()) {
        ss_res += (l as f64 - p as f64).powi(2);
        ss_tot += (l as f64 - mean_label).powi(2);
    }
    if ss_tot == 0.0 {
        return 0.0;
    }
    (1.0 - ss_res / ss_tot) as f32
}

fn corr(labels: &[f32], predictions: &[f32]) -> f32 {
    let mean_l = mean(labels) as f64;
    let mean_p = mean(predictions) as f64;
    let mut num = 0.0f64;
    let mut den_l = 0.0f64;
    let mut den_p = 0.0f64;
    for (&l, &p) in labels.iter().zip(predictions.iter()) {
        let dl = l as f64 - mean_l;
        let dp = p as f64 - mean_p;
        num += dl * dp;
        den_l += dl * dl;
        den_p += dp * dp;
    }
    let den = (den_l * den_p).sqrt();
    if den == 0.0 {
        return 0.0;
    }
    (num / den) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_median_known_values() {
        assert_eq!(mean(&[10.0, 20.0, 30.0]), 20.0);
        assert_eq!(median(&[10.0, 20.0, 30.0]), 20.0);
        assert_eq!(median(&[10.0, 20.0, 30.0, 40.0]), 25.0);
    }

    #[test]
    fn report_known_errors() {
        let labels = [100.0, 200.0, 400.0];
        let predictions = [110.0, 190.0, 400.0];
        let report = AccuracyReport::compute(&predictions, &labels, false).unwrap();
        assert!((report.mae - 20.0 / 3.0).abs() < 1e-4);
        assert_eq!(report.mdae, 10.0);
        assert!((report.rmse - (200.0f32 / 3.0).sqrt()).abs() < 1e-4);
        // Relative errors: 0.1, 0.05, 0.0 -> mean 5%, median 5%.
        assert!((report.mpe_pct - 5.0).abs() < 1e-4);
        assert!((report.mdpe_pct - 5.0).abs() < 1e-4);
    }

    #[test]
    fn perfect_predictions_have_unit_r2() {
        let labels = [1.0, 2.0, 3.0, 4.0];
        let report = AccuracyReport::compute(&labels, &labels, true).unwrap();
        let ext = report.extended.unwrap();
        assert!((ext.r2 - 1.0).abs() < 1e-6);
        assert!((ext.corr - 1.0).abs() < 1e-6);
        assert_eq!(ext.bands.d95_abs, 0.0);
    }

    #[test]
    fn display_tokens_parse_back() {
        let labels = [100.0, 200.0, 400.0];
        let predictions = [110.0, 190.0, 400.0];
        let report = AccuracyReport::compute(&predictions, &labels, false).unwrap();
        let line = report.to_string();
        assert!(
            (AccuracyReport::parse_measure(&line, AccuracyMeasure::Mae).unwrap() - report.mae)
                .abs()
                < 1e-4
        );
        assert!(
            (AccuracyReport::parse_measure(&line, AccuracyMeasure::MdAe).unwrap() - report.mdae)
                .abs()
                < 1e-4
        );
        assert!(
            (AccuracyReport::parse_measure(&line, AccuracyMeasure::Rmse).unwrap() - report.rmse)
                .abs()
                < 1e-4
        );
    }

    #[test]
    fn length_mismatch_is_fatal() {
        let err = AccuracyReport::compute(&[1.0], &[1.0, 2.0], false).unwrap_err();
        assert!(matches!(err, ModelError::Consistency(_)));
    }
}
