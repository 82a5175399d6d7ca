//! Batched random hyperparameter search shared by every regression backend.
//!
//! Candidates are sampled sequentially from one RNG, then evaluated in
//! parallel batches of at most `max_parallel`; the search thread joins the
//! whole batch before selecting, so a batch never sees candidates from the
//! next one. Selection is always by median absolute error with strict `<`,
//! keeping the earlier candidate on ties.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use rand::Rng;
use rand_pcg::Pcg64;
use rayon::prelude::*;

use crate::dataset::rng_from;
use crate::error::{ModelError, Result};
use crate::models::metrics::{AccuracyMeasure, AccuracyReport};

/// How a backend runs its hyperparameter search.
#[derive(Debug, Clone)]
pub struct TuningConfig {
    /// Total number of candidate parameter sets to evaluate.
    pub attempts: usize,
    /// Upper bound on concurrently evaluated candidates.
    pub max_parallel: usize,
    /// Optional file every candidate (and failure) is appended to.
    pub log: Option<PathBuf>,
    /// Seed for candidate sampling; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl TuningConfig {
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts,
            max_parallel: num_cpus::get(),
            log: None,
            seed: None,
        }
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Winning candidate of a finished search.
#[derive(Debug, Clone)]
pub struct SearchOutcome<P> {
    pub best_params: P,
    pub best_report: AccuracyReport,
    /// Candidates that trained successfully.
    pub evaluated: usize,
    /// Candidates whose fit failed and was skipped.
    pub failed: usize,
}

/// Runs the shared search protocol.
///
/// `sample` draws one candidate from the RNG; `evaluate` fits it and scores
/// it on the validation set. A [`ModelError::Training`] from `evaluate` is
/// logged and skipped; any other error aborts the search. Failure to open
/// the tuning log aborts; failure to append a line degrades to a warning
/// and disables further logging.
pub fn random_search<P, S, E>(
    config: &TuningConfig,
    mut sample: S,
    evaluate: E,
) -> Result<SearchOutcome<P>>
where
    P: Clone + Send + Sync + fmt::Display,
    S: FnMut(&mut Pcg64) -> P,
    E: Fn(&P) -> Result<AccuracyReport> + Sync,
{
    let mut log_file = match &config.log {
        Some(path) => Some(open_log(path)?),
        None => None,
    };
    let mut rng = rng_from(config.seed);
    let max_parallel = config.max_parallel.max(1);

    let mut best: Option<(P, AccuracyReport)> = None;
    let mut evaluated = 0usize;
    let mut failed = 0usize;
    let mut remaining = config.attempts;

    while remaining > 0 {
        let batch_size = remaining.min(max_parallel);
        let candidates: Vec<P> = (0..batch_size).map(|_| sample(&mut rng)).collect();
        let reports: Vec<Result<AccuracyReport>> =
            candidates.par_iter().map(|params| evaluate(params)).collect();

        for (params, outcome) in candidates.into_iter().zip(reports) {
            match outcome {
                Ok(report) => {
                    append_line(&mut log_file, &format!("{params} {report}"));
                    evaluated += 1;
                    let score = report.value(AccuracyMeasure::MdAe);
                    let improved = match &best {
                        Some((_, incumbent)) => score < incumbent.value(AccuracyMeasure::MdAe),
                        None => true,
                    };
                    if improved {
                        log::info!("new best candidate (MdAE {score}): {params}");
                        best = Some((params, report));
                    }
                }
                Err(ModelError::Training(msg)) => {
                    log::warn!("candidate {params} failed to train: {msg}");
                    append_line(&mut log_file, &format!("{params} TRAINING FAILED: {msg}"));
                    failed += 1;
                }
                Err(err) => return Err(err),
            }
        }
        remaining -= batch_size;
    }

    let (best_params, best_report) = best.ok_or_else(|| {
        ModelError::training(format!(
            "all {} search candidates failed to train",
            config.attempts
        ))
    })?;
    Ok(SearchOutcome {
        best_params,
        best_report,
        evaluated,
        failed,
    })
}

fn open_log(path: &PathBuf) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(ModelError::from)
}

fn append_line(log: &mut Option<File>, line: &str) {
    if let Some(file) = log.as_mut() {
        if let Err(err) = writeln!(file, "{line}") {
            log::warn!("tuning log append failed, logging disabled: {err}");
            *log = None;
        }
    }
}

/// Uniform in log space over `[lo, hi]`. For scale parameters.
pub fn log_uniform(rng: &mut Pcg64, lo: f64, hi: f64) -> f64 {
    rng.gen_range(lo.ln()..=hi.ln()).exp()
}

/// Uniform over `[lo, hi]`.
pub fn uniform(rng: &mut Pcg64, lo: f64, hi: f64) -> f64 {
    rng.gen_range(lo..=hi)
}

/// Uniform integer over `[lo, hi]`, both ends inclusive.
pub fn uniform_int(rng: &mut Pcg64, lo: u32, hi: u32) -> u32 {
    rng.gen_range(lo..=hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn score_of(x: &f64) -> Result<AccuracyReport> {
        // One prediction off by |x - 3|, so MdAE == |x - 3|.
        AccuracyReport::compute(&[10.0 + (*x as f32 - 3.0)], &[10.0], false)
    }

    #[test]
    fn search_finds_minimum_of_scored_range() {
        let config = TuningConfig::new(64).with_seed(11).with_max_parallel(8);
        let outcome = random_search(
            &config,
            |rng| uniform(rng, 0.0, 10.0),
            score_of,
        )
        .unwrap();
        assert_eq!(outcome.evaluated, 64);
        assert_eq!(outcome.failed, 0);
        assert!((outcome.best_params - 3.0).abs() < 1.0);
    }

    #[test]
    fn best_score_never_worse_than_any_candidate() {
        let seen = AtomicUsize::new(0);
        let config = TuningConfig::new(20).with_seed(5).with_max_parallel(4);
        let outcome = random_search(
            &config,
            |rng| uniform(rng, 0.0, 10.0),
            |x| {
                seen.fetch_add(1, Ordering::SeqCst);
                score_of(x)
            },
        )
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 20);
        let best = outcome.best_report.value(AccuracyMeasure::MdAe);
        assert!((outcome.best_params as f32 - 3.0).abs() - best < 1e-5);
    }

    #[test]
    fn training_failures_are_skipped() {
        let config = TuningConfig::new(10).with_seed(9);
        let outcome = random_search(
            &config,
            |rng| uniform(rng, 0.0, 10.0),
            |x| {
                if *x < 5.0 {
                    Err(ModelError::training("diverged"))
                } else {
                    score_of(x)
                }
            },
        )
        .unwrap();
        assert_eq!(outcome.evaluated + outcome.failed, 10);
        assert!(outcome.best_params >= 5.0);
    }

    #[test]
    fn all_failures_is_a_training_error() {
        let config = TuningConfig::new(4).with_seed(1);
        let err = random_search(
            &config,
            |rng| uniform(rng, 0.0, 1.0),
            |_: &f64| -> Result<AccuracyReport> { Err(ModelError::training("nope")) },
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::Training(_)));
    }

    #[test]
    fn every_candidate_lands_in_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.txt");
        let config = TuningConfig::new(12).with_seed(3).with_log(&path);
        random_search(&config, |rng| uniform(rng, 0.0, 10.0), score_of).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 12);
    }

    #[test]
    fn retained_best_is_no_worse_than_any_logged_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.txt");
        let config = TuningConfig::new(24).with_seed(17).with_log(&path);
        let outcome =
            random_search(&config, |rng| uniform(rng, 0.0, 10.0), score_of).unwrap();
        let best = outcome.best_report.value(AccuracyMeasure::MdAe);

        let contents = std::fs::read_to_string(&path).unwrap();
        for line in contents.lines() {
            // Each line is `<params> <report>`; the report starts at "RMSE:".
            let report = &line[line.find("RMSE:").unwrap()..];
            let mdae = AccuracyReport::parse_measure(report, AccuracyMeasure::MdAe).unwrap();
            assert!(best <= mdae, "best {best} worse than logged {mdae}");
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let mut a = rng_from(Some(42));
        let mut b = rng_from(Some(42));
        for _ in 0..10 {
            assert_eq!(log_uniform(&mut a, 1e-9, 1e5), log_uniform(&mut b, 1e-9, 1e5));
            assert_eq!(uniform_int(&mut a, 1, 24), uniform_int(&mut b, 1, 24));
        }
    }
}
