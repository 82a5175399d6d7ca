pub mod preprocess;

use std::collections::HashMap;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::error::{ModelError, Result};

/// Produces a fixed-width numeric vector per structure.
///
/// Descriptor chemistry lives outside this crate; implementations here only
/// manage the compute/cache contract: `precompute` is idempotent and skips
/// identifiers already cached, `features` returns rows in input order.
pub trait FeatureGenerator: Send + Sync {
    fn precompute(&self, smiles: &[String]) -> Result<()>;

    fn features(&self, smiles: &[String]) -> Result<Vec<Vec<f32>>>;

    fn num_features(&self) -> usize;
}

/// Wraps a pure descriptor function with a concurrent cache.
///
/// `precompute` runs the function in parallel over the uncached identifiers
/// only; `features` serves rows from the cache, computing on miss.
pub struct CachedFeatureGenerator<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    compute: F,
    width: usize,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl<F> CachedFeatureGenerator<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    pub fn new(width: usize, compute: F) -> Self {
        Self {
            compute,
            width,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn compute_checked(&self, smiles: &str) -> Result<Vec<f32>> {
        let row = (self.compute)(smiles)?;
        if row.len() != self.width {
            return Err(ModelError::consistency(format!(
                "feature row for {smiles:?} has width {}, generator declares {}",
                row.len(),
                self.width
            )));
        }
        Ok(row)
    }
}

impl<F> FeatureGenerator for CachedFeatureGenerator<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    fn precompute(&self, smiles: &[String]) -> Result<()> {
        let missing: Vec<String> = {
            let cache = self.cache.read();
            smiles
                .iter()
                .filter(|s| !cache.contains_key(s.trim()))
                .map(|s| s.trim().to_string())
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let computed: Result<Vec<(String, Vec<f32>)>> = missing
            .par_iter()
            .map(|s| self.compute_checked(s).map(|row| (s.clone(), row)))
            .collect();
        let mut cache = self.cache.write();
        for (key, row) in computed? {
            cache.insert(key, row);
        }
        Ok(())
    }

    fn features(&self, smiles: &[String]) -> Result<Vec<Vec<f32>>> {
        self.precompute(smiles)?;
        let cache = self.cache.read();
        smiles
            .iter()
            .map(|s| {
                cache.get(s.trim()).cloned().ok_or_else(|| {
                    ModelError::consistency(format!("feature cache lost entry for {s:?}"))
                })
            })
            .collect()
    }

    fn num_features(&self) -> usize {
        self.width
    }
}

/// Encodes the chromatographic column (condition) id as a fixed-width vector,
/// concatenated in front of the chemical features before every fit/predict.
pub trait ColumnFeatures: Send + Sync {
    fn encode(&self, column: i32) -> Vec<f32>;

    fn width(&self) -> usize;

    fn encode_all(&self, columns: &[i32]) -> Vec<Vec<f32>> {
        columns.iter().map(|&c| self.encode(c)).collect()
    }
}

/// Zero-width encoder for single-column datasets.
#[derive(Debug, Clone, Default)]
pub struct NoColumnFeatures;

impl ColumnFeatures for NoColumnFeatures {
    fn encode(&self, _column: i32) -> Vec<f32> {
        Vec::new()
    }

    fn width(&self) -> usize {
        0
    }
}

/// One-hot over column ids `0..width`. Ids outside the range (including the
/// `-1` convention for aggregated records) encode as all zeros.
#[derive(Debug, Clone)]
pub struct OneHotColumnFeatures {
    width: usize,
}

impl OneHotColumnFeatures {
    pub fn new(width: usize) -> Self {
        Self { width }
    }
}

impl ColumnFeatures for OneHotColumnFeatures {
    fn encode(&self, column: i32) -> Vec<f32> {
        let mut row = vec![0.0; self.width];
        if column >= 0 && (column as usize) < self.width {
            row[column as usize] = 1.0;
        }
        row
    }

    fn width(&self) -> usize {
        self.width
    }
}

/// Column encoding followed by chemical features, one row per input.
pub fn assemble_features(
    generator: &dyn FeatureGenerator,
    columns_encoder: &dyn ColumnFeatures,
    smiles: &[String],
    columns: &[i32],
) -> Result<Vec<Vec<f32>>> {
    if smiles.len() != columns.len() {
        return Err(ModelError::consistency(format!(
            "{} structures but {} column ids",
            smiles.len(),
            columns.len()
        )));
    }
    generator.precompute(smiles)?;
    let chem = generator.features(smiles)?;
    let mut rows = Vec::with_capacity(chem.len());
    for (row, &column) in chem.into_iter().zip(columns.iter()) {
        let mut assembled = columns_encoder.encode(column);
        assembled.extend(row);
        rows.push(assembled);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_generator(
        calls: &AtomicUsize,
    ) -> CachedFeatureGenerator<impl Fn(&str) -> Result<Vec<f32>> + Send + Sync + '_> {
        CachedFeatureGenerator::new(1, move |s: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![s.len() as f32])
        })
    }

    #[test]
    fn precompute_is_idempotent() {
        let calls = AtomicUsize::new(0);
        let gen = counting_generator(&calls);
        let ids = vec!["CC".to_string(), "CCC".to_string()];
        gen.precompute(&ids).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        gen.precompute(&ids).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let rows = gen.features(&ids).unwrap();
        assert_eq!(rows, vec![vec![2.0], vec![3.0]]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn features_follow_input_order() {
        let calls = AtomicUsize::new(0);
        let gen = counting_generator(&calls);
        let ids = vec!["CCCC".to_string(), "C".to_string(), "CC".to_string()];
        let rows = gen.features(&ids).unwrap();
        assert_eq!(rows, vec![vec![4.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn width_mismatch_is_a_consistency_error() {
        let gen = CachedFeatureGenerator::new(2, |_s: &str| Ok(vec![1.0]));
        let err = gen.features(&["C".to_string()]).unwrap_err();
        assert!(matches!(err, ModelError::Consistency(_)));
    }

    #[test]
    fn one_hot_column_encoding() {
        let enc = OneHotColumnFeatures::new(3);
        assert_eq!(enc.encode(1), vec![0.0, 1.0, 0.0]);
        assert_eq!(enc.encode(-1), vec![0.0, 0.0, 0.0]);
        assert_eq!(enc.encode(7), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn assemble_prepends_column_features() {
        let gen = CachedFeatureGenerator::new(1, |s: &str| Ok(vec![s.len() as f32]));
        let enc = OneHotColumnFeatures::new(2);
        let rows = assemble_features(
            &gen,
            &enc,
            &["CC".to_string(), "CCC".to_string()],
            &[0, 1],
        )
        .unwrap();
        assert_eq!(rows, vec![vec![1.0, 0.0, 2.0], vec![0.0, 1.0, 3.0]]);
    }
}
