//! Compound clustering used to partition datasets before per-cluster
//! regression. Clusterers operate on chemical feature vectors only; the
//! chromatographic column id plays no part in cluster assignment.

pub mod kmeans;
pub mod pca;
pub mod refine;

use std::path::Path;

use crate::dataset::Dataset;
use crate::error::{ModelError, Result};
use crate::features::FeatureGenerator;
use crate::models::read_model_tag;

pub trait Clusterer: Send + Sync {
    /// Fits on the given feature rows and returns the label of each row.
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<Vec<usize>>;

    /// Assigns each row to a cluster of the fitted model.
    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<usize>>;

    /// Cluster count of the fitted model. Refining clusterers may end up
    /// with more or fewer clusters than they were configured with.
    fn num_clusters(&self) -> usize;

    fn model_type(&self) -> &'static str;

    /// Same configuration, fitted state discarded.
    fn create_similar(&self) -> Box<dyn Clusterer>;

    fn save(&self, dir: &Path) -> Result<()>;

    fn load(&mut self, dir: &Path) -> Result<()>;
}

/// Buckets whole records by the predicted cluster of their structure.
/// Output order inside each bucket follows dataset order.
pub fn predict_and_partition(
    clusterer: &dyn Clusterer,
    data: &Dataset,
    generator: &dyn FeatureGenerator,
) -> Result<Vec<Dataset>> {
    let smiles = data.all_smiles();
    generator.precompute(&smiles)?;
    let features = generator.features(&smiles)?;
    let labels = clusterer.predict(&features)?;
    if labels.len() != data.len() {
        return Err(ModelError::consistency(format!(
            "{} cluster labels for {} records",
            labels.len(),
            data.len()
        )));
    }
    let mut buckets = vec![Dataset::empty(); clusterer.num_clusters()];
    for (record, label) in data.iter().zip(labels) {
        let bucket = buckets.get_mut(label).ok_or_else(|| {
            ModelError::consistency(format!(
                "cluster label {label} out of range for {} clusters",
                clusterer.num_clusters()
            ))
        })?;
        bucket.push(record.clone());
    }
    Ok(buckets)
}

/// Loads whichever clusterer the directory's tag names.
pub fn load_clusterer(dir: impl AsRef<Path>) -> Result<Box<dyn Clusterer>> {
    let dir = dir.as_ref();
    let tag = read_model_tag(dir)?;
    let mut clusterer: Box<dyn Clusterer> = match tag.as_str() {
        kmeans::MODEL_TYPE => Box::new(kmeans::KMeansClusterer::new(1)),
        pca::MODEL_TYPE => Box::new(pca::PcaKMeansClusterer::new(1, 1)),
        refine::MODEL_TYPE => Box::new(refine::IterativeKMeansClusterer::new(
            1,
            refine::SizeBounds::default(),
        )),
        other => return Err(ModelError::unknown_model_type(other)),
    };
    clusterer.load(dir)?;
    Ok(clusterer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Record;
    use crate::features::CachedFeatureGenerator;

    #[test]
    fn partition_conserves_records() {
        let mut clusterer = kmeans::KMeansClusterer::new(2).with_seed(4);
        let features: Vec<Vec<f32>> = (0..10)
            .map(|i| vec![if i < 5 { 0.0 } else { 100.0 } + i as f32])
            .collect();
        clusterer.fit(&features).unwrap();

        let gen = CachedFeatureGenerator::new(1, |s: &str| Ok(vec![s.len() as f32]));
        let data = Dataset::new(
            (1..=8)
                .map(|n| Record::new("C".repeat(n), n as f32, 0))
                .collect(),
        );
        let parts = predict_and_partition(&clusterer, &data, &gen).unwrap();
        assert_eq!(parts.len(), 2);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, data.len());

        // Re-merging the buckets reproduces the original record multiset.
        let merged = Dataset::merge(&parts);
        let mut original: Vec<String> = data.all_smiles();
        let mut recovered: Vec<String> = merged.all_smiles();
        original.sort_unstable();
        recovered.sort_unstable();
        assert_eq!(original, recovered);
    }

    #[test]
    fn unknown_clusterer_tag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        crate::models::write_model_tag(dir.path(), "dbscan").unwrap();
        let err = load_clusterer(dir.path()).err().unwrap();
        assert!(matches!(err, ModelError::UnknownModelType(_)));
    }
}
