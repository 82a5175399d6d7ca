//! k-means with iterative size refinement: oversized clusters are split by a
//! local re-clustering, undersized ones are merged whole into the surviving
//! cluster with the nearest centroid. Refinement runs for a bounded number of
//! rounds and is best-effort; clusters still outside the bounds afterwards
//! are accepted.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cluster::kmeans::{assign_all, lloyd, nearest};
use crate::cluster::Clusterer;
use crate::dataset::rng_from;
use crate::error::{ModelError, Result};
use crate::models::{check_model_tag, write_model_tag};

pub const MODEL_TYPE: &str = "kmeans_iterative";

const STATE_FILE: &str = "centroids.json";
const DEFAULT_MAX_ITERS: usize = 200;
const DEFAULT_MAX_ROUNDS: usize = 10;

/// Acceptable cluster size window. The defaults disable refinement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizeBounds {
    pub min: usize,
    pub max: usize,
}

impl Default for SizeBounds {
    fn default() -> Self {
        Self {
            min: 1,
            max: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IterativeState {
    centroids: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct IterativeKMeansClusterer {
    k: usize,
    bounds: SizeBounds,
    max_rounds: usize,
    max_iters: usize,
    seed: Option<u64>,
    state: Option<IterativeState>,
}

impl IterativeKMeansClusterer {
    pub fn new(k: usize, bounds: SizeBounds) -> Self {
        Self {
            k,
            bounds,
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_iters: DEFAULT_MAX_ITERS,
            seed: None,
            state: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    fn state(&self) -> Result<&IterativeState> {
        self.state
            .as_ref()
            .ok_or_else(|| ModelError::training("iterative k-means has not been fitted"))
    }
}

impl Clusterer for IterativeKMeansClusterer {
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<Vec<usize>> {
        if self.bounds.min > self.bounds.max {
            return Err(ModelError::invalid_parameter(format!(
                "size bounds {}..{} are inverted",
                self.bounds.min, self.bounds.max
            )));
        }
        let mut rng = rng_from(self.seed);
        let (mut centroids, mut labels) = lloyd(features, self.k, self.max_iters, &mut rng)?;

        for round in 0..self.max_rounds {
            let mut changed = false;
            let counts = label_counts(&labels, centroids.len());
            let mut members_of: Vec<Vec<usize>> = vec![Vec::new(); centroids.len()];
            for (i, &l) in labels.iter().enumerate() {
                members_of[l].push(i);
            }

            // Split oversized clusters by a local re-clustering; every piece
            // gets a fresh global id.
            let mut next: Vec<Vec<f32>> = Vec::with_capacity(centroids.len());
            for (idx, centroid) in centroids.iter().enumerate() {
                let base = next.len();
                if counts[idx] > self.bounds.max {
                    let members: Vec<Vec<f32>> = members_of[idx]
                        .iter()
                        .map(|&i| features[i].clone())
                        .collect();
                    let local_k =
                        ((counts[idx] + self.bounds.max - 1) / self.bounds.max).min(members.len());
                    if local_k > 1 {
                        let (locals, local_labels) =
                            lloyd(&members, local_k, self.max_iters, &mut rng)?;
                        next.extend(locals);
                        for (&i, &local) in members_of[idx].iter().zip(local_labels.iter()) {
                            labels[i] = base + local;
                        }
                        changed = true;
                        continue;
                    }
                }
                next.push(centroid.clone());
                for &i in &members_of[idx] {
                    labels[i] = base;
                }
            }
            centroids = next;

            // Merge each undersized cluster whole into the surviving cluster
            // with the nearest centroid, then refresh the merged centroids.
            let counts = label_counts(&labels, centroids.len());
            let keep: Vec<bool> = counts.iter().map(|&n| n >= self.bounds.min).collect();
            if keep.iter().any(|&kept| !kept) && keep.iter().any(|&kept| kept) {
                let survivors: Vec<Vec<f32>> = centroids
                    .iter()
                    .zip(keep.iter())
                    .filter(|(_, &kept)| kept)
                    .map(|(c, _)| c.clone())
                    .collect();
                let mut remap = vec![0usize; centroids.len()];
                let mut next_id = 0;
                for (c, &kept) in keep.iter().enumerate() {
                    if kept {
                        remap[c] = next_id;
                        next_id += 1;
                    } else {
                        remap[c] = nearest(&centroids[c], &survivors);
                    }
                }
                for label in labels.iter_mut() {
                    *label = remap[*label];
                }
                centroids = mean_centroids(features, &labels, survivors.len());
                changed = true;
            }

            if !changed {
                log::debug!("cluster refinement settled after {round} rounds");
                break;
            }
        }

        self.state = Some(IterativeState { centroids });
        Ok(labels)
    }

    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<usize>> {
        let state = self.state()?;
        Ok(assign_all(features, &state.centroids))
    }

    fn num_clusters(&self) -> usize {
        self.state.as_ref().map_or(self.k, |s| s.centroids.len())
    }

    fn model_type(&self) -> &'static str {
        MODEL_TYPE
    }

    fn create_similar(&self) -> Box<dyn Clusterer> {
        let mut fresh = self.clone();
        fresh.state = None;
        Box::new(fresh)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let state = self.state()?;
        write_model_tag(dir, MODEL_TYPE)?;
        let file = File::create(dir.join(STATE_FILE))?;
        serde_json::to_writer(BufWriter::new(file), state)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        check_model_tag(dir, MODEL_TYPE)?;
        let file = File::open(dir.join(STATE_FILE))?;
        let state: IterativeState = serde_json::from_reader(BufReader::new(file))?;
        self.k = state.centroids.len();
        self.state = Some(state);
        Ok(())
    }
}

fn label_counts(labels: &[usize], k: usize) -> Vec<usize> {
    let mut counts = vec![0usize; k];
    for &l in labels {
        counts[l] += 1;
    }
    counts
}

fn mean_centroids(features: &[Vec<f32>], labels: &[usize], k: usize) -> Vec<Vec<f32>> {
    let width = features.first().map_or(0, |row| row.len());
    let mut sums = vec![vec![0.0f64; width]; k];
    let mut counts = vec![0usize; k];
    for (row, &l) in features.iter().zip(labels.iter()) {
        counts[l] += 1;
        for (sum, &v) in sums[l].iter_mut().zip(row.iter()) {
            *sum += v as f64;
        }
    }
    sums.into_iter()
        .zip(counts)
        .map(|(sum, count)| {
            sum.into_iter()
                .map(|s| (s / count.max(1) as f64) as f32)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![i as f32]).collect()
    }

    #[test]
    fn oversized_clusters_get_split() {
        let bounds = SizeBounds { min: 1, max: 10 };
        let mut clusterer = IterativeKMeansClusterer::new(1, bounds).with_seed(3);
        let features = line(30);
        let labels = clusterer.fit(&features).unwrap();
        assert!(clusterer.num_clusters() > 1);
        let counts = label_counts(&labels, clusterer.num_clusters());
        assert!(counts.iter().all(|&c| c <= 10), "sizes {counts:?}");
    }

    #[test]
    fn undersized_clusters_get_merged() {
        let bounds = SizeBounds { min: 3, max: 100 };
        let mut clusterer = IterativeKMeansClusterer::new(3, bounds).with_seed(8);
        let mut features = Vec::new();
        for i in 0..12 {
            features.push(vec![i as f32 * 0.1]);
            features.push(vec![100.0 + i as f32 * 0.1]);
        }
        features.push(vec![5000.0]); // lone outlier
        let labels = clusterer.fit(&features).unwrap();
        assert_eq!(clusterer.num_clusters(), 2);
        let counts = label_counts(&labels, 2);
        assert!(counts.iter().all(|&c| c >= 3), "sizes {counts:?}");
    }

    #[test]
    fn undersized_cluster_merges_whole_into_one_survivor() {
        let bounds = SizeBounds { min: 3, max: 100 };
        let mut clusterer = IterativeKMeansClusterer::new(3, bounds).with_seed(11);
        let mut features = Vec::new();
        for i in 0..12 {
            features.push(vec![i as f32 * 0.01]); // near 0
            features.push(vec![20.0 + i as f32 * 0.01]); // near 20
        }
        // Two stragglers between the blobs. Their own centroid sits at 11,
        // nearer the right blob, though 9.0 alone is nearer the left one.
        features.push(vec![9.0]);
        features.push(vec![13.0]);

        let labels = clusterer.fit(&features).unwrap();
        assert_eq!(clusterer.num_clusters(), 2);
        // The straggler pair lands in one cluster, the right blob's.
        assert_eq!(labels[24], labels[25]);
        assert_eq!(labels[24], labels[1]);
        assert_ne!(labels[24], labels[0]);
    }

    #[test]
    fn default_bounds_leave_clustering_alone() {
        let mut clusterer = IterativeKMeansClusterer::new(2, SizeBounds::default()).with_seed(1);
        let features = line(20);
        clusterer.fit(&features).unwrap();
        assert_eq!(clusterer.num_clusters(), 2);
    }

    #[test]
    fn inverted_bounds_are_invalid() {
        let bounds = SizeBounds { min: 10, max: 5 };
        let mut clusterer = IterativeKMeansClusterer::new(2, bounds);
        let err = clusterer.fit(&line(20)).unwrap_err();
        assert!(matches!(err, ModelError::InvalidParameter(_)));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bounds = SizeBounds { min: 1, max: 10 };
        let mut clusterer = IterativeKMeansClusterer::new(1, bounds).with_seed(3);
        let features = line(30);
        clusterer.fit(&features).unwrap();
        clusterer.save(dir.path()).unwrap();

        let loaded = crate::cluster::load_clusterer(dir.path()).unwrap();
        assert_eq!(loaded.num_clusters(), clusterer.num_clusters());
        assert_eq!(
            loaded.predict(&features).unwrap(),
            clusterer.predict(&features).unwrap()
        );
    }
}
