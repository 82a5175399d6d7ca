//! Lloyd k-means with k-means++ style seeding, on raw feature space.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::Rng;
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cluster::Clusterer;
use crate::dataset::rng_from;
use crate::error::{ModelError, Result};
use crate::models::{check_model_tag, write_model_tag};

pub const MODEL_TYPE: &str = "kmeans";

const CENTROIDS_FILE: &str = "centroids.json";
const DEFAULT_MAX_ITERS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KMeansState {
    centroids: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct KMeansClusterer {
    k: usize,
    max_iters: usize,
    seed: Option<u64>,
    state: Option<KMeansState>,
}

impl KMeansClusterer {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_iters: DEFAULT_MAX_ITERS,
            seed: None,
            state: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    fn state(&self) -> Result<&KMeansState> {
        self.state
            .as_ref()
            .ok_or_else(|| ModelError::training("k-means clusterer has not been fitted"))
    }
}

impl Clusterer for KMeansClusterer {
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<Vec<usize>> {
        let mut rng = rng_from(self.seed);
        let (centroids, labels) = lloyd(features, self.k, self.max_iters, &mut rng)?;
        self.state = Some(KMeansState { centroids });
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
        let file = File::create(dir.join(CENTROIDS_FILE))?;
        serde_json::to_writer(BufWriter::new(file), state)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        check_model_tag(dir, MODEL_TYPE)?;
        let file = File::open(dir.join(CENTROIDS_FILE))?;
        let state: KMeansState = serde_json::from_reader(BufReader::new(file))?;
        self.k = state.centroids.len();
        self.state = Some(state);
        Ok(())
    }
}

pub(crate) fn distance2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum()
}

pub(crate) fn nearest(row: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = distance2(row, c);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

pub(crate) fn assign_all(features: &[Vec<f32>], centroids: &[Vec<f32>]) -> Vec<usize> {
    features
        .par_iter()
        .map(|row| nearest(row, centroids))
        .collect()
}

/// k-means++ seeding: first centroid uniform, each next one drawn with
/// probability proportional to squared distance from the chosen set.
fn seed_centroids(features: &[Vec<f32>], k: usize, rng: &mut Pcg64) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(features[rng.gen_range(0..features.len())].clone());
    let mut dists: Vec<f64> = features
        .iter()
        .map(|row| distance2(row, &centroids[0]))
        .collect();
    while centroids.len() < k {
        let total: f64 = dists.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = features.len() - 1;
            for (i, &d) in dists.iter().enumerate() {
                target -= d;
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            // All remaining points coincide with a centroid.
            rng.gen_range(0..features.len())
        };
        let newest = features[pick].clone();
        for (d, row) in dists.iter_mut().zip(features.iter()) {
            *d = d.min(distance2(row, &newest));
        }
        centroids.push(newest);
    }
    centroids
}

/// Runs seeded Lloyd iterations until assignments stabilize or the iteration
/// bound is hit. Empty clusters are re-seeded from the farthest point.
pub(crate) fn lloyd(
    features: &[Vec<f32>],
    k: usize,
    max_iters: usize,
    rng: &mut Pcg64,
) -> Result<(Vec<Vec<f32>>, Vec<usize>)> {
    if k == 0 {
        return Err(ModelError::invalid_parameter("cluster count must be positive"));
    }
    if features.len() < k {
        return Err(ModelError::invalid_parameter(format!(
            "{} points cannot form {k} clusters",
            features.len()
        )));
    }
    let width = features[0].len();
    let mut centroids = seed_centroids(features, k, rng);
    let mut labels = assign_all(features, &centroids);

    for _ in 0..max_iters {
        let mut sums = vec![vec![0.0f64; width]; k];
        let mut counts = vec![0usize; k];
        for (row, &label) in features.iter().zip(labels.iter()) {
            counts[label] += 1;
            for (s, &v) in sums[label].iter_mut().zip(row.iter()) {
                *s += v as f64;
            }
        }
        let mut next_centroids = Vec::with_capacity(k);
        for (sum, &count) in sums.iter().zip(counts.iter()) {
            if count == 0 {
                // Re-seed an empty cluster from the point currently farthest
                // from its assigned centroid.
                let far = features
                    .iter()
                    .enumerate()
                    .max_by(|(i, a), (j, b)| {
                        distance2(a, &centroids[labels[*i]])
                            .total_cmp(&distance2(b, &centroids[labels[*j]]))
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                next_centroids.push(features[far].clone());
            } else {
                next_centroids.push(sum.iter().map(|&s| (s / count as f64) as f32).collect());
            }
        }
        centroids = next_centroids;
        let next = assign_all(features, &centroids);
        if next == labels {
            break;
        }
        labels = next;
    }
    Ok((centroids, labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<Vec<f32>> {
        let mut rows = Vec::new();
        for i in 0..10 {
            rows.push(vec![i as f32 * 0.1, 0.0]);
            rows.push(vec![100.0 + i as f32 * 0.1, 1.0]);
        }
        rows
    }

    #[test]
    fn separates_two_blobs() {
        let mut clusterer = KMeansClusterer::new(2).with_seed(1);
        let features = two_blobs();
        let labels = clusterer.fit(&features).unwrap();
        // Rows alternate blobs, so labels alternate too.
        for pair in labels.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(labels[0], labels[2]);
    }

    #[test]
    fn predict_matches_fit_labels() {
        let mut clusterer = KMeansClusterer::new(2).with_seed(9);
        let features = two_blobs();
        let fitted = clusterer.fit(&features).unwrap();
        let predicted = clusterer.predict(&features).unwrap();
        assert_eq!(fitted, predicted);
    }

    #[test]
    fn too_few_points_is_invalid() {
        let mut clusterer = KMeansClusterer::new(5).with_seed(1);
        let err = clusterer.fit(&[vec![1.0], vec![2.0]]).unwrap_err();
        assert!(matches!(err, ModelError::InvalidParameter(_)));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut clusterer = KMeansClusterer::new(2).with_seed(2);
        let features = two_blobs();
        clusterer.fit(&features).unwrap();
        clusterer.save(dir.path()).unwrap();

        let loaded = crate::cluster::load_clusterer(dir.path()).unwrap();
        assert_eq!(loaded.num_clusters(), 2);
        assert_eq!(
            loaded.predict(&features).unwrap(),
            clusterer.predict(&features).unwrap()
        );
    }
}
