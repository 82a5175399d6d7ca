//! k-means in a fixed-rank PCA projection of the feature space.
//!
//! Components come from power iteration with deflation on the centered data,
//! accumulated in f64; no dense covariance matrix is materialized, so wide
//! descriptor blocks stay cheap.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cluster::kmeans::{assign_all, lloyd};
use crate::cluster::Clusterer;
use crate::dataset::rng_from;
use crate::error::{ModelError, Result};
use crate::models::{check_model_tag, write_model_tag};

pub const MODEL_TYPE: &str = "pca_kmeans";

const STATE_FILE: &str = "pca_kmeans.json";
const POWER_ITERATIONS: usize = 100;
const DEFAULT_MAX_ITERS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PcaKMeansState {
    means: Vec<f64>,
    components: Vec<Vec<f64>>,
    centroids: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct PcaKMeansClusterer {
    k: usize,
    rank: usize,
    max_iters: usize,
    seed: Option<u64>,
    state: Option<PcaKMeansState>,
}

impl PcaKMeansClusterer {
    pub fn new(k: usize, rank: usize) -> Self {
        Self {
            k,
            rank,
            max_iters: DEFAULT_MAX_ITERS,
            seed: None,
            state: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn state(&self) -> Result<&PcaKMeansState> {
        self.state
            .as_ref()
            .ok_or_else(|| ModelError::training("pca k-means clusterer has not been fitted"))
    }
}

impl Clusterer for PcaKMeansClusterer {
    fn fit(&mut self, features: &[Vec<f32>]) -> Result<Vec<usize>> {
        if features.is_empty() {
            return Err(ModelError::invalid_parameter("cannot fit PCA on no rows"));
        }
        let width = features[0].len();
        if self.rank == 0 || self.rank > width {
            return Err(ModelError::invalid_parameter(format!(
                "PCA rank {} invalid for feature width {width}",
                self.rank
            )));
        }
        let mut rng = rng_from(self.seed);
        let means = column_means(features);
        let components = principal_components(features, &means, self.rank, &mut rng);
        let projected = project(features, &means, &components);
        let (centroids, labels) = lloyd(&projected, self.k, self.max_iters, &mut rng)?;
        self.state = Some(PcaKMeansState {
            means,
            components,
            centroids,
        });
        Ok(labels)
    }

    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<usize>> {
        let state = self.state()?;
        let projected = project(features, &state.means, &state.components);
        Ok(assign_all(&projected, &state.centroids))
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
        let state: PcaKMeansState = serde_json::from_reader(BufReader::new(file))?;
        self.k = state.centroids.len();
        self.rank = state.components.len();
        self.state = Some(state);
        Ok(())
    }
}

fn column_means(features: &[Vec<f32>]) -> Vec<f64> {
    let width = features[0].len();
    let mut means = vec![0.0f64; width];
    for row in features {
        for (m, &v) in means.iter_mut().zip(row.iter()) {
            *m += v as f64;
        }
    }
    for m in &mut means {
        *m /= features.len() as f64;
    }
    means
}

/// Leading eigenvectors of the covariance via power iteration with deflation.
fn principal_components(
    features: &[Vec<f32>],
    means: &[f64],
    rank: usize,
    rng: &mut rand_pcg::Pcg64,
) -> Vec<Vec<f64>> {
    use rand::Rng;
    let width = means.len();
    let mut components: Vec<Vec<f64>> = Vec::with_capacity(rank);

    for _ in 0..rank {
        let mut v: Vec<f64> = (0..width).map(|_| rng.gen::<f64>() - 0.5).collect();
        normalize(&mut v);
        for _ in 0..POWER_ITERATIONS {
            // next = Xc' * (Xc * v), keeping only centered dot products.
            let mut next = vec![0.0f64; width];
            for row in features {
                let mut dot = 0.0f64;
                for j in 0..width {
                    dot += (row[j] as f64 - means[j]) * v[j];
                }
                for j in 0..width {
                    next[j] += dot * (row[j] as f64 - means[j]);
                }
            }
            for prior in &components {
                let overlap: f64 = next.iter().zip(prior.iter()).map(|(a, b)| a * b).sum();
                for (n, &p) in next.iter_mut().zip(prior.iter()) {
                    *n -= overlap * p;
                }
            }
            if !normalize(&mut next) {
                break;
            }
            v = next;
        }
        components.push(v);
    }
    components
}

fn normalize(v: &mut [f64]) -> bool {
    let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm < 1e-12 {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

fn project(features: &[Vec<f32>], means: &[f64], components: &[Vec<f64>]) -> Vec<Vec<f32>> {
    features
        .iter()
        .map(|row| {
            components
                .iter()
                .map(|c| {
                    let dot: f64 = row
                        .iter()
                        .zip(means.iter())
                        .zip(c.iter())
                        .map(|((&x, &m), &w)| (x as f64 - m) * w)
                        .sum();
                    dot as f32
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two blobs separated along one axis, with noise axes that PCA should
    /// project away.
    fn noisy_blobs() -> Vec<Vec<f32>> {
        let mut rows = Vec::new();
        for i in 0..12 {
            let noise = (i % 3) as f32 * 0.01;
            rows.push(vec![i as f32 * 0.1, noise, -noise]);
            rows.push(vec![50.0 + i as f32 * 0.1, -noise, noise]);
        }
        rows
    }

    #[test]
    fn first_component_follows_the_spread() {
        let features = noisy_blobs();
        let means = column_means(&features);
        let mut rng = rng_from(Some(1));
        let components = principal_components(&features, &means, 1, &mut rng);
        // Variance is dominated by the first axis.
        assert!(components[0][0].abs() > 0.99);
    }

    #[test]
    fn clusters_in_projected_space() {
        let mut clusterer = PcaKMeansClusterer::new(2, 1).with_seed(7);
        let features = noisy_blobs();
        let labels = clusterer.fit(&features).unwrap();
        for pair in labels.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn rank_above_width_is_invalid() {
        let mut clusterer = PcaKMeansClusterer::new(2, 5).with_seed(1);
        let err = clusterer.fit(&[vec![1.0], vec![2.0]]).unwrap_err();
        assert!(matches!(err, ModelError::InvalidParameter(_)));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut clusterer = PcaKMeansClusterer::new(2, 2).with_seed(3);
        let features = noisy_blobs();
        clusterer.fit(&features).unwrap();
        clusterer.save(dir.path()).unwrap();

        let loaded = crate::cluster::load_clusterer(dir.path()).unwrap();
        assert_eq!(loaded.model_type(), MODEL_TYPE);
        assert_eq!(
            loaded.predict(&features).unwrap(),
            clusterer.predict(&features).unwrap()
        );
    }
}
