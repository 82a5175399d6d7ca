//! Cluster-dispatched retention index regression.
//!
//! Datasets of `SMILES retention column` records are split without compound
//! leakage, partitioned by a fitted clusterer, and regressed per cluster with
//! backends sharing one batched random hyperparameter search. Descriptor
//! chemistry stays outside the crate: callers plug a [`features::FeatureGenerator`]
//! in, everything downstream is generic over it.

pub mod cluster;
pub mod cv;
pub mod dataset;
pub mod error;
pub mod features;
pub mod models;

pub use cluster::{load_clusterer, predict_and_partition, Clusterer};
pub use cv::{CrossValidationOutcome, CrossValidator};
pub use dataset::{Aggregate, Dataset, Record, SplitSize};
pub use error::{ModelError, Result};
pub use features::{ColumnFeatures, FeatureGenerator};
pub use models::{backend_from_tag, load_backend, RegressionBackend};

pub mod prelude {
    pub use crate::cluster::kmeans::KMeansClusterer;
    pub use crate::cluster::pca::PcaKMeansClusterer;
    pub use crate::cluster::refine::{IterativeKMeansClusterer, SizeBounds};
    pub use crate::cluster::{load_clusterer, predict_and_partition, Clusterer};
    pub use crate::cv::{CrossValidationOutcome, CrossValidator};
    pub use crate::dataset::identity::{CompoundIdentity, FnIdentity, RawSmiles};
    pub use crate::dataset::{Aggregate, Dataset, Record, SplitSize};
    pub use crate::error::{ModelError, Result};
    pub use crate::features::preprocess::{
        FeaturePreprocessor, PreprocessedFeatureGenerator, PreprocessorChain,
    };
    pub use crate::features::{
        assemble_features, CachedFeatureGenerator, ColumnFeatures, FeatureGenerator,
        NoColumnFeatures, OneHotColumnFeatures,
    };
    pub use crate::models::cluster_ensemble::ClusterEnsemble;
    pub use crate::models::gbt::GbtBackend;
    pub use crate::models::metrics::{AccuracyMeasure, AccuracyReport};
    pub use crate::models::ridge::RidgeBackend;
    pub use crate::models::search::TuningConfig;
    pub use crate::models::stacking::StackingEnsemble;
    pub use crate::models::{
        backend_from_tag, load_backend, RegressionBackend, SharedColumns, SharedFeatures,
    };
}
