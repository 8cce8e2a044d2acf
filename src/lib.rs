//! # playstyle
//!
//! Behavioral clustering of gamers from their playtime.
//!
//! Each user's library becomes a playtime-weighted, normalized tag vector.
//! DBSCAN groups users into playstyles, with eps picked from the elbow of
//! the k-distance curve. Clusters whose top tags overlap are merged, a kNN
//! classifier routes new users to a merged cluster, and games popular in
//! the clusters a user resembles are recommended.
//!
//! ```text
//! GameTagMap + UserLibraries
//!        │
//!        ▼
//! FeatureMatrix ─► KDistanceProfile ─► Dbscan ─► MergedClusters ─► TrainedClassifier
//!                                                      │
//!                                                      ▼
//!                                               Recommendation
//! ```
//!
//! [`Pipeline`] runs the stages with a [`PipelineConfig`]; every stage is
//! also usable on its own.
//!
//! **Default build** is sequential. The `parallel` feature computes
//! neighborhoods and k-distances with rayon.

pub mod catalog;
pub mod classify;
pub mod cluster;
pub mod config;
/// Error types used across `playstyle`.
pub mod error;
pub mod features;
pub mod metrics;
pub mod pipeline;
pub mod recommend;
pub mod signature;


pub use catalog::{GameTagMap, UserLibraries, UserLibrary};
pub use classify::{KnnClassifier, StratifiedKFold, TrainedClassifier};
pub use cluster::{
    ClusterLabel, Clustering, Dbscan, Interpolation, KDistanceProfile, NeighborDistanceProfiler,
    NOISE,
};
pub use config::{ConfigError, PipelineConfig};
pub use error::{Error, Result};
pub use features::{FeatureMatrix, FeatureMatrixBuilder, FeatureVector, Normalization, Vocabulary};
pub use metrics::{ari, label_agreement, nmi, purity, ClusteringScores};
pub use pipeline::{ClusterAssignment, Pipeline, TrainingRun};
pub use recommend::{Recommendation, RecommendationScorer};
pub use signature::{ClusterSignatureMerger, MergeStrategy, MergedClusters, TagSignature};
