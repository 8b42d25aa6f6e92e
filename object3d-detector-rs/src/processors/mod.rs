//! Per-frame processing stages.

pub mod classifier;
pub mod clustering;
pub mod features;
pub mod filtering;
pub mod segmentation;

// Re-export key types for convenience
pub use classifier::{Classifier, Decision};
pub use clustering::{build_extractor, ClusterExtractor, ExtractError, ExtractParams};
pub use features::{Feature, FeatureExtractor};
pub use filtering::{preprocess, Preprocessed, ZoneLayout, ZonePartition};
pub use segmentation::{Cluster, SegmentationStats, ZoneClusterer};
