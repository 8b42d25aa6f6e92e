//! Real-time pedestrian candidate detection in LiDAR point clouds.
//!
//! This crate provides tools for:
//! - Height filtering and radial zone partitioning of a sweep
//! - Per-zone Euclidean clustering with a distance-adaptive tolerance
//! - Geometric cluster features (covariance, inertia, slice profile, histograms)
//! - libsvm classification with svm-scale range tables, or model-free passthrough
//!
//! # Example
//!
//! ```no_run
//! use object3d_detector::{core::loaders::{load_ply, Frame}, Detector, DetectorConfig};
//!
//! let cloud = load_ply("scan_000001.ply").unwrap();
//! let mut detector = Detector::new(DetectorConfig::default());
//! let report = detector.process(&Frame::new(1, "rslidar", cloud)).unwrap();
//! println!("{} detections", report.detections.len());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod model;
pub mod pipeline;
pub mod processors;
pub mod visualization;

pub use config::{ClusteringConfig, DetectorConfig, FeatureSet, ZoneConfig};
pub use core::loaders::{Frame, PointCloud};
pub use pipeline::{Detection, Detector, FrameDetections, FrameReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
