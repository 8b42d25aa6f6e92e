//! Configuration types for the detector.
//!
//! Top-level keys mirror the detector's historical parameter names
//! (`z_limit_min`, `cluster_size_min`, `human_probability`, ...) so existing
//! parameter files carry over; tuning knobs added later live in nested sections.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Radial zone layout used to adapt clustering tolerance to range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Width of each nested zone in meters, innermost first.
    #[serde(default = "default_zone_widths")]
    pub widths: Vec<f64>,

    /// Tolerance increment per zone; zone `i` clusters with `step * (i + 1)`.
    #[serde(default = "default_tolerance_step")]
    pub tolerance_step: f32,
}

fn default_zone_widths() -> Vec<f64> {
    vec![2.0, 3.0, 3.0, 3.0, 3.0, 3.0, 3.0, 2.0, 3.0, 3.0, 3.0, 3.0, 3.0, 3.0]
}

fn default_tolerance_step() -> f32 {
    0.1
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            widths: default_zone_widths(),
            tolerance_step: default_tolerance_step(),
        }
    }
}

impl ZoneConfig {
    /// Clustering tolerance for the zone at `index`.
    #[inline]
    pub fn tolerance(&self, index: usize) -> f32 {
        self.tolerance_step * (index as f32 + 1.0)
    }

    /// Outer radius of the outermost zone.
    pub fn outer_radius(&self) -> f64 {
        self.widths.iter().sum()
    }
}

/// Which clustering implementation backs the zone extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    /// Hash grid neighbour search with union-find merging.
    VoxelGrid,
    /// Exhaustive pairwise comparison; slow, used as a reference.
    BruteForce,
}

/// Neighbour test used when linking two points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// Per-axis test `|dx| <= tol && |dy| <= tol && |dz| <= tol`.
    Voxel,
    /// Straight-line distance `|p - q| <= tol`.
    Euclidean,
}

/// Configuration for the clustering stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_backend")]
    pub backend: ClusterBackend,

    #[serde(default = "default_connectivity")]
    pub connectivity: Connectivity,

    /// Cluster zones on the rayon pool instead of one after another
    #[serde(default = "default_parallel_zones")]
    pub parallel_zones: bool,

    /// Largest zone the extractor will accept before giving up on the frame
    #[serde(default = "default_max_zone_points")]
    pub max_zone_points: usize,
}

fn default_backend() -> ClusterBackend {
    ClusterBackend::VoxelGrid
}

fn default_connectivity() -> Connectivity {
    Connectivity::Voxel
}

fn default_parallel_zones() -> bool {
    true
}

fn default_max_zone_points() -> usize {
    2_000_000
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connectivity: default_connectivity(),
            parallel_zones: default_parallel_zones(),
            max_zone_points: default_max_zone_points(),
        }
    }
}

/// Feature groups computed for each cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    /// Count, distance, covariance, inertia and slice profile (34 values).
    Standard,
    /// Standard groups plus three-zone covariance and the two plane
    /// histograms (186 values).
    Extended,
}

impl FeatureSet {
    /// Length of the feature vector produced for this set.
    pub const fn len(self) -> usize {
        match self {
            FeatureSet::Standard => 34,
            FeatureSet::Extended => 186,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_feature_set")]
    pub set: FeatureSet,
}

fn default_feature_set() -> FeatureSet {
    FeatureSet::Standard
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            set: default_feature_set(),
        }
    }
}

/// Classifier decision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Model label treated as "human".
    #[serde(default = "default_positive_label")]
    pub positive_label: i32,
}

fn default_positive_label() -> i32 {
    1
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            positive_label: default_positive_label(),
        }
    }
}

/// Frame-rate reporting and streaming settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Number of frames averaged per frame-rate report.
    #[serde(default = "default_report_every")]
    pub report_every: usize,

    /// Frames buffered between the reader thread and the detector.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_report_every() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    2
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            report_every: default_report_every(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Main detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub print_fps: bool,

    #[serde(default = "default_frame_id")]
    pub frame_id: String,

    /// Points below this height are treated as ground.
    #[serde(default = "default_z_limit_min")]
    pub z_limit_min: f64,

    /// Points above this height are treated as ceiling/overhang.
    #[serde(default = "default_z_limit_max")]
    pub z_limit_max: f64,

    #[serde(default = "default_cluster_size_min")]
    pub cluster_size_min: usize,

    #[serde(default = "default_cluster_size_max")]
    pub cluster_size_max: usize,

    /// Minimum probability of the positive class to accept a cluster.
    #[serde(default = "default_human_probability")]
    pub human_probability: f64,

    /// Reject clusters whose bounding box is not roughly person-sized.
    #[serde(default)]
    pub human_size_limit: bool,

    #[serde(default)]
    pub model_file_name: Option<PathBuf>,

    #[serde(default)]
    pub range_file_name: Option<PathBuf>,

    #[serde(default)]
    pub zones: ZoneConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

fn default_frame_id() -> String {
    "rslidar".to_string()
}

fn default_z_limit_min() -> f64 {
    -0.8
}

fn default_z_limit_max() -> f64 {
    1.2
}

fn default_cluster_size_min() -> usize {
    5
}

fn default_cluster_size_max() -> usize {
    30_000
}

fn default_human_probability() -> f64 {
    0.7
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            print_fps: false,
            frame_id: default_frame_id(),
            z_limit_min: default_z_limit_min(),
            z_limit_max: default_z_limit_max(),
            cluster_size_min: default_cluster_size_min(),
            cluster_size_max: default_cluster_size_max(),
            human_probability: default_human_probability(),
            human_size_limit: false,
            model_file_name: None,
            range_file_name: None,
            zones: ZoneConfig::default(),
            clustering: ClusteringConfig::default(),
            features: FeatureConfig::default(),
            classifier: ClassifierConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DetectorConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.z_limit_min <= self.z_limit_max) {
            return Err(ConfigError::Invalid(format!(
                "z_limit_min ({}) must not exceed z_limit_max ({})",
                self.z_limit_min, self.z_limit_max
            )));
        }
        if self.cluster_size_min > self.cluster_size_max {
            return Err(ConfigError::Invalid(format!(
                "cluster_size_min ({}) must not exceed cluster_size_max ({})",
                self.cluster_size_min, self.cluster_size_max
            )));
        }
        if !(0.0..=1.0).contains(&self.human_probability) {
            return Err(ConfigError::Invalid(format!(
                "human_probability ({}) must lie in [0, 1]",
                self.human_probability
            )));
        }
        if self.zones.widths.is_empty() || self.zones.widths.iter().any(|w| !(*w > 0.0)) {
            return Err(ConfigError::Invalid(
                "zones.widths must be a non-empty list of positive widths".to_string(),
            ));
        }
        if !(self.zones.tolerance_step > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "zones.tolerance_step ({}) must be positive",
                self.zones.tolerance_step
            )));
        }
        if self.diagnostics.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "diagnostics.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
