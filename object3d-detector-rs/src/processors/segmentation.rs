//! Zone-wise cluster extraction.
//!
//! Each radial zone is clustered on its own with a tolerance that grows with
//! range, so that sparse far-away returns still form objects. A zone that
//! feeds the backend bad input is logged and contributes nothing; resource
//! exhaustion aborts the frame.

use nalgebra::Vector3;
use rayon::prelude::*;

use super::clustering::{build_extractor, ClusterExtractor, ExtractError, ExtractParams};
use super::filtering::Preprocessed;
use crate::config::{Connectivity, DetectorConfig};
use crate::core::transforms::{centroid, BoundingBox};

/// Width/depth and height bounds (meters) of a person-sized box.
const HUMAN_WIDTH: (f32, f32) = (0.2, 1.0);
const HUMAN_HEIGHT: (f32, f32) = (0.5, 2.0);

/// A group of connected points from one zone.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub zone: usize,
    pub points: Vec<[f32; 3]>,
    pub bbox: BoundingBox,
    pub centroid: Vector3<f64>,
}

impl Cluster {
    /// Wrap extracted points; `None` for an empty slice.
    pub fn from_points(zone: usize, points: &[[f32; 3]]) -> Option<Self> {
        let bbox = BoundingBox::from_points(points)?;
        Some(Self {
            zone,
            points: points.to_vec(),
            bbox,
            centroid: centroid(points),
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether the bounding box has plausible pedestrian dimensions.
    pub fn is_human_sized(&self) -> bool {
        let [dx, dy, dz] = self.bbox.extent();
        let within = |v: f32, (lo, hi): (f32, f32)| !(v < lo || v > hi);
        within(dx, HUMAN_WIDTH) && within(dy, HUMAN_WIDTH) && within(dz, HUMAN_HEIGHT)
    }
}

/// Counters describing one segmentation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentationStats {
    /// Zones with enough points to be handed to the backend.
    pub zones_clustered: usize,
    /// Zones whose input the backend rejected.
    pub zones_failed: usize,
    /// Clusters returned by the backend before the size filter.
    pub raw_clusters: usize,
    /// Clusters dropped by the human size limit.
    pub size_rejected: usize,
}

#[derive(Default)]
struct ZoneOutput {
    clusters: Vec<Cluster>,
    attempted: bool,
    failed: bool,
    raw: usize,
    rejected: usize,
}

/// Runs the clustering backend over every zone of a preprocessed frame.
pub struct ZoneClusterer {
    extractor: Box<dyn ClusterExtractor>,
    tolerances: Vec<f32>,
    min_cluster_size: usize,
    max_cluster_size: usize,
    connectivity: Connectivity,
    parallel: bool,
    human_size_limit: bool,
}

impl ZoneClusterer {
    pub fn new(config: &DetectorConfig) -> Self {
        Self::with_extractor(config, build_extractor(&config.clustering))
    }

    /// Use a caller-supplied backend instead of the configured one.
    pub fn with_extractor(config: &DetectorConfig, extractor: Box<dyn ClusterExtractor>) -> Self {
        let tolerances = (0..config.zones.widths.len())
            .map(|i| config.zones.tolerance(i))
            .collect();
        Self {
            extractor,
            tolerances,
            min_cluster_size: config.cluster_size_min,
            max_cluster_size: config.cluster_size_max,
            connectivity: config.clustering.connectivity,
            parallel: config.clustering.parallel_zones,
            human_size_limit: config.human_size_limit,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.extractor.name()
    }

    /// Cluster all zones, returning clusters in zone order.
    pub fn extract(
        &self,
        frame: &Preprocessed,
    ) -> Result<(Vec<Cluster>, SegmentationStats), ExtractError> {
        let zone_count = frame.partition.zones.len();

        let outputs: Vec<Result<ZoneOutput, ExtractError>> = if self.parallel {
            (0..zone_count)
                .into_par_iter()
                .map(|zone| self.extract_zone(frame, zone))
                .collect()
        } else {
            (0..zone_count)
                .map(|zone| self.extract_zone(frame, zone))
                .collect()
        };

        let mut clusters = Vec::new();
        let mut stats = SegmentationStats::default();
        for output in outputs {
            let output = output?;
            stats.zones_clustered += output.attempted as usize;
            stats.zones_failed += output.failed as usize;
            stats.raw_clusters += output.raw;
            stats.size_rejected += output.rejected;
            clusters.extend(output.clusters);
        }
        Ok((clusters, stats))
    }

    fn extract_zone(&self, frame: &Preprocessed, zone: usize) -> Result<ZoneOutput, ExtractError> {
        let count = frame.partition.zones[zone].len();
        if count <= self.min_cluster_size {
            return Ok(ZoneOutput::default());
        }

        let tolerance = self
            .tolerances
            .get(zone)
            .copied()
            .unwrap_or_else(|| self.tolerances.last().copied().unwrap_or(0.0));
        let params = ExtractParams::new(
            tolerance,
            self.min_cluster_size,
            self.max_cluster_size,
            self.connectivity,
        );

        let points = frame.zone_points(zone);
        let buffer = match self.extractor.extract(&points, &params) {
            Ok(buffer) => buffer,
            Err(e) if !e.is_frame_fatal() => {
                log::warn!("zone {} ({} points) skipped: {}", zone, count, e);
                return Ok(ZoneOutput {
                    attempted: true,
                    failed: true,
                    ..ZoneOutput::default()
                });
            }
            Err(e) => return Err(e),
        };

        let mut output = ZoneOutput {
            attempted: true,
            raw: buffer.len(),
            ..ZoneOutput::default()
        };
        for members in buffer.iter() {
            let Some(cluster) = Cluster::from_points(zone, members) else {
                continue;
            };
            if self.human_size_limit && !cluster.is_human_sized() {
                output.rejected += 1;
                continue;
            }
            output.clusters.push(cluster);
        }

        log::debug!(
            "zone {}: {} points, tolerance {:.2}, {} clusters kept of {}",
            zone,
            count,
            tolerance,
            output.clusters.len(),
            output.raw
        );
        Ok(output)
    }
}
