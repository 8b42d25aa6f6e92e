//! Height filtering and radial zone partitioning.
//!
//! The ground and anything overhanging the sensor are removed with a simple
//! z pass-through, then every surviving point is bucketed into one of the
//! nested radial zones. Zone membership is decided on squared distances so no
//! square root is taken per point.

use crate::config::ZoneConfig;
use crate::core::loaders::PointCloud;

/// Squared inner/outer radius of each zone, innermost first.
#[derive(Debug, Clone)]
pub struct ZoneLayout {
    bounds: Vec<(f64, f64)>,
}

impl ZoneLayout {
    /// Build the layout from zone widths (meters).
    pub fn new(widths: &[f64]) -> Self {
        let mut range = 0.0f64;
        let bounds = widths
            .iter()
            .map(|w| {
                let inner = range * range;
                range += w;
                (inner, range * range)
            })
            .collect();
        Self { bounds }
    }

    pub fn from_config(config: &ZoneConfig) -> Self {
        Self::new(&config.widths)
    }

    /// Number of zones.
    #[inline]
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Zone whose interval `[inner, outer)` holds the squared distance `d2`.
    ///
    /// Returns `None` past the outermost zone or for non-finite input.
    #[inline]
    pub fn zone_of(&self, d2: f64) -> Option<usize> {
        if !d2.is_finite() {
            return None;
        }
        self.bounds
            .iter()
            .position(|&(inner, outer)| d2 >= inner && d2 < outer)
    }
}

/// Result of bucketing a filtered cloud into zones.
///
/// Indices refer to positions in the filtered cloud. Every index appears in
/// exactly one zone or in `out_of_range`.
#[derive(Debug, Clone, Default)]
pub struct ZonePartition {
    pub zones: Vec<Vec<usize>>,
    pub out_of_range: Vec<usize>,
}

impl ZonePartition {
    /// Total number of points assigned to a zone.
    pub fn zoned_len(&self) -> usize {
        self.zones.iter().map(Vec::len).sum()
    }
}

/// Filtered frame ready for clustering.
#[derive(Debug, Clone, Default)]
pub struct Preprocessed {
    /// Height-filtered points in original order.
    pub points: Vec<[f32; 3]>,
    pub partition: ZonePartition,
}

impl Preprocessed {
    /// Copy the points of zone `zone` into a contiguous buffer.
    pub fn zone_points(&self, zone: usize) -> Vec<[f32; 3]> {
        self.partition.zones[zone]
            .iter()
            .map(|&i| self.points[i])
            .collect()
    }
}

/// Keep points with `z_min <= z <= z_max`, preserving order.
///
/// NaN heights never satisfy the bounds and are dropped.
pub fn filter_height(cloud: &PointCloud, z_min: f64, z_max: f64) -> Vec<[f32; 3]> {
    let mut kept = Vec::with_capacity(cloud.len());
    for i in 0..cloud.len() {
        let z = cloud.z[i] as f64;
        if z >= z_min && z <= z_max {
            kept.push(cloud.point(i));
        }
    }
    kept
}

/// Bucket points into zones by squared distance from the sensor origin.
pub fn partition_zones(points: &[[f32; 3]], layout: &ZoneLayout) -> ZonePartition {
    let mut partition = ZonePartition {
        zones: vec![Vec::new(); layout.len()],
        out_of_range: Vec::new(),
    };

    for (i, p) in points.iter().enumerate() {
        let (x, y, z) = (p[0] as f64, p[1] as f64, p[2] as f64);
        let d2 = x * x + y * y + z * z;
        match layout.zone_of(d2) {
            Some(zone) => partition.zones[zone].push(i),
            None => partition.out_of_range.push(i),
        }
    }

    partition
}

/// Height filter followed by zone partitioning.
pub fn preprocess(cloud: &PointCloud, z_min: f64, z_max: f64, layout: &ZoneLayout) -> Preprocessed {
    let points = filter_height(cloud, z_min, z_max);
    let partition = partition_zones(&points, layout);

    if !partition.out_of_range.is_empty() {
        log::debug!(
            "{} of {} points lie outside the outermost zone",
            partition.out_of_range.len(),
            points.len()
        );
    }

    Preprocessed { points, partition }
}
