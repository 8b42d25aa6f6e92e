//! Per-cluster feature vectors.
//!
//! Feature layout, in vector order:
//!
//! | group | values | standard | extended |
//! |---|---|---|---|
//! | point count | 1 | ✓ | ✓ |
//! | minimum squared range | 1 | ✓ | ✓ |
//! | covariance of PCA-projected points | 6 | ✓ | ✓ |
//! | moment of inertia tensor | 6 | ✓ | ✓ |
//! | three-zone 2D covariance | 9 | | ✓ |
//! | main plane histogram (7 × 14) | 98 | | ✓ |
//! | secondary plane histogram (5 × 9) | 45 | | ✓ |
//! | slice profile (10 blocks × 2) | 20 | ✓ | ✓ |
//!
//! The order has to match the index column of the range table the model was
//! trained with.

use nalgebra::{Matrix3, Vector3};

use super::segmentation::Cluster;
use crate::config::FeatureSet;
use crate::core::transforms::{min_max, to_vector, BoundingBox, Pca};

const SLICE_BLOCKS: usize = 10;
const MAIN_HISTOGRAM: (usize, usize) = (7, 14);
const SECONDARY_HISTOGRAM: (usize, usize) = (5, 9);

/// Geometry of a cluster plus its feature vector.
///
/// `values` is `None` when running without a classifier: only the geometry
/// is needed then.
#[derive(Debug, Clone)]
pub struct Feature {
    pub centroid: Vector3<f64>,
    pub bbox: BoundingBox,
    pub values: Option<Vec<f64>>,
}

impl Feature {
    /// Geometry-only feature.
    pub fn geometry(cluster: &Cluster) -> Self {
        Self {
            centroid: cluster.centroid,
            bbox: cluster.bbox,
            values: None,
        }
    }
}

/// Computes feature vectors of a fixed [`FeatureSet`].
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    set: FeatureSet,
}

impl FeatureExtractor {
    pub fn new(set: FeatureSet) -> Self {
        Self { set }
    }

    pub fn set(&self) -> FeatureSet {
        self.set
    }

    /// Length of every vector this extractor produces.
    pub fn dimension(&self) -> usize {
        self.set.len()
    }

    /// Geometry plus the full feature vector.
    pub fn extract(&self, cluster: &Cluster) -> Feature {
        Feature {
            values: Some(self.compute(cluster)),
            ..Feature::geometry(cluster)
        }
    }

    /// Feature vector of `cluster`; degenerate geometry yields zeros.
    pub fn compute(&self, cluster: &Cluster) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.dimension());
        let points = &cluster.points;

        values.push(points.len() as f64);
        values.push(min_squared_range(points));

        let Some(pca) = Pca::fit(points) else {
            values.resize(self.dimension(), 0.0);
            return values;
        };
        let projected = pca.project_all(points);

        let covariance = normalized_covariance(&projected, &cluster.centroid);
        values.extend(upper_triangle(&covariance));
        values.extend(upper_triangle(&inertia_tensor(&projected)));

        if self.set == FeatureSet::Extended {
            let main_normal = pca.eigenvectors.column(2).into_owned();
            let secondary_normal = pca.eigenvectors.column(1).into_owned();
            let main_plane = project_onto_plane(points, &main_normal, &cluster.centroid);
            let secondary_plane = project_onto_plane(points, &secondary_normal, &cluster.centroid);

            values.extend(three_zone_covariance(&main_plane, &pca.mean));
            values.extend(histogram(&main_plane, MAIN_HISTOGRAM.0, MAIN_HISTOGRAM.1));
            values.extend(histogram(
                &secondary_plane,
                SECONDARY_HISTOGRAM.0,
                SECONDARY_HISTOGRAM.1,
            ));
        }

        values.extend(slice_profile(points, SLICE_BLOCKS));

        debug_assert_eq!(values.len(), self.dimension());
        values
    }
}

/// Smallest squared distance from the sensor origin.
fn min_squared_range(points: &[[f32; 3]]) -> f64 {
    points
        .iter()
        .map(|p| to_vector(p).norm_squared())
        .fold(f64::INFINITY, f64::min)
}

/// Entries (0,0), (0,1), (0,2), (1,1), (1,2), (2,2).
fn upper_triangle(m: &Matrix3<f64>) -> [f64; 6] {
    [m[(0, 0)], m[(0, 1)], m[(0, 2)], m[(1, 1)], m[(1, 2)], m[(2, 2)]]
}

/// `Σ (p - c)(p - c)ᵀ / N`.
///
/// `center` is the cluster centroid in sensor coordinates, not the mean of
/// `points`; trained models depend on this convention.
fn normalized_covariance(points: &[Vector3<f64>], center: &Vector3<f64>) -> Matrix3<f64> {
    if points.is_empty() {
        return Matrix3::zeros();
    }
    let scatter = points.iter().fold(Matrix3::zeros(), |acc: Matrix3<f64>, p| {
        let d = p - center;
        acc + d * d.transpose()
    });
    scatter / points.len() as f64
}

/// Unnormalized moment of inertia about the origin of the projected frame.
fn inertia_tensor(points: &[Vector3<f64>]) -> Matrix3<f64> {
    let mut m = Matrix3::zeros();
    for p in points {
        let (x, y, z) = (p.x, p.y, p.z);
        m[(0, 0)] += y * y + z * z;
        m[(0, 1)] -= x * y;
        m[(0, 2)] -= x * z;
        m[(1, 1)] += x * x + z * z;
        m[(1, 2)] -= y * z;
        m[(2, 2)] += x * x + y * y;
    }
    m[(1, 0)] = m[(0, 1)];
    m[(2, 0)] = m[(0, 2)];
    m[(2, 1)] = m[(1, 2)];
    m
}

/// Orthogonal projection of `points` onto the plane through `origin` with
/// unit normal `normal`.
fn project_onto_plane(
    points: &[[f32; 3]],
    normal: &Vector3<f64>,
    origin: &Vector3<f64>,
) -> Vec<Vector3<f64>> {
    let offset = -normal.dot(origin);
    points
        .iter()
        .map(|p| {
            let p = to_vector(p);
            let distance = normal.dot(&p) + offset;
            p - normal * distance
        })
        .collect()
}

/// 2D covariance of the upper half and of the left and right lower halves.
fn three_zone_covariance(plane: &[Vector3<f64>], mean: &Vector3<f64>) -> [f64; 9] {
    let mut zones: [Vec<Vector3<f64>>; 3] = Default::default();
    for p in plane {
        let zone = if p.z >= mean.z {
            0
        } else if p.y >= mean.y {
            1
        } else {
            2
        };
        zones[zone].push(*p);
    }

    let mut out = [0.0; 9];
    for (i, zone) in zones.iter().enumerate() {
        if zone.is_empty() {
            continue;
        }
        let c = zone
            .iter()
            .fold(Vector3::zeros(), |acc: Vector3<f64>, p| acc + p)
            / zone.len() as f64;
        let m = zone.iter().fold(Matrix3::zeros(), |acc: Matrix3<f64>, p| {
            let d = p - c;
            acc + d * d.transpose()
        });
        out[i * 3] = m[(0, 0)];
        out[i * 3 + 1] = m[(0, 1)];
        out[i * 3 + 2] = m[(1, 1)];
    }
    out
}

/// Fraction of points per `(horizontal, vertical)` bin.
///
/// The horizontal axis is whichever of x and y has the larger extent. Bins
/// are closed boxes, so a point on a shared edge counts in both; the last
/// bin on each axis ends exactly at the maximum.
fn histogram(points: &[Vector3<f64>], horiz_bins: usize, verti_bins: usize) -> Vec<f64> {
    let mut hist = vec![0.0; horiz_bins * verti_bins];
    let Some((min, max)) = min_max(points) else {
        return hist;
    };

    let along_x = max.x - min.x > max.y - min.y;
    let horiz_axis = if along_x { 0 } else { 1 };
    let other_axis = 1 - horiz_axis;
    let horiz_itv = (max[horiz_axis] - min[horiz_axis]) / horiz_bins as f64;
    let verti_itv = (max.z - min.z) / verti_bins as f64;
    let n = points.len() as f64;

    for i in 0..horiz_bins {
        let h_lo = min[horiz_axis] + horiz_itv * i as f64;
        let h_hi = if i + 1 == horiz_bins {
            max[horiz_axis]
        } else {
            min[horiz_axis] + horiz_itv * (i + 1) as f64
        };
        for j in 0..verti_bins {
            let v_lo = min.z + verti_itv * j as f64;
            let v_hi = if j + 1 == verti_bins {
                max.z
            } else {
                min.z + verti_itv * (j + 1) as f64
            };
            let count = points
                .iter()
                .filter(|p| {
                    p[horiz_axis] >= h_lo
                        && p[horiz_axis] <= h_hi
                        && p[other_axis] >= min[other_axis]
                        && p[other_axis] <= max[other_axis]
                        && p.z >= v_lo
                        && p.z <= v_hi
                })
                .count();
            hist[i * verti_bins + j] = count as f64 / n;
        }
    }
    hist
}

/// Principal-plane extents of `blocks` equal-height slices, bottom first.
fn slice_profile(points: &[[f32; 3]], blocks: usize) -> Vec<f64> {
    let mut slice = vec![0.0; blocks * 2];
    let Some(bbox) = BoundingBox::from_points(points) else {
        return slice;
    };
    let z_min = bbox.min[2] as f64;
    let itv = (bbox.max[2] as f64 - z_min) / blocks as f64;
    if !(itv > 0.0) {
        return slice;
    }

    let mut members: Vec<Vec<[f32; 3]>> = vec![Vec::new(); blocks];
    for p in points {
        let block = (((p[2] as f64 - z_min) / itv) as usize).min(blocks - 1);
        members[block].push(*p);
    }

    for (i, block) in members.iter().enumerate() {
        if block.len() <= 2 {
            continue;
        }
        let Some(pca) = Pca::fit(block) else {
            continue;
        };
        if let Some((lo, hi)) = min_max(&pca.project_all(block)) {
            slice[i * 2] = hi.x - lo.x;
            slice[i * 2 + 1] = hi.y - lo.y;
        }
    }
    slice
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Upright box of points: 0.4 m wide along x, 0.2 m deep, 1.8 m tall.
    fn pedestrian() -> Cluster {
        let mut points = Vec::new();
        for level in 0..19 {
            for k in 0..5 {
                let x = 5.0 + k as f32 * 0.1;
                let y = if (level + k) % 2 == 0 { 0.1 } else { -0.1 };
                points.push([x, y, -0.7 + level as f32 * 0.1]);
            }
        }
        Cluster::from_points(2, &points).unwrap()
    }

    #[test]
    fn test_standard_vector_length_and_prefix() {
        let cluster = pedestrian();
        let values = FeatureExtractor::new(FeatureSet::Standard).compute(&cluster);
        assert_eq!(values.len(), 34);
        assert_eq!(values[0], 95.0);
        // Closest point is (5.0, ±0.1, 0.0) at level 7.
        assert!((values[1] - (25.0 + 0.01)).abs() < 1e-4);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_extended_vector_layout() {
        let cluster = pedestrian();
        let standard = FeatureExtractor::new(FeatureSet::Standard).compute(&cluster);
        let extended = FeatureExtractor::new(FeatureSet::Extended).compute(&cluster);
        assert_eq!(extended.len(), 186);

        // Shared groups keep their values; slices move to the end.
        assert_eq!(&extended[..14], &standard[..14]);
        assert_eq!(&extended[166..], &standard[14..]);

        // Each histogram sums to at least one (edge points count twice).
        let main: f64 = extended[23..121].iter().sum();
        let secondary: f64 = extended[121..166].iter().sum();
        assert!(main >= 1.0 - 1e-9);
        assert!(secondary >= 1.0 - 1e-9);
        assert!(extended[23..166].iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_geometry_only_feature() {
        let cluster = pedestrian();
        let feature = Feature::geometry(&cluster);
        assert!(feature.values.is_none());
        assert_eq!(feature.bbox, cluster.bbox);

        let full = FeatureExtractor::new(FeatureSet::Standard).extract(&cluster);
        assert_eq!(full.values.map(|v| v.len()), Some(34));
    }

    #[test]
    fn test_flat_cluster_has_zero_slices() {
        let points: Vec<[f32; 3]> = (0..10).map(|i| [3.0 + i as f32 * 0.05, 0.0, 0.2]).collect();
        let cluster = Cluster::from_points(1, &points).unwrap();
        let values = FeatureExtractor::new(FeatureSet::Standard).compute(&cluster);
        assert!(values[14..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sparse_blocks_contribute_zero() {
        // Dense bottom block, two points at the top: blocks 1..9 stay empty
        // or too small.
        let mut points: Vec<[f32; 3]> = (0..6)
            .map(|i| [(i % 3) as f32 * 0.1, (i / 3) as f32 * 0.1, 0.0])
            .collect();
        points.push([0.0, 0.0, 1.0]);
        points.push([0.1, 0.0, 1.0]);

        let slice = slice_profile(&points, 10);
        assert!(slice[0] > 0.0 && slice[1] > 0.0);
        assert!(slice[2..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_inertia_tensor_entries() {
        let m = inertia_tensor(&[Vector3::new(1.0, 2.0, 3.0)]);
        assert_eq!(upper_triangle(&m), [13.0, -2.0, -3.0, 10.0, -6.0, 5.0]);
        assert_eq!(m, m.transpose());
    }

    #[test]
    fn test_covariance_about_given_center() {
        let points = [Vector3::new(1.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)];
        let about_mean = normalized_covariance(&points, &Vector3::zeros());
        assert_eq!(about_mean[(0, 0)], 1.0);

        let shifted = normalized_covariance(&points, &Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(shifted[(0, 0)], 2.0);
    }

    #[test]
    fn test_three_zone_split() {
        let mean = Vector3::zeros();
        let plane = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(2.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, -1.0),
        ];
        let zones = three_zone_covariance(&plane, &mean);
        // Upper zone: x spread of ±1 about its own centroid.
        assert_eq!(zones[0], 2.0);
        // Single point and empty zones have zero covariance.
        assert!(zones[3..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_histogram_uses_wider_axis() {
        // Spread along y; x is constant.
        let points: Vec<Vector3<f64>> = (0..4)
            .map(|i| Vector3::new(0.0, i as f64, i as f64))
            .collect();
        let hist = histogram(&points, 2, 2);
        // No point sits on the 1.5 edges, so nothing is counted twice.
        assert_eq!(hist, vec![0.5, 0.0, 0.0, 0.5]);
    }
}
