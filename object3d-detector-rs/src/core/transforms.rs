//! Geometric primitives shared by the clustering and feature stages.
//!
//! Positions are stored as `f32` like the sensor delivers them; statistics
//! (centroids, covariance, eigen decomposition) accumulate in `f64`.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

/// Corner selectors for the 12 box edges, two endpoints each; `true` picks
/// the max coordinate on that axis.
const WIREFRAME_CORNERS: [[bool; 3]; 24] = [
    [true, true, true],
    [false, true, true],
    [true, true, true],
    [true, false, true],
    [true, true, true],
    [true, true, false],
    [false, false, false],
    [true, false, false],
    [false, false, false],
    [false, true, false],
    [false, false, false],
    [false, false, true],
    [false, true, true],
    [false, true, false],
    [false, true, true],
    [false, false, true],
    [true, false, true],
    [true, false, false],
    [true, false, true],
    [false, false, true],
    [true, true, false],
    [false, true, false],
    [true, true, false],
    [true, false, false],
];

impl BoundingBox {
    /// Tight box around `points`, or `None` when there are no points.
    pub fn from_points(points: &[[f32; 3]]) -> Option<Self> {
        let first = points.first()?;
        let mut min = *first;
        let mut max = *first;
        for p in &points[1..] {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some(Self { min, max })
    }

    /// Size along x, y and z.
    #[inline]
    pub fn extent(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Inclusive containment test.
    #[inline]
    pub fn contains(&self, p: &[f32; 3]) -> bool {
        (0..3).all(|axis| p[axis] >= self.min[axis] && p[axis] <= self.max[axis])
    }

    /// Box edges as 12 line segments (24 endpoints) for line-list markers.
    pub fn wireframe(&self) -> [[f32; 3]; 24] {
        let mut points = [[0.0f32; 3]; 24];
        for (point, corner) in points.iter_mut().zip(WIREFRAME_CORNERS.iter()) {
            for axis in 0..3 {
                point[axis] = if corner[axis] {
                    self.max[axis]
                } else {
                    self.min[axis]
                };
            }
        }
        points
    }
}

/// Mean position of `points` in double precision. Zero for an empty slice.
pub fn centroid(points: &[[f32; 3]]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum = points.iter().fold(Vector3::zeros(), |acc: Vector3<f64>, p| {
        acc + to_vector(p)
    });
    sum / points.len() as f64
}

#[inline]
pub fn to_vector(p: &[f32; 3]) -> Vector3<f64> {
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}

/// Principal component analysis of a point set.
///
/// Eigenvectors are the columns of `eigenvectors`, ordered by decreasing
/// eigenvalue. The first two axes are sign-normalised so their largest
/// component is positive and the third is their cross product, which keeps
/// the basis right-handed and the projection reproducible.
#[derive(Debug, Clone)]
pub struct Pca {
    pub mean: Vector3<f64>,
    pub eigenvalues: Vector3<f64>,
    pub eigenvectors: Matrix3<f64>,
}

impl Pca {
    /// Fit the principal axes. Returns `None` for an empty input.
    pub fn fit(points: &[[f32; 3]]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let mean = centroid(points);
        let mut scatter = Matrix3::zeros();
        for p in points {
            let d = to_vector(p) - mean;
            scatter += d * d.transpose();
        }
        let denom = (points.len() as f64 - 1.0).max(1.0);
        let covariance = scatter / denom;

        let eig = SymmetricEigen::new(covariance);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

        let mut eigenvalues = Vector3::zeros();
        let mut eigenvectors = Matrix3::zeros();
        for (col, &src) in order.iter().enumerate() {
            eigenvalues[col] = eig.eigenvalues[src];
            eigenvectors.set_column(col, &eig.eigenvectors.column(src));
        }

        for col in 0..2 {
            let v: Vector3<f64> = eigenvectors.column(col).into_owned();
            let dominant = v.iter().copied().fold(0.0f64, |best, c| {
                if c.abs() > best.abs() {
                    c
                } else {
                    best
                }
            });
            if dominant < 0.0 {
                eigenvectors.set_column(col, &(-v));
            }
        }
        let third = eigenvectors.column(0).cross(&eigenvectors.column(1));
        eigenvectors.set_column(2, &third);

        Some(Self {
            mean,
            eigenvalues,
            eigenvectors,
        })
    }

    /// Coordinates of `p` in the principal basis, relative to the mean.
    #[inline]
    pub fn project(&self, p: &[f32; 3]) -> Vector3<f64> {
        self.eigenvectors.transpose() * (to_vector(p) - self.mean)
    }

    pub fn project_all(&self, points: &[[f32; 3]]) -> Vec<Vector3<f64>> {
        points.iter().map(|p| self.project(p)).collect()
    }
}

/// Per-axis minimum and maximum of a set of vectors.
pub fn min_max(points: &[Vector3<f64>]) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let first = points.first()?;
    let mut min = *first;
    let mut max = *first;
    for p in &points[1..] {
        min = min.inf(p);
        max = max.sup(p);
    }
    Some((min, max))
}
