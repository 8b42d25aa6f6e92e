//! Euclidean cluster extraction.
//!
//! The zone extractor talks to clustering through the [`ClusterExtractor`]
//! trait: given a flat array of positions, a link tolerance and cluster size
//! bounds, return a partition of the input into connected groups. Two points
//! share a cluster iff a chain of points, each within tolerance of the next,
//! connects them.
//!
//! Backends:
//! - [`VoxelGridExtractor`]: hash grid with tolerance-sized cells for
//!   neighbour lookup, `rayon` for the parallel neighbour pass, lock-free
//!   union-find for merging. Coincident points and degenerate axes only
//!   fill cells, they never change the lookup structure
//! - [`BruteForceExtractor`]: exhaustive pairwise linking, the reference
//!
//! Output is deterministic for a given input order: clusters are numbered by
//! their lowest input index and members keep ascending input order, no
//! matter how the parallel merges interleave.

use std::collections::{HashMap, TryReserveError};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use thiserror::Error;

use crate::config::{ClusterBackend, ClusteringConfig, Connectivity};

/// Errors raised by a clustering backend.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Input the backend cannot cluster (non-finite positions, bad tolerance).
    #[error("invalid clustering input: {0}")]
    InvalidInput(String),

    /// The zone is larger than the backend is allowed to process.
    #[error("zone of {requested} points exceeds the clustering budget of {limit} points")]
    ResourceExhausted { requested: usize, limit: usize },

    /// Working buffers could not be allocated.
    #[error("failed to allocate clustering buffers: {0}")]
    Allocation(#[from] TryReserveError),
}

impl ExtractError {
    /// Whether the whole frame has to be abandoned.
    ///
    /// Bad input only poisons its own zone; running out of memory or budget
    /// means the frame cannot be processed consistently.
    pub fn is_frame_fatal(&self) -> bool {
        !matches!(self, ExtractError::InvalidInput(_))
    }
}

/// Result type for clustering operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Parameters handed to a backend for one zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractParams {
    /// Minimum neighbours a point needs before it may link; 0 disables.
    pub count_threshold: usize,
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
    /// Link tolerance along x, y, z.
    pub voxel: [f32; 3],
    pub connectivity: Connectivity,
}

impl ExtractParams {
    /// Isotropic parameters with the given tolerance.
    pub fn new(
        tolerance: f32,
        min_cluster_size: usize,
        max_cluster_size: usize,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            count_threshold: 0,
            min_cluster_size,
            max_cluster_size,
            voxel: [tolerance; 3],
            connectivity,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.voxel.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(ExtractError::InvalidInput(format!(
                "tolerance must be positive and finite, got {:?}",
                self.voxel
            )));
        }
        Ok(())
    }

    /// Whether `a` and `b` are directly linked.
    #[inline]
    pub fn links(&self, a: &[f32; 3], b: &[f32; 3]) -> bool {
        let dx = a[0] - b[0];
        let dy = a[1] - b[1];
        let dz = a[2] - b[2];
        match self.connectivity {
            Connectivity::Voxel => {
                dx.abs() <= self.voxel[0] && dy.abs() <= self.voxel[1] && dz.abs() <= self.voxel[2]
            }
            Connectivity::Euclidean => {
                // Anisotropic tolerances collapse to the smallest axis.
                let tol = self.voxel[0].min(self.voxel[1]).min(self.voxel[2]);
                dx * dx + dy * dy + dz * dz <= tol * tol
            }
        }
    }

    /// Edge lengths of the hash grid cells. Any two linked points lie in
    /// the same or in adjacent cells.
    fn cell_size(&self) -> [f64; 3] {
        let tol = match self.connectivity {
            Connectivity::Voxel => self.voxel,
            Connectivity::Euclidean => [self.voxel[0].min(self.voxel[1]).min(self.voxel[2]); 3],
        };
        // Pad so that boundary links are never lost to rounding.
        tol.map(|t| t as f64 * (1.0 + 1e-4))
    }
}

/// Clusters of one zone packed into a single buffer.
///
/// Cluster `k` occupies `points[offsets[k]..offsets[k] + sizes[k]]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterBuffer {
    points: Vec<[f32; 3]>,
    sizes: Vec<usize>,
}

impl ClusterBuffer {
    /// Number of clusters.
    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Member count of each cluster.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Iterate over clusters as slices of the packed buffer.
    pub fn iter(&self) -> impl Iterator<Item = &[[f32; 3]]> + '_ {
        let mut offset = 0;
        self.sizes.iter().map(move |&size| {
            let cluster = &self.points[offset..offset + size];
            offset += size;
            cluster
        })
    }
}

/// A clustering backend.
///
/// Implementations must be deterministic for identical input order and
/// parameters, and must have finished all work before returning.
pub trait ClusterExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, points: &[[f32; 3]], params: &ExtractParams) -> Result<ClusterBuffer>;
}

/// Build the backend selected in the configuration.
pub fn build_extractor(config: &ClusteringConfig) -> Box<dyn ClusterExtractor> {
    match config.backend {
        ClusterBackend::VoxelGrid => Box::new(VoxelGridExtractor::new(config.max_zone_points)),
        ClusterBackend::BruteForce => Box::new(BruteForceExtractor::new(config.max_zone_points)),
    }
}

/// Atomic Union-Find data structure for lock-free parallel cluster merging.
///
/// Uses path compression with atomic compare-and-swap operations to safely
/// merge sets from multiple threads without locks.
pub struct AtomicUnionFind {
    parent: Vec<AtomicUsize>,
}

impl AtomicUnionFind {
    /// Create a new union-find structure where each element is its own parent.
    pub fn new(size: usize) -> Result<Self> {
        let mut parent = Vec::new();
        parent.try_reserve_exact(size)?;
        parent.extend((0..size).map(AtomicUsize::new));
        Ok(Self { parent })
    }

    /// Find the root of the set containing `x` with path compression.
    ///
    /// Relaxed ordering is enough: roots only ever move upward, so every
    /// reader converges on the same root once all unions are done.
    #[inline]
    pub fn find(&self, mut x: usize) -> usize {
        loop {
            let p = self.parent[x].load(Ordering::Relaxed);
            if p == x {
                return x;
            }
            let gp = self.parent[p].load(Ordering::Relaxed);
            if gp != p {
                let _ = self.parent[x].compare_exchange_weak(
                    p,
                    gp,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            x = p;
        }
    }

    /// Union the sets containing `x` and `y`.
    ///
    /// Returns true if a merge actually occurred.
    #[inline]
    pub fn union(&self, x: usize, y: usize) -> bool {
        loop {
            let root_x = self.find(x);
            let root_y = self.find(y);

            if root_x == root_y {
                return false;
            }

            // Smaller root points to the larger one
            let (small, large) = if root_x < root_y {
                (root_x, root_y)
            } else {
                (root_y, root_x)
            };

            match self.parent[small].compare_exchange_weak(
                small,
                large,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }
}

fn check_input(points: &[[f32; 3]], params: &ExtractParams, limit: usize) -> Result<()> {
    params.validate()?;
    if points.len() > limit {
        return Err(ExtractError::ResourceExhausted {
            requested: points.len(),
            limit,
        });
    }
    if let Some(i) = points.iter().position(|p| p.iter().any(|c| !c.is_finite())) {
        return Err(ExtractError::InvalidInput(format!(
            "point {} has a non-finite coordinate: {:?}",
            i, points[i]
        )));
    }
    Ok(())
}

/// Turn a finished union-find into the packed, size-filtered output.
fn collect_clusters(
    points: &[[f32; 3]],
    uf: &AtomicUnionFind,
    params: &ExtractParams,
) -> Result<ClusterBuffer> {
    let n = points.len();

    // Number components in order of their first (lowest-index) member.
    let mut component_of_root = Vec::new();
    component_of_root.try_reserve_exact(n)?;
    component_of_root.resize(n, usize::MAX);

    let mut component = Vec::new();
    component.try_reserve_exact(n)?;

    let mut sizes: Vec<usize> = Vec::new();
    for i in 0..n {
        let root = uf.find(i);
        if component_of_root[root] == usize::MAX {
            component_of_root[root] = sizes.len();
            sizes.push(0);
        }
        let c = component_of_root[root];
        sizes[c] += 1;
        component.push(c);
    }

    // Offsets of the kept components in the packed buffer.
    let mut offsets = vec![usize::MAX; sizes.len()];
    let mut kept_sizes = Vec::new();
    let mut total = 0usize;
    for (c, &size) in sizes.iter().enumerate() {
        if size >= params.min_cluster_size && size <= params.max_cluster_size {
            offsets[c] = total;
            kept_sizes.push(size);
            total += size;
        }
    }

    let mut packed = Vec::new();
    packed.try_reserve_exact(total)?;
    packed.resize(total, [0.0f32; 3]);

    let mut cursor = offsets.clone();
    for (i, &c) in component.iter().enumerate() {
        if cursor[c] != usize::MAX {
            packed[cursor[c]] = points[i];
            cursor[c] += 1;
        }
    }

    Ok(ClusterBuffer {
        points: packed,
        sizes: kept_sizes,
    })
}

type CellKey = [i64; 3];

/// Point indices bucketed by grid cell, in ascending input order per cell.
struct VoxelGrid {
    cell: [f64; 3],
    cells: HashMap<CellKey, Vec<usize>>,
}

impl VoxelGrid {
    fn build(points: &[[f32; 3]], cell: [f64; 3]) -> Result<Self> {
        let mut cells: HashMap<CellKey, Vec<usize>> = HashMap::new();
        cells.try_reserve(points.len())?;
        for (i, p) in points.iter().enumerate() {
            cells.entry(Self::key(p, &cell)).or_default().push(i);
        }
        Ok(Self { cell, cells })
    }

    /// Cell holding `p`. Float to int casts saturate, so huge coordinates
    /// collapse into the outermost cells instead of wrapping.
    #[inline]
    fn key(p: &[f32; 3], cell: &[f64; 3]) -> CellKey {
        [0usize, 1, 2].map(|axis| (p[axis] as f64 / cell[axis]).floor() as i64)
    }

    /// The 3x3x3 block of cells around `p`, without repeats.
    fn neighbourhood(&self, p: &[f32; 3]) -> Vec<CellKey> {
        let [cx, cy, cz] = Self::key(p, &self.cell);
        let mut keys = Vec::with_capacity(27);
        for dx in -1i64..=1 {
            for dy in -1i64..=1 {
                for dz in -1i64..=1 {
                    keys.push([
                        cx.saturating_add(dx),
                        cy.saturating_add(dy),
                        cz.saturating_add(dz),
                    ]);
                }
            }
        }
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Indices of all points linked to point `i`.
    fn linked(&self, points: &[[f32; 3]], i: usize, params: &ExtractParams) -> Vec<usize> {
        let p = &points[i];
        self.neighbourhood(p)
            .iter()
            .filter_map(|key| self.cells.get(key))
            .flatten()
            .copied()
            .filter(|&j| j != i && params.links(p, &points[j]))
            .collect()
    }
}

/// Hash-grid backed extractor.
#[derive(Debug, Clone)]
pub struct VoxelGridExtractor {
    max_points: usize,
}

impl VoxelGridExtractor {
    pub fn new(max_points: usize) -> Self {
        Self { max_points }
    }
}

impl ClusterExtractor for VoxelGridExtractor {
    fn name(&self) -> &'static str {
        "voxel-grid"
    }

    fn extract(&self, points: &[[f32; 3]], params: &ExtractParams) -> Result<ClusterBuffer> {
        check_input(points, params, self.max_points)?;
        if points.is_empty() {
            return Ok(ClusterBuffer::default());
        }

        let grid = VoxelGrid::build(points, params.cell_size())?;

        // Points below the density threshold never seed a link.
        let eligible: Option<Vec<bool>> = if params.count_threshold > 0 {
            Some(
                (0..points.len())
                    .into_par_iter()
                    .map(|i| grid.linked(points, i, params).len() >= params.count_threshold)
                    .collect(),
            )
        } else {
            None
        };
        let is_eligible = |i: usize| eligible.as_ref().map_or(true, |e| e[i]);

        let uf = AtomicUnionFind::new(points.len())?;
        (0..points.len()).into_par_iter().for_each(|i| {
            if !is_eligible(i) {
                return;
            }
            for j in grid.linked(points, i, params) {
                if j > i && is_eligible(j) {
                    uf.union(i, j);
                }
            }
        });

        collect_clusters(points, &uf, params)
    }
}

/// Exhaustive O(n²) extractor.
#[derive(Debug, Clone)]
pub struct BruteForceExtractor {
    max_points: usize,
}

impl BruteForceExtractor {
    pub fn new(max_points: usize) -> Self {
        Self { max_points }
    }
}

impl ClusterExtractor for BruteForceExtractor {
    fn name(&self) -> &'static str {
        "brute-force"
    }

    fn extract(&self, points: &[[f32; 3]], params: &ExtractParams) -> Result<ClusterBuffer> {
        check_input(points, params, self.max_points)?;
        let n = points.len();

        let eligible: Vec<bool> = (0..n)
            .map(|i| {
                params.count_threshold == 0
                    || (0..n)
                        .filter(|&j| j != i && params.links(&points[i], &points[j]))
                        .count()
                        >= params.count_threshold
            })
            .collect();

        let uf = AtomicUnionFind::new(n)?;
        for i in 0..n {
            if !eligible[i] {
                continue;
            }
            for j in (i + 1)..n {
                if eligible[j] && params.links(&points[i], &points[j]) {
                    uf.union(i, j);
                }
            }
        }

        collect_clusters(points, &uf, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tolerance: f32, min: usize, max: usize) -> ExtractParams {
        ExtractParams::new(tolerance, min, max, Connectivity::Voxel)
    }

    /// Two 3x3 grids with 0.1 spacing, 5 m apart, interleaved in input order.
    fn two_blobs() -> Vec<[f32; 3]> {
        let mut points = Vec::new();
        for i in 0..9 {
            let (gx, gy) = ((i % 3) as f32 * 0.1, (i / 3) as f32 * 0.1);
            points.push([5.0 + gx, gy, 0.0]);
            points.push([gx, 5.0 + gy, 0.0]);
        }
        points
    }

    #[test]
    fn test_atomic_union_find_basic() {
        let uf = AtomicUnionFind::new(5).unwrap();

        assert_eq!(uf.find(0), 0);
        assert_eq!(uf.find(4), 4);

        assert!(uf.union(0, 1));
        assert_eq!(uf.find(0), uf.find(1));

        assert!(uf.union(2, 3));
        assert_ne!(uf.find(0), uf.find(2));

        assert!(uf.union(1, 2));
        assert_eq!(uf.find(0), uf.find(3));
        assert!(!uf.union(0, 3));
    }

    #[test]
    fn test_links_voxel_vs_euclidean() {
        let voxel = params(0.1, 1, 100);
        let euclid = ExtractParams::new(0.1, 1, 100, Connectivity::Euclidean);
        let a = [0.0f32, 0.0, 0.0];
        let diagonal = [0.09f32, 0.09, 0.0];

        assert!(voxel.links(&a, &diagonal));
        assert!(!euclid.links(&a, &diagonal));
        assert!(!voxel.links(&a, &[0.2, 0.0, 0.0]));
    }

    #[test]
    fn test_grid_two_clusters_in_order() {
        let points = two_blobs();
        let out = VoxelGridExtractor::new(1000)
            .extract(&points, &params(0.15, 3, 100))
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out.sizes(), &[9, 9]);

        // The first cluster is the one containing input point 0.
        let clusters: Vec<&[[f32; 3]]> = out.iter().collect();
        assert_eq!(clusters[0][0], points[0]);
        assert!(clusters[0].iter().all(|p| p[0] >= 5.0));
        assert!(clusters[1].iter().all(|p| p[1] >= 5.0));
    }

    #[test]
    fn test_size_bounds_are_inclusive() {
        let points = two_blobs();
        let exact = VoxelGridExtractor::new(1000)
            .extract(&points, &params(0.15, 9, 9))
            .unwrap();
        assert_eq!(exact.len(), 2);

        let too_small = VoxelGridExtractor::new(1000)
            .extract(&points, &params(0.15, 10, 100))
            .unwrap();
        assert!(too_small.is_empty());

        let too_large = VoxelGridExtractor::new(1000)
            .extract(&points, &params(0.15, 1, 8))
            .unwrap();
        assert!(too_large.is_empty());
    }

    #[test]
    fn test_chain_connectivity() {
        // Consecutive points are 0.1 apart; the ends are 1.9 apart.
        let points: Vec<[f32; 3]> = (0..20).map(|i| [i as f32 * 0.1, 0.0, 0.0]).collect();
        let out = VoxelGridExtractor::new(1000)
            .extract(&points, &params(0.11, 1, 100))
            .unwrap();
        assert_eq!(out.sizes(), &[20]);

        let split = VoxelGridExtractor::new(1000)
            .extract(&points, &params(0.05, 1, 100))
            .unwrap();
        assert_eq!(split.len(), 20);
    }

    #[test]
    fn test_backends_agree() {
        let mut points = Vec::new();
        for i in 0..300 {
            let t = i as f32;
            points.push([
                (t * 0.618).sin() * 3.0,
                (t * 1.414).cos() * 3.0,
                ((t * 0.1).sin() * 0.5),
            ]);
        }
        let p = params(0.4, 2, 1000);

        let a = VoxelGridExtractor::new(10_000).extract(&points, &p).unwrap();
        let b = BruteForceExtractor::new(10_000).extract(&points, &p).unwrap();
        assert_eq!(a, b);

        // Repeated runs on the thread pool give identical output.
        for _ in 0..5 {
            assert_eq!(VoxelGridExtractor::new(10_000).extract(&points, &p).unwrap(), a);
        }
    }

    #[test]
    fn test_count_threshold_isolates_sparse_points() {
        // A dense 3x3 grid plus a point that touches only one grid corner.
        let mut points: Vec<[f32; 3]> = (0..9)
            .map(|i| [(i % 3) as f32 * 0.1, (i / 3) as f32 * 0.1, 0.0])
            .collect();
        points.push([0.3, 0.3, 0.0]);

        let mut p = params(0.11, 1, 100);
        let linked = VoxelGridExtractor::new(100).extract(&points, &p).unwrap();
        assert_eq!(linked.sizes(), &[10]);

        p.count_threshold = 2;
        let grid = VoxelGridExtractor::new(100).extract(&points, &p).unwrap();
        let bf = BruteForceExtractor::new(100).extract(&points, &p).unwrap();
        assert_eq!(grid.sizes(), &[9, 1]);
        assert_eq!(grid, bf);
    }

    #[test]
    fn test_empty_input() {
        let out = VoxelGridExtractor::new(10).extract(&[], &params(0.1, 1, 10)).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.iter().count(), 0);
    }

    #[test]
    fn test_invalid_input_is_zone_local() {
        let points = vec![[0.0f32, 0.0, 0.0], [f32::NAN, 0.0, 0.0]];
        let err = VoxelGridExtractor::new(10)
            .extract(&points, &params(0.1, 1, 10))
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidInput(_)));
        assert!(!err.is_frame_fatal());

        let err = VoxelGridExtractor::new(10)
            .extract(&points[..1], &params(0.0, 1, 10))
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidInput(_)));
    }

    #[test]
    fn test_budget_exceeded_is_frame_fatal() {
        let points = vec![[0.0f32, 0.0, 0.0]; 11];
        let err = BruteForceExtractor::new(10)
            .extract(&points, &params(0.1, 1, 100))
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::ResourceExhausted { requested: 11, limit: 10 }
        ));
        assert!(err.is_frame_fatal());
    }

    #[test]
    fn test_coincident_points() {
        // Two stacks of identical points, far enough apart to stay separate.
        let mut points = vec![[1.0f32, 2.0, 0.5]; 300];
        points.extend(vec![[3.0f32, 2.0, 0.5]; 300]);
        let p = params(0.2, 5, 1000);

        let out = VoxelGridExtractor::new(10_000).extract(&points, &p).unwrap();
        assert_eq!(out.sizes(), &[300, 300]);
        assert!(out.iter().next().unwrap().iter().all(|q| q[0] == 1.0));
    }

    #[test]
    fn test_vertical_column() {
        // Only z varies, like a pole seen by the scanner.
        let points: Vec<[f32; 3]> = (0..100)
            .map(|i| [6.0, 1.0, -0.79 + 0.02 * i as f32])
            .collect();
        let p = params(0.1, 5, 1000);

        let grid = VoxelGridExtractor::new(1000).extract(&points, &p).unwrap();
        let bf = BruteForceExtractor::new(1000).extract(&points, &p).unwrap();
        assert_eq!(grid.sizes(), &[100]);
        assert_eq!(grid, bf);
    }

    #[test]
    fn test_zero_returns_with_object() {
        let mut points = vec![[0.0f32; 3]; 256];
        for i in 0..50 {
            points.push([1.0 + (i % 5) as f32 * 0.05, 0.5, (i / 5) as f32 * 0.05]);
        }
        let p = params(0.1, 5, 1000);

        let grid = VoxelGridExtractor::new(1000).extract(&points, &p).unwrap();
        let bf = BruteForceExtractor::new(1000).extract(&points, &p).unwrap();
        assert_eq!(grid.sizes(), &[256, 50]);
        assert_eq!(grid, bf);
    }

    #[test]
    fn test_backends_agree_on_both_connectivities() {
        let points: Vec<[f32; 3]> = (0..400)
            .map(|i| {
                let t = i as f32;
                [
                    ((t * 0.37).sin() * 2.0 * 20.0).round() / 20.0,
                    ((t * 0.91).cos() * 2.0 * 20.0).round() / 20.0,
                    ((t * 0.13).sin() * 20.0).round() / 20.0,
                ]
            })
            .collect();

        for connectivity in [Connectivity::Voxel, Connectivity::Euclidean] {
            for tolerance in [0.05f32, 0.1, 0.25, 0.6] {
                let p = ExtractParams::new(tolerance, 1, 1000, connectivity);
                let grid = VoxelGridExtractor::new(1000).extract(&points, &p).unwrap();
                let bf = BruteForceExtractor::new(1000).extract(&points, &p).unwrap();
                assert_eq!(grid, bf, "{:?} at {}", connectivity, tolerance);
            }
        }
    }

    #[test]
    fn test_far_coordinates_do_not_overflow() {
        let points = vec![[f32::MAX, -f32::MAX, 0.0], [f32::MAX, -f32::MAX, 0.0], [0.0, 0.0, 0.0]];
        let out = VoxelGridExtractor::new(10)
            .extract(&points, &params(1e-6, 1, 10))
            .unwrap();
        assert_eq!(out.sizes(), &[2, 1]);
    }
}
