//! Frame loaders for LiDAR point clouds stored on disk.
//!
//! Supported inputs:
//! - ASCII PLY files with `x`, `y`, `z` vertex properties
//! - Cartesian CSV files (x, y, z columns)
//!
//! A directory of frames is ordered by the sequence number embedded in each
//! file name, so `scan_9.ply` comes before `scan_10.ply`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use csv::ReaderBuilder;
use regex::Regex;
use thiserror::Error;

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("Invalid PLY file: {0}")]
    InvalidPly(String),

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported frame file: {0}")]
    UnsupportedFormat(PathBuf),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Container for 3D point cloud data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    /// X coordinates of all points.
    pub x: Vec<f32>,
    /// Y coordinates of all points.
    pub y: Vec<f32>,
    /// Z coordinates of all points.
    pub z: Vec<f32>,
}

impl PointCloud {
    /// Creates a new empty point cloud.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new point cloud from coordinate vectors.
    pub fn from_xyz(x: Vec<f32>, y: Vec<f32>, z: Vec<f32>) -> Self {
        debug_assert!(x.len() == y.len() && y.len() == z.len());
        Self { x, y, z }
    }

    /// Creates a point cloud from `[x, y, z]` triples.
    pub fn from_coords(coords: &[[f32; 3]]) -> Self {
        let mut cloud = Self::with_capacity(coords.len());
        for p in coords {
            cloud.push(p[0], p[1], p[2]);
        }
        cloud
    }

    /// Creates a new point cloud with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
            z: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of points in the cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Returns the point at `index` as `[x, y, z]`.
    #[inline]
    pub fn point(&self, index: usize) -> [f32; 3] {
        [self.x[index], self.y[index], self.z[index]]
    }

    /// Converts point cloud to a vector of [x, y, z] coordinate arrays.
    pub fn to_coords(&self) -> Vec<[f32; 3]> {
        (0..self.len()).map(|i| self.point(i)).collect()
    }

    /// Adds a point to the cloud.
    #[inline]
    pub fn push(&mut self, x: f32, y: f32, z: f32) {
        self.x.push(x);
        self.y.push(y);
        self.z.push(z);
    }
}

/// One LiDAR sweep as delivered to the detector.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number assigned by the source.
    pub seq: u64,
    /// Acquisition time in seconds since the Unix epoch.
    pub stamp: f64,
    /// Coordinate frame the points are expressed in.
    pub frame_id: String,
    pub cloud: PointCloud,
}

impl Frame {
    pub fn new(seq: u64, frame_id: impl Into<String>, cloud: PointCloud) -> Self {
        Self {
            seq,
            stamp: now_seconds(),
            frame_id: frame_id.into(),
            cloud,
        }
    }
}

/// Current wall-clock time in seconds.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Load a Cartesian point cloud from a CSV file with x, y, z columns.
///
/// Columns named `x`, `y`, `z` (case-insensitive) are used when present,
/// otherwise the first three columns. Rows with unparsable coordinates are
/// skipped.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no points.
pub fn load_cartesian_csv<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    let col_map: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_lowercase(), i))
        .collect();

    let x_idx = col_map.get("x").copied().unwrap_or(0);
    let y_idx = col_map.get("y").copied().unwrap_or(1);
    let z_idx = col_map.get("z").copied().unwrap_or(2);

    let mut cloud = PointCloud::with_capacity(32_768);
    let mut skipped = 0usize;

    for result in reader.records() {
        let record = result?;
        let parse = |idx: usize| record.get(idx).and_then(|s| s.parse::<f32>().ok());

        match (parse(x_idx), parse(y_idx), parse(z_idx)) {
            (Some(x), Some(y), Some(z)) => cloud.push(x, y, z),
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        log::debug!("{}: skipped {} malformed rows", path.display(), skipped);
    }

    if cloud.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(cloud)
}

/// Load a point cloud from an ASCII PLY file.
///
/// Only the `x`, `y`, `z` vertex properties are read; any other properties
/// (intensity, ring, colors) are ignored.
///
/// # Errors
///
/// Returns an error if the file is not an ASCII PLY or lacks coordinates.
pub fn load_ply<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let first_line = lines
        .next()
        .ok_or_else(|| LoaderError::InvalidPly("Empty file".to_string()))??;

    if !first_line.trim().starts_with("ply") {
        return Err(LoaderError::InvalidPly(format!(
            "{} is not a PLY file",
            path.display()
        )));
    }

    let mut num_vertices: Option<usize> = None;
    let mut prop_names: Vec<String> = Vec::new();
    let mut in_vertex_element = false;
    let mut header_done = false;

    for line in &mut lines {
        let line = line?;
        let stripped = line.trim();

        if stripped.starts_with("format") {
            if !stripped.contains("ascii") {
                return Err(LoaderError::InvalidPly(format!(
                    "only ASCII PLY is supported, found '{}'",
                    stripped
                )));
            }
        } else if stripped.starts_with("element") {
            in_vertex_element = stripped.starts_with("element vertex");
            if in_vertex_element {
                num_vertices = stripped
                    .split_whitespace()
                    .last()
                    .and_then(|count| count.parse().ok());
            }
        } else if stripped.starts_with("property") && in_vertex_element {
            if let Some(name) = stripped.split_whitespace().last() {
                prop_names.push(name.to_string());
            }
        } else if stripped == "end_header" {
            header_done = true;
            break;
        }
    }

    let num_vertices = num_vertices
        .ok_or_else(|| LoaderError::InvalidPly("No vertex count in header".to_string()))?;

    if !header_done {
        return Err(LoaderError::InvalidPly("Missing end_header".to_string()));
    }

    let find = |name: &str| {
        prop_names
            .iter()
            .position(|p| p == name)
            .ok_or_else(|| LoaderError::MissingColumns(name.to_string()))
    };
    let x_idx = find("x")?;
    let y_idx = find("y")?;
    let z_idx = find("z")?;

    let mut cloud = PointCloud::with_capacity(num_vertices);

    for line in lines {
        if cloud.len() >= num_vertices {
            break;
        }

        let line = line?;
        let values: Vec<&str> = line.split_whitespace().collect();

        if values.len() < prop_names.len() {
            continue;
        }

        let parse = |idx: usize, axis: &str| {
            values[idx].parse::<f32>().map_err(|_| {
                LoaderError::ParseError(format!("Invalid {} value: {}", axis, values[idx]))
            })
        };

        cloud.push(parse(x_idx, "x")?, parse(y_idx, "y")?, parse(z_idx, "z")?);
    }

    if cloud.len() < num_vertices {
        return Err(LoaderError::InvalidPly(format!(
            "Expected {} vertices, found {}",
            num_vertices,
            cloud.len()
        )));
    }

    Ok(cloud)
}

/// Load a frame's points, picking the parser from the file extension.
pub fn load_points<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("ply") => load_ply(path),
        Some("csv") => load_cartesian_csv(path),
        _ => Err(LoaderError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("ply") || e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// Find frame files in a directory, ordered by the last number in the name.
///
/// Files without a number sort after numbered ones, by name.
pub fn find_frames(directory: &Path) -> Result<Vec<PathBuf>> {
    let seq_pattern = Regex::new(r"(\d+)\D*$").expect("static regex");

    let mut frames: Vec<(Option<u64>, PathBuf)> = fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_frame_file(path))
        .map(|path| {
            let seq = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| seq_pattern.captures(stem))
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok());
            (seq, path)
        })
        .collect();

    frames.sort_by(|(sa, pa), (sb, pb)| match (sa, sb) {
        (Some(a), Some(b)) => a.cmp(b).then_with(|| pa.cmp(pb)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => pa.cmp(pb),
    });

    Ok(frames.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_point_cloud_operations() {
        let mut cloud = PointCloud::new();
        assert!(cloud.is_empty());

        cloud.push(1.0, 2.0, 3.0);
        cloud.push(4.0, 5.0, 6.0);

        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.point(1), [4.0, 5.0, 6.0]);

        let coords = cloud.to_coords();
        assert_eq!(coords, vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(PointCloud::from_coords(&coords), cloud);
    }

    #[test]
    fn test_load_cartesian_csv() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x,y,z,intensity").unwrap();
        writeln!(file, "1.0,2.0,3.0,10").unwrap();
        writeln!(file, "nan-ish,oops,3.0,10").unwrap();
        writeln!(file, "4.0, 5.0 ,6.0,12").unwrap();
        file.flush().unwrap();

        let cloud = load_cartesian_csv(file.path())?;
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.point(0), [1.0, 2.0, 3.0]);
        assert_eq!(cloud.point(1), [4.0, 5.0, 6.0]);

        Ok(())
    }

    #[test]
    fn test_load_cartesian_csv_empty() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x,y,z").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            load_cartesian_csv(file.path()),
            Err(LoaderError::EmptyFile(_))
        ));
    }

    #[test]
    fn test_load_ply() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ply").unwrap();
        writeln!(file, "format ascii 1.0").unwrap();
        writeln!(file, "element vertex 2").unwrap();
        writeln!(file, "property float intensity").unwrap();
        writeln!(file, "property float x").unwrap();
        writeln!(file, "property float y").unwrap();
        writeln!(file, "property float z").unwrap();
        writeln!(file, "end_header").unwrap();
        writeln!(file, "7 1.0 2.0 3.0").unwrap();
        writeln!(file, "9 4.0 5.0 6.0").unwrap();
        file.flush().unwrap();

        let cloud = load_ply(file.path())?;
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.point(0), [1.0, 2.0, 3.0]);
        assert_eq!(cloud.y[1], 5.0);

        Ok(())
    }

    #[test]
    fn test_load_ply_rejects_binary() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ply").unwrap();
        writeln!(file, "format binary_little_endian 1.0").unwrap();
        writeln!(file, "element vertex 0").unwrap();
        writeln!(file, "end_header").unwrap();
        file.flush().unwrap();

        assert!(matches!(load_ply(file.path()), Err(LoaderError::InvalidPly(_))));
    }

    #[test]
    fn test_load_ply_truncated() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ply").unwrap();
        writeln!(file, "format ascii 1.0").unwrap();
        writeln!(file, "element vertex 3").unwrap();
        writeln!(file, "property float x").unwrap();
        writeln!(file, "property float y").unwrap();
        writeln!(file, "property float z").unwrap();
        writeln!(file, "end_header").unwrap();
        writeln!(file, "1.0 2.0 3.0").unwrap();
        file.flush().unwrap();

        assert!(load_ply(file.path()).is_err());
    }

    #[test]
    fn test_find_frames_numeric_order() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        for name in ["scan_10.ply", "scan_9.ply", "scan_100.csv", "notes.txt", "extra.csv"] {
            File::create(temp_dir.path().join(name))?;
        }

        let frames = find_frames(temp_dir.path())?;
        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(names, vec!["scan_9.ply", "scan_10.ply", "scan_100.csv", "extra.csv"]);
        Ok(())
    }

    #[test]
    fn test_load_points_unsupported() {
        assert!(matches!(
            load_points("frame.bin"),
            Err(LoaderError::UnsupportedFormat(_))
        ));
    }
}
