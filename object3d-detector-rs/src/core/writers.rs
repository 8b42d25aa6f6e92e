//! Detection and point cloud writers.
//!
//! - CSV: one row per detection, appended frame by frame ([`CsvDetectionWriter`])
//! - PLY: ASCII point clouds with RGB colors, and detection boxes as
//!   vertex/edge wireframes for viewers such as MeshLab or CloudCompare

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::pipeline::{DetectionSink, FrameDetections};

/// Default color for points when no colors are specified (light gray).
const DEFAULT_COLOR: [u8; 3] = [180, 180, 180];

/// Column names of the detection CSV.
pub const DETECTION_HEADER: [&str; 13] = [
    "seq",
    "stamp",
    "frame_id",
    "index",
    "centroid_x",
    "centroid_y",
    "centroid_z",
    "min_x",
    "min_y",
    "min_z",
    "max_x",
    "max_y",
    "max_z",
];

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// Mismatched array lengths.
    #[error("array length mismatch: {points_len} points but {colors_len} colors")]
    LengthMismatch { points_len: usize, colors_len: usize },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// Convert a 0..1 RGB triple to bytes.
pub fn to_rgb8(color: [f32; 3]) -> [u8; 3] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Write points to an ASCII PLY file with RGB colors.
///
/// Points without a color get light gray. Parent directories are created
/// if needed.
pub fn write_ply(path: &Path, points: &[[f32; 3]], colors: Option<&[[u8; 3]]>) -> Result<()> {
    if let Some(colors) = colors {
        if colors.len() != points.len() {
            return Err(WriteError::LengthMismatch {
                points_len: points.len(),
                colors_len: colors.len(),
            });
        }
    }

    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();
    let io_err = |e| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    };

    write!(
        writer,
        "ply\nformat ascii 1.0\nelement vertex {}\n\
         property float x\nproperty float y\nproperty float z\n\
         property uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n",
        points.len()
    )
    .map_err(io_err)?;

    for (i, p) in points.iter().enumerate() {
        let [r, g, b] = colors.map(|c| c[i]).unwrap_or(DEFAULT_COLOR);
        writeln!(writer, "{:.6} {:.6} {:.6} {} {} {}", p[0], p[1], p[2], r, g, b)
            .map_err(io_err)?;
    }

    writer.flush().map_err(io_err)
}

/// Write the boxes of one frame as a PLY line set: 24 vertices and 12
/// edges per detection, colored with the frame's marker color.
pub fn write_wireframe_ply(path: &Path, frame: &FrameDetections) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();
    let io_err = |e| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    };

    let vertices = frame.len() * 24;
    let edges = frame.len() * 12;
    write!(
        writer,
        "ply\nformat ascii 1.0\nelement vertex {}\n\
         property float x\nproperty float y\nproperty float z\n\
         element edge {}\nproperty int vertex1\nproperty int vertex2\n\
         property uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n",
        vertices, edges
    )
    .map_err(io_err)?;

    for detection in &frame.detections {
        for p in detection.wireframe() {
            writeln!(writer, "{:.6} {:.6} {:.6}", p[0], p[1], p[2]).map_err(io_err)?;
        }
    }

    let [r, g, b] = to_rgb8(frame.color());
    for e in 0..edges {
        writeln!(writer, "{} {} {} {} {}", 2 * e, 2 * e + 1, r, g, b).map_err(io_err)?;
    }

    writer.flush().map_err(io_err)
}

/// Detection sink that appends rows to a CSV file.
pub struct CsvDetectionWriter {
    path: String,
    writer: csv::Writer<BufWriter<File>>,
    rows: usize,
}

impl CsvDetectionWriter {
    /// Create the file and write the header row.
    pub fn create(path: &Path) -> Result<Self> {
        ensure_parent_dirs(path)?;
        let buf_writer = create_buffered_writer(path)?;
        let mut writer = csv::Writer::from_writer(buf_writer);
        let path = path.display().to_string();

        let mut header: Vec<&str> = DETECTION_HEADER.to_vec();
        header.push("confidence");
        writer
            .write_record(&header)
            .map_err(|e| WriteError::CsvError {
                path: path.clone(),
                source: e,
            })?;

        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Detection rows written so far.
    pub fn rows_written(&self) -> usize {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| WriteError::WriteFile {
            path: self.path.clone(),
            source: e,
        })
    }
}

impl DetectionSink for CsvDetectionWriter {
    fn publish(&mut self, frame: &FrameDetections) -> Result<()> {
        for (index, d) in frame.detections.iter().enumerate() {
            let record = [
                frame.seq.to_string(),
                format!("{:.6}", frame.stamp),
                frame.frame_id.clone(),
                index.to_string(),
                format!("{:.6}", d.centroid.x),
                format!("{:.6}", d.centroid.y),
                format!("{:.6}", d.centroid.z),
                format!("{:.6}", d.bbox.min[0]),
                format!("{:.6}", d.bbox.min[1]),
                format!("{:.6}", d.bbox.min[2]),
                format!("{:.6}", d.bbox.max[0]),
                format!("{:.6}", d.bbox.max[1]),
                format!("{:.6}", d.bbox.max[2]),
                d.confidence.map(|c| format!("{:.6}", c)).unwrap_or_default(),
            ];
            self.writer
                .write_record(&record)
                .map_err(|e| WriteError::CsvError {
                    path: self.path.clone(),
                    source: e,
                })?;
            self.rows += 1;
        }
        self.flush()
    }
}
