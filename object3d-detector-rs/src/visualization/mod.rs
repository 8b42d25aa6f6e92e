//! Bird's-eye rendering of a frame and its detections.
//!
//! Points are drawn in the x/y plane with detection boxes as outlines and
//! the zone boundaries as range rings around the sensor. No text is drawn,
//! so the renderer works on hosts without system fonts.

use std::path::Path;

use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::pipeline::FrameDetections;

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("Nothing to plot")]
    EmptyPointCloud,
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Color palette for detection boxes and their points.
const DETECTION_COLORS: &[(u8, u8, u8)] = &[
    (228, 26, 28),   // Red
    (55, 126, 184),  // Blue
    (77, 175, 74),   // Green
    (152, 78, 163),  // Purple
    (255, 127, 0),   // Orange
    (166, 86, 40),   // Brown
    (247, 129, 191), // Pink
    (0, 206, 209),   // Turquoise
];

/// Points outside every detection.
const BACKGROUND_COLOR: (u8, u8, u8) = (150, 150, 150);

const RING_COLOR: (u8, u8, u8) = (225, 225, 225);

/// Rendering options.
#[derive(Debug, Clone)]
pub struct PlotOptions {
    pub width: u32,
    pub height: u32,
    /// Maximum number of points to plot (subsamples if exceeded).
    pub max_points: usize,
    /// Point transparency, 0.0 to 1.0.
    pub alpha: f32,
    /// Radii (meters) of range rings; empty for none.
    pub rings: Vec<f64>,
}

impl Default for PlotOptions {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 1600,
            max_points: 500_000,
            alpha: 0.6,
            rings: Vec::new(),
        }
    }
}

/// Index of the first detection whose box holds `p`.
fn owning_detection(p: &[f32; 3], detections: Option<&FrameDetections>) -> Option<usize> {
    detections?
        .detections
        .iter()
        .position(|d| d.bbox.contains(p))
}

fn palette(index: usize) -> RGBColor {
    let c = DETECTION_COLORS[index % DETECTION_COLORS.len()];
    RGBColor(c.0, c.1, c.2)
}

/// Plot points and detection boxes from above and save as PNG.
pub fn plot_frame(
    output_path: &Path,
    points: &[[f32; 3]],
    detections: Option<&FrameDetections>,
    options: &PlotOptions,
) -> Result<()> {
    let has_boxes = detections.map_or(false, |d| !d.is_empty());
    if points.is_empty() && !has_boxes {
        return Err(VisualizationError::EmptyPointCloud);
    }

    let n = points.len();
    let step = if n > options.max_points {
        n / options.max_points.max(1)
    } else {
        1
    };
    let alpha = options.alpha.clamp(0.0, 1.0) as f64;

    let plotted: Vec<(f32, f32, RGBAColor)> = (0..n)
        .step_by(step.max(1))
        .map(|i| {
            let p = &points[i];
            let color = match owning_detection(p, detections) {
                Some(k) => palette(k).mix(1.0),
                None => RGBAColor(
                    BACKGROUND_COLOR.0,
                    BACKGROUND_COLOR.1,
                    BACKGROUND_COLOR.2,
                    alpha,
                ),
            };
            (p[0], p[1], color)
        })
        .collect();

    let boxes: Vec<((f32, f32), (f32, f32))> = detections
        .map(|d| {
            d.detections
                .iter()
                .map(|det| {
                    (
                        (det.bbox.min[0], det.bbox.min[1]),
                        (det.bbox.max[0], det.bbox.max[1]),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let mut extent_points: Vec<(f32, f32)> = plotted.iter().map(|(x, y, _)| (*x, *y)).collect();
    for (lo, hi) in &boxes {
        extent_points.push(*lo);
        extent_points.push(*hi);
    }
    let (x_min, x_max, y_min, y_max) = compute_bounds(&extent_points);
    let x_padding = (x_max - x_min) * 0.05;
    let y_padding = (y_max - y_min) * 0.05;

    let root = BitMapBackend::new(output_path, (options.width, options.height))
        .into_drawing_area();

    root.fill(&WHITE).map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(
            (x_min - x_padding)..(x_max + x_padding),
            (y_min - y_padding)..(y_max + y_padding),
        )
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    let ring_color = RGBColor(RING_COLOR.0, RING_COLOR.1, RING_COLOR.2);
    for &radius in &options.rings {
        let ring: Vec<(f32, f32)> = (0..=180)
            .map(|k| {
                let a = k as f64 / 180.0 * std::f64::consts::TAU;
                ((radius * a.cos()) as f32, (radius * a.sin()) as f32)
            })
            .collect();
        chart
            .draw_series(std::iter::once(PathElement::new(ring, ring_color)))
            .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;
    }

    chart
        .draw_series(
            plotted
                .iter()
                .map(|(x, y, color)| Circle::new((*x, *y), 2, color.filled())),
        )
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    chart
        .draw_series(
            boxes
                .iter()
                .enumerate()
                .map(|(k, (lo, hi))| Rectangle::new([*lo, *hi], palette(k).stroke_width(2))),
        )
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    // Sensor origin
    chart
        .draw_series(std::iter::once(Cross::new((0.0f32, 0.0f32), 6, BLACK.stroke_width(2))))
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    root.present().map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    Ok(())
}

/// Compute the bounds (min/max) for x and y coordinates.
fn compute_bounds(points: &[(f32, f32)]) -> (f32, f32, f32, f32) {
    let mut x_min = f32::MAX;
    let mut x_max = f32::MIN;
    let mut y_min = f32::MAX;
    let mut y_max = f32::MIN;

    for (x, y) in points {
        x_min = x_min.min(*x);
        x_max = x_max.max(*x);
        y_min = y_min.min(*y);
        y_max = y_max.max(*y);
    }

    if (x_max - x_min).abs() < f32::EPSILON {
        x_min -= 1.0;
        x_max += 1.0;
    }
    if (y_max - y_min).abs() < f32::EPSILON {
        y_min -= 1.0;
        y_max += 1.0;
    }

    (x_min, x_max, y_min, y_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transforms::BoundingBox;
    use crate::pipeline::Detection;
    use nalgebra::Vector3;
    use tempfile::tempdir;

    fn detections() -> FrameDetections {
        FrameDetections {
            seq: 0,
            stamp: 0.0,
            frame_id: "rslidar".to_string(),
            classified: false,
            detections: vec![Detection {
                centroid: Vector3::new(3.0, 0.0, 0.0),
                bbox: BoundingBox {
                    min: [2.8, -0.2, -0.5],
                    max: [3.2, 0.2, 1.0],
                },
                confidence: None,
            }],
        }
    }

    #[test]
    fn test_compute_bounds_pads_degenerate_axes() {
        let (x0, x1, y0, y1) = compute_bounds(&[(1.0, 2.0), (1.0, 5.0)]);
        assert_eq!((x0, x1), (0.0, 2.0));
        assert_eq!((y0, y1), (2.0, 5.0));
    }

    #[test]
    fn test_owning_detection() {
        let frame = detections();
        assert_eq!(owning_detection(&[3.0, 0.0, 0.0], Some(&frame)), Some(0));
        assert_eq!(owning_detection(&[5.0, 0.0, 0.0], Some(&frame)), None);
        assert_eq!(owning_detection(&[3.0, 0.0, 0.0], None), None);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let dir = tempdir().unwrap();
        let result = plot_frame(&dir.path().join("x.png"), &[], None, &PlotOptions::default());
        assert!(matches!(result, Err(VisualizationError::EmptyPointCloud)));
    }

    #[test]
    fn test_plot_frame_writes_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let points = vec![[3.0f32, 0.0, 0.0], [3.1, 0.1, 0.5], [8.0, -4.0, 0.2]];
        let options = PlotOptions {
            width: 200,
            height: 200,
            rings: vec![2.0, 5.0],
            ..PlotOptions::default()
        };

        plot_frame(&path, &points, Some(&detections()), &options).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
