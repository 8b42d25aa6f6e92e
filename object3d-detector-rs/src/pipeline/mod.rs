//! Per-frame detection pipeline.
//!
//! A [`Detector`] owns everything needed to turn one [`Frame`] into
//! detections: height filter and zone layout, the zone clusterer, the
//! feature extractor and the classifier. Frames are processed one at a time;
//! inside a frame zones and clusters are spread over the rayon pool.

pub mod diagnostics;
pub mod queue;

use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::Vector3;
use rayon::prelude::*;
use thiserror::Error;

use crate::config::DetectorConfig;
use crate::core::loaders::Frame;
use crate::core::transforms::BoundingBox;
use crate::core::writers::WriteError;
use crate::model::{load_model, LoadedModel};
use crate::processors::classifier::{Classifier, Decision};
use crate::processors::clustering::ExtractError;
use crate::processors::features::{Feature, FeatureExtractor};
use crate::processors::filtering::{preprocess, ZoneLayout};
use crate::processors::segmentation::{SegmentationStats, ZoneClusterer};

pub use diagnostics::FrameRateCounter;
pub use queue::{FrameQueue, QueueError};

/// Marker colour (RGB, 0..1) for detections made without a classifier.
pub const MODEL_FREE_COLOR: [f32; 3] = [0.0, 0.5, 1.0];
/// Marker colour for classified detections.
pub const CLASSIFIED_COLOR: [f32; 3] = [0.0, 1.0, 0.5];

/// Errors that abort a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame {seq} skipped: {source}")]
    Clustering {
        seq: u64,
        #[source]
        source: ExtractError,
    },

    #[error("failed to publish frame {seq}: {source}")]
    Publish {
        seq: u64,
        #[source]
        source: WriteError,
    },
}

/// An accepted cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub centroid: Vector3<f64>,
    pub bbox: BoundingBox,
    /// Positive-class probability when the model provides one.
    pub confidence: Option<f64>,
}

impl Detection {
    /// Bounding box edges as a 24-point line list.
    pub fn wireframe(&self) -> [[f32; 3]; 24] {
        self.bbox.wireframe()
    }
}

/// Detections of one frame, as handed to a [`DetectionSink`].
#[derive(Debug, Clone)]
pub struct FrameDetections {
    pub seq: u64,
    pub stamp: f64,
    pub frame_id: String,
    /// Whether a classifier took part in the decision.
    pub classified: bool,
    pub detections: Vec<Detection>,
}

impl FrameDetections {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Marker colour for this frame's boxes.
    pub fn color(&self) -> [f32; 3] {
        if self.classified {
            CLASSIFIED_COLOR
        } else {
            MODEL_FREE_COLOR
        }
    }
}

/// Consumer of detections. Only called for frames with at least one.
pub trait DetectionSink {
    fn publish(&mut self, detections: &FrameDetections) -> Result<(), WriteError>;
}

/// Sink that logs each published frame.
#[derive(Debug, Default)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn publish(&mut self, frame: &FrameDetections) -> Result<(), WriteError> {
        log::info!(
            "frame {} [{}]: {} detection(s)",
            frame.seq,
            frame.frame_id,
            frame.len()
        );
        for (i, d) in frame.detections.iter().enumerate() {
            log::debug!(
                "  #{} centroid ({:.2}, {:.2}, {:.2}) confidence {:?}",
                i,
                d.centroid.x,
                d.centroid.y,
                d.centroid.z,
                d.confidence
            );
        }
        Ok(())
    }
}

/// Summary of one processed frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub seq: u64,
    pub input_points: usize,
    pub filtered_points: usize,
    pub out_of_range: usize,
    pub segmentation: SegmentationStats,
    /// Clusters that reached the classifier.
    pub clusters: usize,
    pub detections: FrameDetections,
    pub elapsed: Duration,
    /// Frame rate, when this frame closed a diagnostics window.
    pub fps: Option<f64>,
}

/// The per-frame detector.
pub struct Detector {
    config: DetectorConfig,
    layout: ZoneLayout,
    clusterer: ZoneClusterer,
    features: FeatureExtractor,
    classifier: Classifier,
    fps: Option<FrameRateCounter>,
}

impl Detector {
    /// Build a detector, loading the model named in `config` if any.
    pub fn new(config: DetectorConfig) -> Self {
        let model = load_model(&config);
        Self::with_model(config, model)
    }

    /// Build a detector around an already loaded model.
    pub fn with_model(config: DetectorConfig, model: Option<Arc<LoadedModel>>) -> Self {
        let layout = ZoneLayout::from_config(&config.zones);
        let clusterer = ZoneClusterer::new(&config);
        let features = FeatureExtractor::new(config.features.set);
        let classifier = Classifier::new(model, config.human_probability);
        let fps = config
            .print_fps
            .then(|| FrameRateCounter::new(config.diagnostics.report_every));

        log::info!(
            "detector ready: {} zones, {} clustering, {}",
            layout.len(),
            clusterer.backend_name(),
            if classifier.has_model() {
                "classifier loaded"
            } else {
                "model-free"
            }
        );

        Self {
            config,
            layout,
            clusterer,
            features,
            classifier,
            fps,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_model_free(&self) -> bool {
        !self.classifier.has_model()
    }

    pub fn frame_rate(&self) -> Option<&FrameRateCounter> {
        self.fps.as_ref()
    }

    /// Run the whole pipeline on one frame.
    ///
    /// A frame the clustering backend cannot handle is reported as an error
    /// and leaves the detector ready for the next frame.
    pub fn process(&mut self, frame: &Frame) -> Result<FrameReport, FrameError> {
        let start = Instant::now();
        if let Some(fps) = self.fps.as_mut() {
            fps.begin();
        }

        let result = self.detect(frame, start);

        let fps = self.fps.as_mut().and_then(FrameRateCounter::end);
        result.map(|mut report| {
            report.fps = fps;
            report
        })
    }

    /// Process a frame and publish its detections when there are any.
    pub fn process_and_publish(
        &mut self,
        frame: &Frame,
        sink: &mut dyn DetectionSink,
    ) -> Result<FrameReport, FrameError> {
        let report = self.process(frame)?;
        if !report.detections.is_empty() {
            sink.publish(&report.detections)
                .map_err(|source| FrameError::Publish {
                    seq: frame.seq,
                    source,
                })?;
        }
        Ok(report)
    }

    fn detect(&self, frame: &Frame, start: Instant) -> Result<FrameReport, FrameError> {
        let pre = preprocess(
            &frame.cloud,
            self.config.z_limit_min,
            self.config.z_limit_max,
            &self.layout,
        );

        let (clusters, segmentation) =
            self.clusterer
                .extract(&pre)
                .map_err(|source| FrameError::Clustering {
                    seq: frame.seq,
                    source,
                })?;

        let decisions: Vec<(Feature, Decision)> = clusters
            .par_iter()
            .map(|cluster| {
                if self.classifier.has_model() {
                    let feature = self.features.extract(cluster);
                    let decision = feature
                        .values
                        .as_deref()
                        .map(|values| self.classifier.classify(values))
                        .unwrap_or_else(Decision::passthrough);
                    (feature, decision)
                } else {
                    (Feature::geometry(cluster), Decision::passthrough())
                }
            })
            .collect();

        let detections = decisions
            .into_iter()
            .filter(|(_, decision)| decision.accepted)
            .map(|(feature, decision)| Detection {
                centroid: feature.centroid,
                bbox: feature.bbox,
                confidence: decision.probability,
            })
            .collect::<Vec<_>>();

        log::debug!(
            "frame {}: {} points, {} after height filter, {} clusters, {} detections",
            frame.seq,
            frame.cloud.len(),
            pre.points.len(),
            clusters.len(),
            detections.len()
        );

        Ok(FrameReport {
            seq: frame.seq,
            input_points: frame.cloud.len(),
            filtered_points: pre.points.len(),
            out_of_range: pre.partition.out_of_range.len(),
            segmentation,
            clusters: clusters.len(),
            detections: FrameDetections {
                seq: frame.seq,
                stamp: frame.stamp,
                frame_id: self.config.frame_id.clone(),
                classified: self.classifier.has_model(),
                detections,
            },
            elapsed: start.elapsed(),
            fps: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loaders::PointCloud;
    use crate::model::{ScalingTable, SvmModel};

    /// 50 points on a 5 x 10 grid (0.05 m spacing) in the x/z plane.
    fn group(cx: f32, cy: f32) -> Vec<[f32; 3]> {
        (0..50)
            .map(|i| {
                let col = (i % 5) as f32;
                let row = (i / 5) as f32;
                [cx + col * 0.05, cy, row * 0.05]
            })
            .collect()
    }

    fn frame(points: &[[f32; 3]]) -> Frame {
        Frame {
            seq: 7,
            stamp: 123.5,
            frame_id: "lidar".to_string(),
            cloud: PointCloud::from_coords(points),
        }
    }

    #[derive(Default)]
    struct Collect(Vec<FrameDetections>);

    impl DetectionSink for Collect {
        fn publish(&mut self, frame: &FrameDetections) -> Result<(), WriteError> {
            self.0.push(frame.clone());
            Ok(())
        }
    }

    /// Always-positive linear model over a 34-value vector.
    fn accept_all_model() -> Arc<LoadedModel> {
        let text = "svm_type c_svc\nkernel_type linear\nnr_class 2\ntotal_sv 2\nrho -1\nlabel 1 -1\nnr_sv 1 1\nSV\n1 1:0\n-1 1:0\n";
        let model = SvmModel::parse(text).unwrap();
        Arc::new(LoadedModel::new(Box::new(model), ScalingTable::identity(34), 1).unwrap())
    }

    #[test]
    fn test_two_groups_model_free() {
        let a = group(3.0, 0.0);
        let b = group(15.0, 5.0);
        let mut points = a.clone();
        points.extend(&b);

        let mut config = DetectorConfig::default();
        config.z_limit_min = -1.0;
        config.z_limit_max = 1.0;
        let mut detector = Detector::with_model(config, None);
        let report = detector.process(&frame(&points)).unwrap();

        let detections = &report.detections.detections;
        assert_eq!(detections.len(), 2);
        assert!(!report.detections.classified);
        for (d, g) in detections.iter().zip([&a, &b]) {
            let expected = crate::core::transforms::centroid(g);
            assert!((d.centroid - expected).norm() < 1e-5);
            assert_eq!(Some(d.bbox), BoundingBox::from_points(g));
            assert!(d.confidence.is_none());
        }
        assert_eq!(report.detections.frame_id, "rslidar");
        assert_eq!(report.detections.color(), MODEL_FREE_COLOR);
    }

    #[test]
    fn test_zero_returns_at_origin() {
        // Drivers report beams without a return as (0, 0, 0).
        let object = group(3.0, 0.0);
        let mut points = vec![[0.0f32; 3]; 256];
        points.extend(&object);

        let mut detector = Detector::with_model(DetectorConfig::default(), None);
        let report = detector.process(&frame(&points)).unwrap();

        let detections = &report.detections.detections;
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].bbox.min, [0.0; 3]);
        assert_eq!(detections[0].bbox.max, [0.0; 3]);
        assert_eq!(Some(detections[1].bbox), BoundingBox::from_points(&object));
    }

    #[test]
    fn test_vertical_pole_is_one_cluster() {
        let pole: Vec<[f32; 3]> = (0..100)
            .map(|i| [6.0, 1.0, -0.79 + 0.02 * i as f32])
            .collect();

        let mut detector = Detector::with_model(DetectorConfig::default(), None);
        let report = detector.process(&frame(&pole)).unwrap();

        assert_eq!(report.filtered_points, 100);
        assert_eq!(report.detections.detections.len(), 1);
    }

    #[test]
    fn test_single_point_yields_nothing() {
        let mut detector = Detector::with_model(DetectorConfig::default(), None);
        let mut sink = Collect::default();
        let report = detector
            .process_and_publish(&frame(&[[3.0, 0.0, 0.0]]), &mut sink)
            .unwrap();
        assert!(report.detections.is_empty());
        assert!(sink.0.is_empty());
    }

    #[test]
    fn test_tall_cluster_rejected_by_size_limit() {
        // 0.3 x 0.3 footprint, 3.0 m tall.
        let mut points = Vec::new();
        for level in 0..31 {
            for k in 0..9 {
                let dx = (k % 3) as f32 * 0.15;
                let dy = (k / 3) as f32 * 0.15;
                points.push([4.0 + dx, dy, -0.5 + level as f32 * 0.1]);
            }
        }

        let mut config = DetectorConfig::default();
        config.z_limit_min = -1.0;
        config.z_limit_max = 3.0;
        let mut detector = Detector::with_model(config.clone(), None);
        assert_eq!(detector.process(&frame(&points)).unwrap().detections.len(), 1);

        config.human_size_limit = true;
        let mut detector = Detector::with_model(config, None);
        let report = detector.process(&frame(&points)).unwrap();
        assert!(report.detections.is_empty());
        assert_eq!(report.segmentation.size_rejected, 1);
    }

    #[test]
    fn test_publishes_only_nonempty_frames() {
        let mut detector = Detector::with_model(DetectorConfig::default(), None);
        let mut sink = Collect::default();

        detector.process_and_publish(&frame(&[]), &mut sink).unwrap();
        assert!(sink.0.is_empty());

        detector
            .process_and_publish(&frame(&group(3.0, 0.0)), &mut sink)
            .unwrap();
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].seq, 7);
        assert_eq!(sink.0[0].stamp, 123.5);
        assert_eq!(sink.0[0].detections[0].wireframe().len(), 24);
    }

    #[test]
    fn test_classified_detections_carry_features() {
        let mut detector = Detector::with_model(DetectorConfig::default(), Some(accept_all_model()));
        assert!(!detector.is_model_free());

        let report = detector.process(&frame(&group(3.0, 0.0))).unwrap();
        assert_eq!(report.detections.len(), 1);
        assert!(report.detections.classified);
        assert_eq!(report.detections.color(), CLASSIFIED_COLOR);

        let cluster = crate::processors::segmentation::Cluster::from_points(1, &group(3.0, 0.0))
            .unwrap();
        assert_eq!(detector.features.compute(&cluster).len(), 34);
    }

    #[test]
    fn test_resource_exhaustion_skips_frame() {
        let mut config = DetectorConfig::default();
        config.clustering.max_zone_points = 10;
        let mut detector = Detector::with_model(config, None);
        let mut sink = Collect::default();

        let err = detector
            .process_and_publish(&frame(&group(3.0, 0.0)), &mut sink)
            .unwrap_err();
        assert!(matches!(err, FrameError::Clustering { seq: 7, .. }));
        assert!(sink.0.is_empty());

        // The detector keeps working afterwards.
        assert!(detector.process(&frame(&[])).is_ok());
    }

    #[test]
    fn test_parallel_and_sequential_agree() {
        let mut points = Vec::new();
        for k in 0..10 {
            let r = 2.5 + k as f32 * 3.5;
            let a = k as f32 * 0.6;
            points.extend(group(r * a.cos(), r * a.sin()));
        }

        let mut config = DetectorConfig::default();
        config.clustering.parallel_zones = false;
        let sequential = Detector::with_model(config.clone(), None)
            .process(&frame(&points))
            .unwrap();

        config.clustering.parallel_zones = true;
        for _ in 0..3 {
            let parallel = Detector::with_model(config.clone(), None)
                .process(&frame(&points))
                .unwrap();
            assert_eq!(parallel.detections.detections, sequential.detections.detections);
        }
    }

    #[test]
    fn test_frame_rate_reported() {
        let mut config = DetectorConfig::default();
        config.print_fps = true;
        config.diagnostics.report_every = 2;
        let mut detector = Detector::with_model(config, None);

        let reports: Vec<FrameReport> = (0..3)
            .map(|_| detector.process(&frame(&[])).unwrap())
            .collect();
        assert!(reports[0].fps.is_none());
        assert!(reports[1].fps.is_none());
        assert!(reports[2].fps.is_some());
    }
}
