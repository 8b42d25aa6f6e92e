//! Core data types, geometry and I/O.

pub mod loaders;
pub mod transforms;
pub mod writers;

pub use loaders::{Frame, LoaderError, PointCloud};
pub use transforms::{BoundingBox, Pca};
pub use writers::{write_ply, write_wireframe_ply, CsvDetectionWriter, WriteError};
