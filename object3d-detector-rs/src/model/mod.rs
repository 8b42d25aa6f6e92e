//! Trained classifier artifacts.
//!
//! A [`LoadedModel`] bundles the classifier with the feature scaling table it
//! was trained against. Both are read once at startup and shared read-only
//! through an `Arc`; when either cannot be loaded the detector runs
//! model-free.

pub mod range;
pub mod svm;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::DetectorConfig;

pub use range::ScalingTable;
pub use svm::SvmModel;

/// Errors raised while loading model artifacts.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid range table: {0}")]
    InvalidRange(String),

    #[error("invalid model at line {line}: {message}")]
    InvalidModel { line: usize, message: String },

    #[error("unsupported model: {0}")]
    Unsupported(String),

    #[error("positive label {label} is not one of the model labels {labels:?}")]
    MissingPositiveLabel { label: i32, labels: Vec<i32> },

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Result type for model loading.
pub type Result<T> = std::result::Result<T, ModelError>;

/// A trained classifier operating on scaled feature vectors.
pub trait ClassifierModel: Send + Sync {
    /// Class labels in the model's internal order.
    fn labels(&self) -> &[i32];

    fn supports_probability(&self) -> bool;

    /// Predicted class label.
    fn predict(&self, features: &[f64]) -> i32;

    /// Per-class probabilities in [`labels`](Self::labels) order, or `None`
    /// when the model was not trained with probability estimates.
    fn predict_probability(&self, features: &[f64]) -> Option<Vec<f64>>;

    /// One-line summary for logs and `inspect-model`.
    fn describe(&self) -> String;
}

/// Classifier plus scaling table, immutable after loading.
pub struct LoadedModel {
    model: Box<dyn ClassifierModel>,
    scaling: ScalingTable,
    positive_label: i32,
    positive_index: usize,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model", &self.model.describe())
            .field("dimension", &self.scaling.dimension())
            .field("positive_label", &self.positive_label)
            .finish()
    }
}

impl LoadedModel {
    /// Pair a model with its scaling table.
    ///
    /// Fails when `positive_label` is not a class of the model.
    pub fn new(
        model: Box<dyn ClassifierModel>,
        scaling: ScalingTable,
        positive_label: i32,
    ) -> Result<Self> {
        let positive_index = model
            .labels()
            .iter()
            .position(|&l| l == positive_label)
            .ok_or_else(|| ModelError::MissingPositiveLabel {
                label: positive_label,
                labels: model.labels().to_vec(),
            })?;
        Ok(Self {
            model,
            scaling,
            positive_label,
            positive_index,
        })
    }

    /// Load a libsvm model and its range table from disk.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        model_path: P,
        range_path: Q,
        dimension: usize,
        positive_label: i32,
    ) -> Result<Self> {
        let model = SvmModel::load(model_path)?;
        let scaling = ScalingTable::load(range_path, dimension)?;
        Self::new(Box::new(model), scaling, positive_label)
    }

    pub fn model(&self) -> &dyn ClassifierModel {
        self.model.as_ref()
    }

    pub fn scaling(&self) -> &ScalingTable {
        &self.scaling
    }

    pub fn positive_label(&self) -> i32 {
        self.positive_label
    }

    /// Probability of the positive class for a scaled vector, if the model
    /// provides probabilities.
    pub fn positive_probability(&self, scaled: &[f64]) -> Option<f64> {
        self.model
            .predict_probability(scaled)
            .and_then(|p| p.get(self.positive_index).copied())
    }
}

/// Load the model and range table named in `config`.
///
/// Errors are logged as warnings and turn into `None`, which the detector
/// treats as model-free operation.
pub fn load_model(config: &DetectorConfig) -> Option<Arc<LoadedModel>> {
    match try_load_model(config) {
        Ok(model) => {
            log::info!(
                "loaded {} ({} of {} features scaled)",
                model.model().describe(),
                model.scaling().scaled_count(),
                model.scaling().dimension()
            );
            Some(Arc::new(model))
        }
        Err(ModelError::NotConfigured(what)) => {
            log::info!("no {} configured, running without a classifier", what);
            None
        }
        Err(e) => {
            log::warn!("cannot load classifier, running without one: {}", e);
            None
        }
    }
}

fn try_load_model(config: &DetectorConfig) -> Result<LoadedModel> {
    let model_path = config
        .model_file_name
        .as_ref()
        .ok_or(ModelError::NotConfigured("model_file_name"))?;
    let range_path = config
        .range_file_name
        .as_ref()
        .ok_or(ModelError::NotConfigured("range_file_name"))?;
    LoadedModel::load(
        model_path,
        range_path,
        config.features.set.len(),
        config.classifier.positive_label,
    )
}
