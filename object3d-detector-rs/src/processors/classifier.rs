//! Scaling and classification of feature vectors.

use std::sync::Arc;

use crate::model::LoadedModel;

/// Outcome of classifying one cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub accepted: bool,
    /// Predicted label, for models without probability estimates.
    pub label: Option<i32>,
    /// Probability of the positive class, for probabilistic models.
    pub probability: Option<f64>,
}

impl Decision {
    /// Decision taken without a model: everything passes.
    pub fn passthrough() -> Self {
        Self {
            accepted: true,
            label: None,
            probability: None,
        }
    }
}

/// Accepts or rejects clusters using an optional trained model.
#[derive(Debug, Clone)]
pub struct Classifier {
    model: Option<Arc<LoadedModel>>,
    threshold: f64,
}

impl Classifier {
    /// `threshold` is the minimum positive-class probability to accept.
    pub fn new(model: Option<Arc<LoadedModel>>, threshold: f64) -> Self {
        Self { model, threshold }
    }

    /// Whether a model is loaded; without one no features are needed.
    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Classify a raw (unscaled) feature vector.
    pub fn classify(&self, values: &[f64]) -> Decision {
        let Some(model) = &self.model else {
            return Decision::passthrough();
        };

        let mut scaled = values.to_vec();
        model.scaling().apply(&mut scaled);

        if let Some(probability) = model.positive_probability(&scaled) {
            Decision {
                accepted: probability >= self.threshold,
                label: None,
                probability: Some(probability),
            }
        } else {
            let label = model.model().predict(&scaled);
            Decision {
                accepted: label == model.positive_label(),
                label: Some(label),
                probability: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScalingTable, SvmModel};

    /// Linear model deciding on the sign of feature 1 (after scaling).
    fn model_text(probabilistic: bool) -> String {
        let prob = if probabilistic { "probA -4\nprobB 0\n" } else { "" };
        format!(
            "svm_type c_svc\nkernel_type linear\nnr_class 2\ntotal_sv 2\nrho 0\nlabel 1 -1\n{}nr_sv 1 1\nSV\n1 1:1\n-1 2:0\n",
            prob
        )
    }

    fn loaded(probabilistic: bool, positive_label: i32) -> Arc<LoadedModel> {
        let model = SvmModel::parse(&model_text(probabilistic)).unwrap();
        let mut scaling = ScalingTable::identity(2);
        scaling.set_range(0, 0.0, 10.0);
        Arc::new(LoadedModel::new(Box::new(model), scaling, positive_label).unwrap())
    }

    #[test]
    fn test_model_free_accepts_everything() {
        let classifier = Classifier::new(None, 0.7);
        assert!(!classifier.has_model());
        assert_eq!(classifier.classify(&[]), Decision::passthrough());
        assert!(classifier.classify(&[1.0, 2.0]).accepted);
    }

    #[test]
    fn test_label_decision() {
        let classifier = Classifier::new(Some(loaded(false, 1)), 0.7);
        // 8 scales to 0.6 > 0 -> label 1
        let d = classifier.classify(&[8.0, 0.0]);
        assert!(d.accepted);
        assert_eq!(d.label, Some(1));
        assert!(d.probability.is_none());

        // 2 scales to -0.6 -> label -1
        let d = classifier.classify(&[2.0, 0.0]);
        assert!(!d.accepted);
        assert_eq!(d.label, Some(-1));
    }

    #[test]
    fn test_configurable_positive_label() {
        let classifier = Classifier::new(Some(loaded(false, -1)), 0.7);
        assert!(classifier.classify(&[2.0, 0.0]).accepted);
        assert!(!classifier.classify(&[8.0, 0.0]).accepted);
    }

    #[test]
    fn test_probability_threshold() {
        let classifier = Classifier::new(Some(loaded(true, 1)), 0.7);

        // Scaled value 1.0 -> P = 1 / (1 + e^-4) ~ 0.98
        let d = classifier.classify(&[10.0, 0.0]);
        assert!(d.accepted);
        assert!(d.probability.unwrap() > 0.9);

        // Scaled value 0.1 -> P = 1 / (1 + e^-0.4) ~ 0.60
        let d = classifier.classify(&[5.5, 0.0]);
        assert!(!d.accepted);
        let p = d.probability.unwrap();
        assert!(p > 0.5 && p < 0.7);

        let lenient = Classifier::new(Some(loaded(true, 1)), 0.5);
        assert!(lenient.classify(&[5.5, 0.0]).accepted);
    }
}
