//! Support vector classifier stored in the libsvm text model format.
//!
//! Only the classification variants (`c_svc`, `nu_svc`) with the built-in
//! kernels are supported. Prediction follows libsvm exactly: one-vs-one
//! decision functions with majority voting, and for probability models a
//! Platt sigmoid per class pair combined by pairwise coupling.

use std::fs;
use std::path::Path;

use super::{ClassifierModel, ModelError, Result};

/// Kernel function and its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    Linear,
    Polynomial { degree: i32, gamma: f64, coef0: f64 },
    Rbf { gamma: f64 },
    Sigmoid { gamma: f64, coef0: f64 },
}

impl Kernel {
    fn name(&self) -> &'static str {
        match self {
            Kernel::Linear => "linear",
            Kernel::Polynomial { .. } => "polynomial",
            Kernel::Rbf { .. } => "rbf",
            Kernel::Sigmoid { .. } => "sigmoid",
        }
    }

    /// Evaluate `k(x, sv)`. Missing trailing entries count as zero.
    #[inline]
    fn eval(&self, x: &[f64], sv: &[f64]) -> f64 {
        match *self {
            Kernel::Linear => dot(x, sv),
            Kernel::Polynomial {
                degree,
                gamma,
                coef0,
            } => (gamma * dot(x, sv) + coef0).powi(degree),
            Kernel::Rbf { gamma } => (-gamma * squared_distance(x, sv)).exp(),
            Kernel::Sigmoid { gamma, coef0 } => (gamma * dot(x, sv) + coef0).tanh(),
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    let common = a.len().min(b.len());
    let shared: f64 = a[..common]
        .iter()
        .zip(&b[..common])
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    let tail: f64 = a[common..]
        .iter()
        .chain(&b[common..])
        .map(|v| v * v)
        .sum();
    shared + tail
}

/// A trained multi-class SVM.
#[derive(Debug, Clone)]
pub struct SvmModel {
    kernel: Kernel,
    labels: Vec<i32>,
    /// Support vectors per class, consecutively.
    n_sv: Vec<usize>,
    /// Dense support vectors, indexed from feature 1 at position 0.
    support_vectors: Vec<Vec<f64>>,
    /// `nr_class - 1` coefficient rows, each `total_sv` long.
    sv_coef: Vec<Vec<f64>>,
    /// One bias per class pair.
    rho: Vec<f64>,
    prob_a: Option<Vec<f64>>,
    prob_b: Option<Vec<f64>>,
}

fn header_err(line: usize, msg: impl Into<String>) -> ModelError {
    ModelError::InvalidModel {
        line,
        message: msg.into(),
    }
}

fn parse_values<T: std::str::FromStr>(line: usize, key: &str, values: &[&str]) -> Result<Vec<T>> {
    values
        .iter()
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| header_err(line, format!("invalid value '{}' for '{}'", v, key)))
        })
        .collect()
}

fn parse_single<T: std::str::FromStr>(line: usize, key: &str, values: &[&str]) -> Result<T> {
    match values {
        [v] => v
            .parse::<T>()
            .map_err(|_| header_err(line, format!("invalid value '{}' for '{}'", v, key))),
        _ => Err(header_err(line, format!("'{}' takes exactly one value", key))),
    }
}

impl SvmModel {
    /// Parse a model from libsvm text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut svm_type: Option<String> = None;
        let mut kernel_type: Option<String> = None;
        let mut degree = 3i32;
        let mut gamma = 0.0f64;
        let mut coef0 = 0.0f64;
        let mut nr_class: Option<usize> = None;
        let mut total_sv: Option<usize> = None;
        let mut rho: Option<Vec<f64>> = None;
        let mut labels: Option<Vec<i32>> = None;
        let mut prob_a: Option<Vec<f64>> = None;
        let mut prob_b: Option<Vec<f64>> = None;
        let mut n_sv: Option<Vec<usize>> = None;

        let mut lines = content.lines().enumerate().map(|(n, l)| (n + 1, l.trim()));
        let mut sv_section = false;

        for (n, line) in &mut lines {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (key, values) = (fields[0], &fields[1..]);
            match key {
                "svm_type" => svm_type = Some(parse_single(n, key, values)?),
                "kernel_type" => kernel_type = Some(parse_single(n, key, values)?),
                "degree" => degree = parse_single(n, key, values)?,
                "gamma" => gamma = parse_single(n, key, values)?,
                "coef0" => coef0 = parse_single(n, key, values)?,
                "nr_class" => nr_class = Some(parse_single(n, key, values)?),
                "total_sv" => total_sv = Some(parse_single(n, key, values)?),
                "rho" => rho = Some(parse_values(n, key, values)?),
                "label" => labels = Some(parse_values(n, key, values)?),
                "probA" => prob_a = Some(parse_values(n, key, values)?),
                "probB" => prob_b = Some(parse_values(n, key, values)?),
                "nr_sv" => n_sv = Some(parse_values(n, key, values)?),
                "prob_density_marks" => {}
                "SV" => {
                    sv_section = true;
                    break;
                }
                other => return Err(header_err(n, format!("unknown header key '{}'", other))),
            }
        }

        if !sv_section {
            return Err(header_err(0, "missing 'SV' section"));
        }

        let svm_type = svm_type.ok_or_else(|| header_err(0, "missing 'svm_type'"))?;
        if svm_type != "c_svc" && svm_type != "nu_svc" {
            return Err(ModelError::Unsupported(format!(
                "svm_type '{}' is not a classifier",
                svm_type
            )));
        }

        let kernel = match kernel_type.as_deref() {
            Some("linear") => Kernel::Linear,
            Some("polynomial") => Kernel::Polynomial {
                degree,
                gamma,
                coef0,
            },
            Some("rbf") => Kernel::Rbf { gamma },
            Some("sigmoid") => Kernel::Sigmoid { gamma, coef0 },
            Some(other) => {
                return Err(ModelError::Unsupported(format!(
                    "kernel_type '{}'",
                    other
                )))
            }
            None => return Err(header_err(0, "missing 'kernel_type'")),
        };

        let nr_class = nr_class.ok_or_else(|| header_err(0, "missing 'nr_class'"))?;
        if nr_class < 2 {
            return Err(header_err(0, format!("nr_class must be at least 2, got {}", nr_class)));
        }
        let pairs = nr_class * (nr_class - 1) / 2;
        let total_sv = total_sv.ok_or_else(|| header_err(0, "missing 'total_sv'"))?;

        let rho = rho.ok_or_else(|| header_err(0, "missing 'rho'"))?;
        let labels = labels.ok_or_else(|| header_err(0, "missing 'label'"))?;
        let n_sv = n_sv.ok_or_else(|| header_err(0, "missing 'nr_sv'"))?;

        if rho.len() != pairs {
            return Err(header_err(0, format!("expected {} rho values, found {}", pairs, rho.len())));
        }
        if labels.len() != nr_class || n_sv.len() != nr_class {
            return Err(header_err(0, "'label' and 'nr_sv' must list one entry per class"));
        }
        if n_sv.iter().sum::<usize>() != total_sv {
            return Err(header_err(0, "'nr_sv' does not add up to 'total_sv'"));
        }
        for (name, probs) in [("probA", &prob_a), ("probB", &prob_b)] {
            if let Some(p) = probs {
                if p.len() != pairs {
                    return Err(header_err(
                        0,
                        format!("expected {} {} values, found {}", pairs, name, p.len()),
                    ));
                }
            }
        }

        let mut sv_coef = vec![Vec::with_capacity(total_sv); nr_class - 1];
        let mut support_vectors = Vec::with_capacity(total_sv);

        for (n, line) in lines {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            for row in sv_coef.iter_mut() {
                let coef = fields
                    .next()
                    .and_then(|c| c.parse::<f64>().ok())
                    .ok_or_else(|| header_err(n, "missing support vector coefficient"))?;
                row.push(coef);
            }

            let mut sv: Vec<f64> = Vec::new();
            for node in fields {
                let (idx, val) = node
                    .split_once(':')
                    .ok_or_else(|| header_err(n, format!("malformed node '{}'", node)))?;
                let idx: usize = idx
                    .parse()
                    .map_err(|_| header_err(n, format!("malformed index in '{}'", node)))?;
                let val: f64 = val
                    .parse()
                    .map_err(|_| header_err(n, format!("malformed value in '{}'", node)))?;
                if idx == 0 {
                    return Err(header_err(n, "feature indices start at 1"));
                }
                if sv.len() < idx {
                    sv.resize(idx, 0.0);
                }
                sv[idx - 1] = val;
            }
            support_vectors.push(sv);
        }

        if support_vectors.len() != total_sv {
            return Err(header_err(
                0,
                format!(
                    "expected {} support vectors, found {}",
                    total_sv,
                    support_vectors.len()
                ),
            ));
        }

        Ok(Self {
            kernel,
            labels,
            n_sv,
            support_vectors,
            sv_coef,
            rho,
            prob_a,
            prob_b,
        })
    }

    /// Load a model file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    pub fn total_sv(&self) -> usize {
        self.support_vectors.len()
    }

    /// One-vs-one decision values, in libsvm pair order (0v1, 0v2, ..., 1v2, ...).
    pub fn decision_values(&self, x: &[f64]) -> Vec<f64> {
        let nr_class = self.labels.len();
        let kvalue: Vec<f64> = self
            .support_vectors
            .iter()
            .map(|sv| self.kernel.eval(x, sv))
            .collect();

        let mut start = Vec::with_capacity(nr_class);
        let mut acc = 0;
        for &count in &self.n_sv {
            start.push(acc);
            acc += count;
        }

        let mut dec_values = Vec::with_capacity(self.rho.len());
        for i in 0..nr_class {
            for j in (i + 1)..nr_class {
                let (si, sj) = (start[i], start[j]);
                let (ci, cj) = (self.n_sv[i], self.n_sv[j]);
                let coef1 = &self.sv_coef[j - 1];
                let coef2 = &self.sv_coef[i];

                let mut sum = 0.0;
                for k in 0..ci {
                    sum += coef1[si + k] * kvalue[si + k];
                }
                for k in 0..cj {
                    sum += coef2[sj + k] * kvalue[sj + k];
                }
                sum -= self.rho[dec_values.len()];
                dec_values.push(sum);
            }
        }
        dec_values
    }

    fn vote(&self, dec_values: &[f64]) -> i32 {
        let nr_class = self.labels.len();
        let mut votes = vec![0usize; nr_class];
        let mut p = 0;
        for i in 0..nr_class {
            for j in (i + 1)..nr_class {
                if dec_values[p] > 0.0 {
                    votes[i] += 1;
                } else {
                    votes[j] += 1;
                }
                p += 1;
            }
        }
        let mut best = 0;
        for i in 1..nr_class {
            if votes[i] > votes[best] {
                best = i;
            }
        }
        self.labels[best]
    }
}

/// Platt sigmoid `1 / (1 + exp(dec * A + B))`, evaluated without overflow.
fn sigmoid_predict(decision_value: f64, a: f64, b: f64) -> f64 {
    let f_apb = decision_value * a + b;
    if f_apb >= 0.0 {
        (-f_apb).exp() / (1.0 + (-f_apb).exp())
    } else {
        1.0 / (1.0 + f_apb.exp())
    }
}

/// Pairwise coupling of `r[i][j] = P(i | i or j)` into class probabilities.
fn multiclass_probability(k: usize, r: &[Vec<f64>]) -> Vec<f64> {
    let max_iter = 100.max(k);
    let eps = 0.005 / k as f64;
    let mut p = vec![1.0 / k as f64; k];
    let mut q = vec![vec![0.0f64; k]; k];
    let mut qp = vec![0.0f64; k];

    for t in 0..k {
        for j in 0..t {
            q[t][t] += r[j][t] * r[j][t];
            q[t][j] = q[j][t];
        }
        for j in (t + 1)..k {
            q[t][t] += r[j][t] * r[j][t];
            q[t][j] = -r[j][t] * r[t][j];
        }
    }

    for _ in 0..max_iter {
        let mut pqp = 0.0;
        for t in 0..k {
            qp[t] = (0..k).map(|j| q[t][j] * p[j]).sum();
            pqp += p[t] * qp[t];
        }
        let max_error = qp
            .iter()
            .map(|v| (v - pqp).abs())
            .fold(0.0f64, f64::max);
        if max_error < eps {
            break;
        }
        for t in 0..k {
            let diff = (-qp[t] + pqp) / q[t][t];
            p[t] += diff;
            pqp = (pqp + diff * (diff * q[t][t] + 2.0 * qp[t])) / (1.0 + diff) / (1.0 + diff);
            for j in 0..k {
                qp[j] = (qp[j] + diff * q[t][j]) / (1.0 + diff);
                p[j] /= 1.0 + diff;
            }
        }
    }
    p
}

impl ClassifierModel for SvmModel {
    fn labels(&self) -> &[i32] {
        &self.labels
    }

    fn supports_probability(&self) -> bool {
        self.prob_a.is_some() && self.prob_b.is_some()
    }

    fn predict(&self, x: &[f64]) -> i32 {
        self.vote(&self.decision_values(x))
    }

    fn predict_probability(&self, x: &[f64]) -> Option<Vec<f64>> {
        let (prob_a, prob_b) = (self.prob_a.as_ref()?, self.prob_b.as_ref()?);
        let nr_class = self.labels.len();
        let dec_values = self.decision_values(x);

        const MIN_PROB: f64 = 1e-7;
        let mut pairwise = vec![vec![0.0f64; nr_class]; nr_class];
        let mut k = 0;
        for i in 0..nr_class {
            for j in (i + 1)..nr_class {
                let r = sigmoid_predict(dec_values[k], prob_a[k], prob_b[k])
                    .clamp(MIN_PROB, 1.0 - MIN_PROB);
                pairwise[i][j] = r;
                pairwise[j][i] = 1.0 - r;
                k += 1;
            }
        }

        if nr_class == 2 {
            Some(vec![pairwise[0][1], pairwise[1][0]])
        } else {
            Some(multiclass_probability(nr_class, &pairwise))
        }
    }

    fn describe(&self) -> String {
        format!(
            "SVM ({} kernel, {} classes, {} support vectors{})",
            self.kernel_name(),
            self.labels.len(),
            self.total_sv(),
            if self.supports_probability() {
                ", probabilistic"
            } else {
                ""
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Linear model with w = (1, 0) and b = 0: sign(x1) decides.
    ///
    /// Two SVs with coef +1 (label 1) at (1, 0) and coef -1 (label -1) at
    /// (0, 0): decision = x·(1,0) - x·(0,0) - rho = x1.
    const LINEAR_MODEL: &str = "svm_type c_svc
kernel_type linear
nr_class 2
total_sv 2
rho 0
label 1 -1
nr_sv 1 1
SV
1 1:1
-1 2:0
";

    fn probabilistic_model() -> String {
        LINEAR_MODEL.replace("nr_sv 1 1", "probA -2\nprobB 0\nnr_sv 1 1")
    }

    #[test]
    fn test_parse_linear_model() {
        let model = SvmModel::parse(LINEAR_MODEL).unwrap();
        assert_eq!(model.labels(), &[1, -1]);
        assert_eq!(model.kernel_name(), "linear");
        assert_eq!(model.total_sv(), 2);
        assert!(!model.supports_probability());
    }

    #[test]
    fn test_linear_decision_and_vote() {
        let model = SvmModel::parse(LINEAR_MODEL).unwrap();
        let dec = model.decision_values(&[0.5, 3.0]);
        assert_eq!(dec.len(), 1);
        assert!((dec[0] - 0.5).abs() < 1e-12);

        assert_eq!(model.predict(&[0.5, 3.0]), 1);
        assert_eq!(model.predict(&[-0.5, 3.0]), -1);
        // A zero decision value votes for the second class, as in libsvm.
        assert_eq!(model.predict(&[0.0, 0.0]), -1);
    }

    #[test]
    fn test_probability_estimates() {
        let model = SvmModel::parse(&probabilistic_model()).unwrap();
        assert!(model.supports_probability());

        // P(label 1) = 1 / (1 + exp(-2 * dec)).
        let probs = model.predict_probability(&[1.0, 0.0]).unwrap();
        let expected = 1.0 / (1.0 + (-2.0f64).exp());
        assert!((probs[0] - expected).abs() < 1e-12);
        assert!((probs[0] + probs[1] - 1.0).abs() < 1e-12);

        let probs = model.predict_probability(&[-1.0, 0.0]).unwrap();
        assert!(probs[0] < 0.5);
    }

    #[test]
    fn test_rbf_kernel() {
        let kernel = Kernel::Rbf { gamma: 0.5 };
        assert!((kernel.eval(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-12);
        // Missing trailing entries count as zero.
        let expected = (-0.5f64 * (1.0 + 4.0)).exp();
        assert!((kernel.eval(&[1.0, 2.0], &[]) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_three_class_vote_and_coupling() {
        // Linear, one SV per class; coefficients make class 0 win when x1 > 0.
        let model = "svm_type c_svc
kernel_type linear
nr_class 3
total_sv 3
rho 0 0 0
label 1 2 3
probA -1 -1 -1
probB 0 0 0
nr_sv 1 1 1
SV
1 1 1:1
-1 1 1:0
-1 -1 1:-1
";
        let model = SvmModel::parse(model).unwrap();
        assert_eq!(model.predict(&[2.0]), 1);

        let probs = model.predict_probability(&[2.0]).unwrap();
        assert_eq!(probs.len(), 3);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(probs[0] > probs[1] && probs[0] > probs[2]);
    }

    #[test]
    fn test_rejects_regression_and_bad_headers() {
        let svr = LINEAR_MODEL.replace("c_svc", "epsilon_svr");
        assert!(matches!(SvmModel::parse(&svr), Err(ModelError::Unsupported(_))));

        let precomputed = LINEAR_MODEL.replace("kernel_type linear", "kernel_type precomputed");
        assert!(matches!(
            SvmModel::parse(&precomputed),
            Err(ModelError::Unsupported(_))
        ));

        let missing_sv = LINEAR_MODEL.replace("-1 2:0\n", "");
        assert!(SvmModel::parse(&missing_sv).is_err());

        let unknown = LINEAR_MODEL.replace("rho 0", "rho 0\nfoo 1");
        assert!(SvmModel::parse(&unknown).is_err());

        assert!(SvmModel::parse("").is_err());
    }

    #[test]
    fn test_sigmoid_predict_is_stable() {
        assert!((sigmoid_predict(0.0, 1.0, 0.0) - 0.5).abs() < 1e-12);
        let big = sigmoid_predict(1e4, 1.0, 0.0);
        let small = sigmoid_predict(-1e4, 1.0, 0.0);
        assert!(big.is_finite() && big >= 0.0 && big < 1e-6);
        assert!(small.is_finite() && (small - 1.0).abs() < 1e-6);
    }
}
