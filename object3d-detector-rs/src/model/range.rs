//! Feature scaling ranges in the libsvm `svm-scale` text format.
//!
//! ```text
//! x
//! -1 1
//! 1 5 3208
//! 2 1.2 1496.8
//! ...
//! ```
//!
//! The first line is the section header (`x` as written by `svm-scale`; any
//! single line is accepted), the second the target interval
//! `(x_lower, x_upper)`, then one `index min max` line per feature with
//! 1-based indices. A `y` section (target scaling) may precede the header; it
//! is skipped since classification labels are never rescaled.

use std::fs;
use std::path::Path;

use super::{ModelError, Result};

/// Per-feature training ranges plus the target interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingTable {
    pub x_lower: f64,
    pub x_upper: f64,
    /// `(min, max)` per feature; `(0, 0)` means "leave unscaled".
    ranges: Vec<(f64, f64)>,
}

impl ScalingTable {
    /// A table of `dimension` features that leaves every value unchanged.
    pub fn identity(dimension: usize) -> Self {
        Self {
            x_lower: -1.0,
            x_upper: 1.0,
            ranges: vec![(0.0, 0.0); dimension],
        }
    }

    pub fn dimension(&self) -> usize {
        self.ranges.len()
    }

    pub fn range(&self, index: usize) -> Option<(f64, f64)> {
        self.ranges.get(index).copied()
    }

    /// Set the training range of feature `index` (0-based).
    pub fn set_range(&mut self, index: usize, min: f64, max: f64) {
        if let Some(slot) = self.ranges.get_mut(index) {
            *slot = (min, max);
        }
    }

    /// Number of features with a usable (non-degenerate) range.
    pub fn scaled_count(&self) -> usize {
        self.ranges
            .iter()
            .filter(|(min, max)| (min - max).abs() >= f64::EPSILON)
            .count()
    }

    /// Map one raw value of feature `index` into `[x_lower, x_upper]`.
    ///
    /// Features that were constant during training are passed through. The
    /// exact bounds map to exactly `x_lower`/`x_upper`.
    #[inline]
    pub fn scale_value(&self, index: usize, value: f64) -> f64 {
        let Some(&(min, max)) = self.ranges.get(index) else {
            return value;
        };
        if (min - max).abs() < f64::EPSILON {
            value
        } else if (value - min).abs() < f64::EPSILON {
            self.x_lower
        } else if (value - max).abs() < f64::EPSILON {
            self.x_upper
        } else {
            self.x_lower + (self.x_upper - self.x_lower) * (value - min) / (max - min)
        }
    }

    /// Scale a whole feature vector in place.
    pub fn apply(&self, values: &mut [f64]) {
        for (i, v) in values.iter_mut().enumerate() {
            *v = self.scale_value(i, *v);
        }
    }

    /// Parse the text table for a `dimension`-long feature vector.
    ///
    /// Lines that do not parse, or whose index falls outside
    /// `1..=dimension`, are logged and skipped; the feature stays unscaled.
    pub fn parse(content: &str, dimension: usize) -> Result<Self> {
        let mut table = Self::identity(dimension);
        let mut lines = content
            .lines()
            .enumerate()
            .map(|(n, l)| (n + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let mut header = lines.next();
        if let Some((_, "y")) = header {
            // y section: bounds line and label range line
            lines.next();
            lines.next();
            header = lines.next();
        }

        match header {
            Some((_, "x")) => {}
            Some((n, other)) => log::debug!("range table line {}: header '{}' taken as 'x'", n, other),
            None => return Err(ModelError::InvalidRange("empty range table".to_string())),
        }

        let (n, bounds) = lines
            .next()
            .ok_or_else(|| ModelError::InvalidRange("missing target bounds".to_string()))?;
        let bounds: Vec<f64> = bounds
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ModelError::InvalidRange(format!("line {}: {}", n, e)))?;
        if bounds.len() != 2 {
            return Err(ModelError::InvalidRange(format!(
                "line {}: expected 'lower upper', found {} values",
                n,
                bounds.len()
            )));
        }
        table.x_lower = bounds[0];
        table.x_upper = bounds[1];

        for (n, line) in lines {
            match parse_range_line(line) {
                Some((index, min, max)) if index >= 1 && index <= dimension => {
                    table.set_range(index - 1, min, max);
                }
                Some((index, _, _)) => {
                    log::warn!(
                        "range table line {}: feature index {} outside 1..={}, ignored",
                        n,
                        index,
                        dimension
                    );
                }
                None => {
                    log::warn!("range table line {}: malformed entry '{}', ignored", n, line);
                }
            }
        }

        Ok(table)
    }

    /// Load a range table from disk.
    pub fn load<P: AsRef<Path>>(path: P, dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, dimension)
    }
}

fn parse_range_line(line: &str) -> Option<(usize, f64, f64)> {
    let mut fields = line.split_whitespace();
    let index = fields.next()?.parse().ok()?;
    let min = fields.next()?.parse().ok()?;
    let max = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((index, min, max))
}
