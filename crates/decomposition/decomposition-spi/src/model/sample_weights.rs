//! Per sample weights

/// Weights attached to each observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleWeights {
    /// Effective number of measurements the value summarises
    pub count: f64,
    /// Reduction applied to suspected outliers, in [0, 1]
    pub outlier_weight: f64,
}

impl SampleWeights {
    /// Unit weights: one measurement, not an outlier
    pub fn unit() -> Self {
        Self {
            count: 1.0,
            outlier_weight: 1.0,
        }
    }

    pub fn with_count(count: f64) -> Self {
        Self {
            count,
            ..Self::unit()
        }
    }

    /// Weight to use when updating models, i.e. count derated for outliers
    pub fn count_for_update(&self) -> f64 {
        self.count * self.outlier_weight
    }

    /// Scale the count, leaving the outlier weight unchanged
    pub fn scale_count(&mut self, factor: f64) {
        self.count *= factor;
    }
}

impl Default for SampleWeights {
    fn default() -> Self {
        Self::unit()
    }
}
