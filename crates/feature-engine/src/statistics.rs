//! Statistical Features Computation

/// Summary statistics for one signal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatisticalFeatures {
    /// Mean value
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
}

impl StatisticalFeatures {
    /// Compute statistical features from a slice of values
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let n = values.len() as f64;

        // Mean
        let mean = values.iter().sum::<f64>() / n;

        // Min/Max
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        let max = values.iter().cloned().fold(f64::MIN, f64::max);

        // Variance (ddof = 0)
        let m2: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
        let std_dev = (m2 / n).sqrt();

        Self {
            mean,
            std_dev,
            min,
            max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_computation() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let stats = StatisticalFeatures::compute(&values);
        assert!((stats.mean - 3.0).abs() < 0.001);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
    }

    #[test]
    fn test_std_dev_is_population() {
        let values = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let stats = StatisticalFeatures::compute(&values);
        assert!((stats.std_dev - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_signal() {
        let stats = StatisticalFeatures::compute(&[3.5; 10]);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.min, stats.max);
    }

    #[test]
    fn test_empty_values() {
        let values: Vec<f64> = vec![];
        let stats = StatisticalFeatures::compute(&values);
        assert_eq!(stats.mean, 0.0);
    }
}
