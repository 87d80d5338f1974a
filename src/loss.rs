use nalgebra::DMatrix;

use crate::error::{ensure_shape, Result};

/// Added inside the logarithm so a zero probability doesn't yield `-inf`.
const LOG_DELTA: f32 = 1e-7;

/// Batch-averaged cross-entropy between probabilities `y` and one-hot targets `t`.
pub fn cross_entropy_error(y: &DMatrix<f32>, t: &DMatrix<f32>) -> Result<f32> {
    ensure_shape("cross_entropy_error", y.shape(), t.shape())?;

    let batch_size = y.nrows().max(1) as f32;
    let total: f32 = y
        .iter()
        .zip(t.iter())
        .map(|(&p, &target)| target * f32::ln(p + LOG_DELTA))
        .sum();

    Ok(-total / batch_size)
}

/// Batch-averaged half sum of squared errors.
pub fn mean_squared_error(y: &DMatrix<f32>, t: &DMatrix<f32>) -> Result<f32> {
    ensure_shape("mean_squared_error", y.shape(), t.shape())?;

    let batch_size = y.nrows().max(1) as f32;

    Ok(0.5 * (y - t).norm_squared() / batch_size)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn cross_entropy_of_confident_prediction() {
        let t = DMatrix::from_row_slice(1, 3, &[0.0, 1.0, 0.0]);
        let good = DMatrix::from_row_slice(1, 3, &[0.05, 0.9, 0.05]);
        let bad = DMatrix::from_row_slice(1, 3, &[0.8, 0.1, 0.1]);

        assert_relative_eq!(
            cross_entropy_error(&good, &t).unwrap(),
            -f32::ln(0.9 + LOG_DELTA),
            epsilon = 1e-6
        );
        assert!(cross_entropy_error(&bad, &t).unwrap() > cross_entropy_error(&good, &t).unwrap());
    }

    #[test]
    fn cross_entropy_averages_over_batch() {
        let t = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 0.0]);
        let y = DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 0.5, 0.5]);

        assert_relative_eq!(cross_entropy_error(&y, &t).unwrap(), f32::ln(2.0), epsilon = 1e-5);
    }

    #[test]
    fn mean_squared_error_value() {
        let t = DMatrix::from_row_slice(1, 3, &[0.0, 1.0, 0.0]);
        let y = DMatrix::from_row_slice(1, 3, &[0.1, 0.6, 0.3]);

        assert_relative_eq!(mean_squared_error(&y, &t).unwrap(), 0.13, epsilon = 1e-6);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let y = DMatrix::<f32>::zeros(2, 3);
        let t = DMatrix::<f32>::zeros(3, 2);

        assert!(cross_entropy_error(&y, &t).is_err());
    }
}
