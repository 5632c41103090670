//! Vector math shared by the attribution engines
//!
//! All inputs are fixed-dimension f32 embeddings; accumulation happens in
//! f64. Above [`COMPENSATED_DIM`] dimensions the dot product switches to
//! Kahan compensated summation to keep rounding error bounded.

use crate::error::{CoreError, Result};

/// Dimension at or above which compensated summation is used
pub const COMPENSATED_DIM: usize = 256;

/// Tolerance for the unit-norm check
const UNIT_NORM_TOL: f64 = 1e-3;

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(CoreError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(())
}

fn naive_dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

fn kahan_dot(a: &[f32], b: &[f32]) -> f64 {
    let mut sum = 0.0f64;
    let mut comp = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let term = f64::from(*x) * f64::from(*y) - comp;
        let next = sum + term;
        comp = (next - sum) - term;
        sum = next;
    }
    sum
}

/// Dot product of two equal-length vectors
pub fn dot(a: &[f32], b: &[f32]) -> Result<f64> {
    check_dims(a, b)?;
    if a.len() >= COMPENSATED_DIM {
        Ok(kahan_dot(a, b))
    } else {
        Ok(naive_dot(a, b))
    }
}

/// Euclidean norm of a vector
pub fn norm(v: &[f32]) -> f64 {
    let sq = if v.len() >= COMPENSATED_DIM {
        kahan_dot(v, v)
    } else {
        naive_dot(v, v)
    };
    sq.sqrt()
}

/// Cosine similarity between two vectors
///
/// Returns 0.0 when either operand has zero norm so degenerate embeddings
/// never leak NaN into downstream scores.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f64> {
    check_dims(a, b)?;
    let norm_a = norm(a);
    let norm_b = norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot(a, b)? / (norm_a * norm_b))
}

/// Scale a vector to unit norm
///
/// The zero vector is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| (f64::from(*x) / n) as f32).collect()
}

/// Whether a vector is unit-norm within tolerance
pub fn is_unit_norm(v: &[f32]) -> bool {
    (norm(v) - 1.0).abs() < UNIT_NORM_TOL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine(&v, &v).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine(&a, &b).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine(&a, &b).unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_zero_norm_returns_zero() {
        let a = vec![1.0, 2.0, 3.0];
        let z = vec![0.0, 0.0, 0.0];
        assert_eq!(cosine(&a, &z).unwrap(), 0.0);
        assert_eq!(cosine(&z, &z).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            cosine(&a, &b),
            Err(CoreError::DimensionMismatch { left: 2, right: 3 })
        ));
        assert!(dot(&a, &b).is_err());
    }

    #[test]
    fn test_normalize_produces_unit_norm() {
        let v = vec![3.0, 4.0];
        let n = normalize(&v);
        assert!((norm(&n) - 1.0).abs() < 1e-6);
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert!((n[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_unchanged() {
        let z = vec![0.0, 0.0, 0.0];
        assert_eq!(normalize(&z), z);
        assert!(!is_unit_norm(&z));
    }

    #[test]
    fn test_kahan_path_matches_naive_on_large_dims() {
        // 384-dim vectors take the compensated path; the result must agree
        // with the naive sum well beyond the f32 inputs' precision.
        let a: Vec<f32> = (0..384).map(|i| ((i % 7) as f32 - 3.0) * 0.125).collect();
        let b: Vec<f32> = (0..384).map(|i| ((i % 5) as f32 - 2.0) * 0.25).collect();
        assert!((kahan_dot(&a, &b) - naive_dot(&a, &b)).abs() < 1e-9);
        assert_eq!(dot(&a, &b).unwrap(), kahan_dot(&a, &b));
    }
}
