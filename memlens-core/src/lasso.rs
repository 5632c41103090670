//! L1-regularized least squares via coordinate descent
//!
//! Minimizes `||y − Zw||² + λ·||w||₁` by cycling per-coordinate
//! soft-thresholding updates. This is the sparse-regression half of
//! ContextCite: Z is the ablation mask matrix, y the oracle log-probs.

/// Result of a LASSO fit
#[derive(Debug, Clone)]
pub struct LassoFit {
    pub weights: Vec<f64>,
    pub iterations: usize,
    /// False when the fit stopped on the iteration cap instead of tolerance
    pub converged: bool,
}

/// Default iteration cap
pub const DEFAULT_MAX_ITER: usize = 1000;

/// Default convergence tolerance on `Σ|Δw|`
pub const DEFAULT_TOL: f64 = 1e-6;

fn soft_threshold(rho: f64, t: f64) -> f64 {
    rho.signum() * (rho.abs() - t).max(0.0)
}

/// Fit `w` minimizing `||y − Zw||² + λ·||w||₁`
///
/// `rows` is the n×k design matrix, one row per observation. Coordinates
/// whose column is entirely zero keep weight 0; an all-zero design matrix
/// yields zero weights rather than an error.
pub fn lasso(rows: &[Vec<f64>], y: &[f64], lambda: f64, max_iter: usize, tol: f64) -> LassoFit {
    let n = rows.len();
    let k = rows.first().map_or(0, Vec::len);
    if n == 0 || k == 0 {
        return LassoFit {
            weights: vec![0.0; k],
            iterations: 0,
            converged: true,
        };
    }

    // Column sums of squares; zero columns are frozen at weight 0.
    let mut col_sq = vec![0.0f64; k];
    for row in rows {
        for (j, z) in row.iter().enumerate() {
            col_sq[j] += z * z;
        }
    }

    let mut weights = vec![0.0f64; k];
    let mut residual: Vec<f64> = y.to_vec();
    let threshold = lambda * n as f64;

    let mut iterations = 0;
    let mut converged = false;
    while iterations < max_iter {
        iterations += 1;
        let mut total_delta = 0.0;

        for j in 0..k {
            if col_sq[j] == 0.0 {
                continue;
            }
            // rho_j = Σᵢ zᵢⱼ (rᵢ + zᵢⱼ wⱼ): the partial residual correlation
            // with coordinate j added back in.
            let mut rho = 0.0;
            for (row, r) in rows.iter().zip(residual.iter()) {
                rho += row[j] * (r + row[j] * weights[j]);
            }

            let updated = soft_threshold(rho, threshold) / col_sq[j];
            let delta = updated - weights[j];
            if delta != 0.0 {
                for (row, r) in rows.iter().zip(residual.iter_mut()) {
                    *r -= row[j] * delta;
                }
                weights[j] = updated;
            }
            total_delta += delta.abs();
        }

        if total_delta < tol {
            converged = true;
            break;
        }
    }

    LassoFit {
        weights,
        iterations,
        converged,
    }
}

/// Fit with the default iteration cap and tolerance
pub fn lasso_default(rows: &[Vec<f64>], y: &[f64], lambda: f64) -> LassoFit {
    lasso(rows, y, lambda, DEFAULT_MAX_ITER, DEFAULT_TOL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_sparse_signal() {
        // y = 2·z₀ − 1·z₁ with z₂ pure noise carrier that never varies y.
        let rows = vec![
            vec![1.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![0.0, 0.0, 1.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 1.0],
            vec![1.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0],
        ];
        let y: Vec<f64> = rows.iter().map(|r| 2.0 * r[0] - r[1]).collect();

        let fit = lasso(&rows, &y, 0.01, 1000, 1e-8);
        assert!(fit.converged);
        assert!((fit.weights[0] - 2.0).abs() < 0.2, "w0 {}", fit.weights[0]);
        assert!((fit.weights[1] + 1.0).abs() < 0.2, "w1 {}", fit.weights[1]);
        assert!(fit.weights[2].abs() < 0.1, "w2 {}", fit.weights[2]);
    }

    #[test]
    fn test_strong_regularization_zeroes_irrelevant_coordinate() {
        // Third memory never changes the outcome; with λ = 2.0 its weight
        // must vanish while the informative two survive.
        let rows = vec![
            vec![0.0, 0.0, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![1.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0],
            vec![1.0, 1.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 1.0],
            vec![0.0, 0.0, 1.0],
        ];
        let y: Vec<f64> = rows.iter().map(|r| 8.0 * r[0] + 6.0 * r[1]).collect();

        let fit = lasso(&rows, &y, 2.0, 1000, 1e-8);
        assert!(fit.weights[2].abs() < 0.01, "w2 {}", fit.weights[2]);
        assert!(fit.weights[0] > 1.0, "w0 {}", fit.weights[0]);
        assert!(fit.weights[1] > 1.0, "w1 {}", fit.weights[1]);
    }

    #[test]
    fn test_zero_design_matrix_returns_zero_weights() {
        let rows = vec![vec![0.0, 0.0], vec![0.0, 0.0]];
        let y = vec![1.0, 2.0];
        let fit = lasso_default(&rows, &y, 0.1);
        assert_eq!(fit.weights, vec![0.0, 0.0]);
        assert!(fit.converged);
    }

    #[test]
    fn test_empty_inputs() {
        let fit = lasso_default(&[], &[], 0.1);
        assert!(fit.weights.is_empty());
        assert!(fit.converged);
    }

    #[test]
    fn test_huge_lambda_kills_everything() {
        let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let y = vec![1.0, 1.0, 2.0];
        let fit = lasso_default(&rows, &y, 1e6);
        assert_eq!(fit.weights, vec![0.0, 0.0]);
    }

    #[test]
    fn test_iteration_cap_reported() {
        let rows = vec![
            vec![1.0, 0.9],
            vec![0.9, 1.0],
            vec![1.0, 1.0],
        ];
        let y = vec![1.0, -1.0, 0.5];
        // One iteration cannot converge on correlated columns.
        let fit = lasso(&rows, &y, 0.001, 1, 0.0);
        assert_eq!(fit.iterations, 1);
        assert!(!fit.converged);
    }
}
