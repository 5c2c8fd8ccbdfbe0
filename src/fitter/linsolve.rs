//! Linear algebra for the Newton step.
//!
//! The scaled KKT matrix is symmetric but indefinite (the multiplier block is
//! zero), so a Cholesky factorisation is not an option. The direct path is an
//! LU decomposition with partial pivoting; when that reports a singular or
//! numerically useless factorisation, the caller switches to [`SpectralSystem`],
//! which solves in the span of the largest eigenvectors only.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use thiserror::Error;
use tracing::trace;

/// Failure of a linear solve on the KKT system.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    /// Pivot ratio `min|Uᵢᵢ| / max|Uᵢᵢ|` below working precision.
    #[error("matrix is singular to working precision (pivot ratio {0:e})")]
    Singular(f64),

    #[error("symmetric eigen-decomposition did not converge")]
    EigenNoConvergence,

    #[error("linear system contains non-finite values")]
    NonFinite,
}

fn all_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

/// Solve `m · x = b` with a pivoted LU decomposition.
pub fn solve_direct(m: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, SolveError> {
    let n = m.nrows();
    if n == 0 {
        return Ok(DVector::zeros(0));
    }
    if !all_finite(m.iter()) || !all_finite(b.iter()) {
        return Err(SolveError::NonFinite);
    }

    let lu = m.clone().lu();
    let diag = lu.u().diagonal();
    let (min, max) = diag
        .iter()
        .map(|d| d.abs())
        .fold((f64::INFINITY, 0.0_f64), |(lo, hi), d| (lo.min(d), hi.max(d)));
    if max == 0.0 || min <= n as f64 * f64::EPSILON * max {
        let ratio = if max > 0.0 { min / max } else { 0.0 };
        return Err(SolveError::Singular(ratio));
    }

    let x = lu.solve(b).ok_or(SolveError::Singular(min / max))?;
    if !all_finite(x.iter()) {
        return Err(SolveError::NonFinite);
    }
    Ok(x)
}

/// Inverse of `m` via LU, with the same singularity test as [`solve_direct`].
pub fn invert(m: &DMatrix<f64>) -> Result<DMatrix<f64>, SolveError> {
    let n = m.nrows();
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    if !all_finite(m.iter()) {
        return Err(SolveError::NonFinite);
    }
    let lu = m.clone().lu();
    let diag = lu.u().diagonal();
    let max = diag.amax();
    let min = diag.iter().fold(f64::INFINITY, |lo, d| lo.min(d.abs()));
    if max == 0.0 || min <= n as f64 * f64::EPSILON * max {
        return Err(SolveError::Singular(if max > 0.0 { min / max } else { 0.0 }));
    }
    let inv = lu.try_inverse().ok_or(SolveError::Singular(min / max))?;
    if !all_finite(inv.iter()) {
        return Err(SolveError::NonFinite);
    }
    Ok(inv)
}

/// Eigen-decomposition of a symmetric matrix, prepared for truncated solves.
///
/// Eigenpairs are ordered by descending `|λ|`; eigenvalues below
/// `ε · n · max|λ|` count as zero and their components of the solution are
/// dropped.
#[derive(Debug, Clone)]
pub struct SpectralSystem {
    /// Eigenvectors as columns, same order as `eigenvalues`.
    vectors: DMatrix<f64>,
    eigenvalues: DVector<f64>,
    /// `Vᵀ b / λ`, zero where `λ` counts as zero.
    coeffs: DVector<f64>,
    rank: usize,
}

impl SpectralSystem {
    /// Decompose `m` and project `b` onto its eigenbasis.
    ///
    /// `max_iterations == 0` lets the decomposition run until it converges.
    pub fn new(
        m: &DMatrix<f64>,
        b: &DVector<f64>,
        max_iterations: usize,
    ) -> Result<Self, SolveError> {
        let n = m.nrows();
        if !all_finite(m.iter()) || !all_finite(b.iter()) {
            return Err(SolveError::NonFinite);
        }
        if n == 0 {
            return Ok(Self {
                vectors: DMatrix::zeros(0, 0),
                eigenvalues: DVector::zeros(0),
                coeffs: DVector::zeros(0),
                rank: 0,
            });
        }

        let eig = SymmetricEigen::try_new(m.clone(), f64::EPSILON, max_iterations)
            .ok_or(SolveError::EigenNoConvergence)?;

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&i, &j| eig.eigenvalues[j].abs().total_cmp(&eig.eigenvalues[i].abs()));

        let vectors = DMatrix::from_fn(n, n, |i, j| eig.eigenvectors[(i, order[j])]);
        let eigenvalues = DVector::from_fn(n, |j, _| eig.eigenvalues[order[j]]);

        let largest = eigenvalues[0].abs();
        let cutoff = f64::EPSILON * n as f64 * largest;
        let rank = eigenvalues.iter().take_while(|l| l.abs() > cutoff).count();

        let mut coeffs = vectors.tr_mul(b);
        for j in 0..n {
            if j < rank {
                coeffs[j] /= eigenvalues[j];
            } else {
                coeffs[j] = 0.0;
            }
        }
        if !all_finite(coeffs.iter()) {
            return Err(SolveError::NonFinite);
        }

        trace!(?eigenvalues, rank, "spectral decomposition");
        Ok(Self {
            vectors,
            eigenvalues,
            coeffs,
            rank,
        })
    }

    pub fn dim(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Number of eigenvalues that do not count as zero.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Eigenvalues ordered by descending magnitude.
    pub fn eigenvalues(&self) -> &DVector<f64> {
        &self.eigenvalues
    }

    /// Solution restricted to the `k` leading eigenvectors: `V[:, :k] · c[:k]`.
    /// `k` is clamped to the rank.
    pub fn step(&self, k: usize) -> DVector<f64> {
        let k = k.min(self.rank);
        let mut x = DVector::zeros(self.dim());
        for j in 0..k {
            x.axpy(self.coeffs[j], &self.vectors.column(j), 1.0);
        }
        x
    }
}
