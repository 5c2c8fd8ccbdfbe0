//! Covariance of the fitted parameters.
//!
//! At the solution the stationarity conditions `F(a, λ; η) = 0` hold, with `η`
//! the measured values. By the implicit function theorem
//!
//! ```text
//!  ∂(a, λ)/∂η = −M⁻¹ · ∂F/∂η,    ∂F/∂η = [ ∂²χ²/∂a∂η ; 0 ]
//! ```
//!
//! and for Gaussian measurement terms `∂²χ²/∂a∂η = −∂²χ²/∂a²`. The fitted
//! covariance is then `Cov_a = (∂a/∂η) Cov_η (∂a/∂η)ᵀ`, with `M` assembled
//! without the `λ · ∂²g` terms.

use nalgebra::DMatrix;
use tracing::trace;

use crate::problem::FitProblem;

use super::assemble::{add_object_curvature, calc_m};
use super::index::GlobalIndex;
use super::linsolve::{invert, SolveError};
use super::workspace::Workspace;

/// Block-diagonal measurement covariance in global numbering (`npar × npar`).
fn measurement_cov(index: &GlobalIndex, problem: &FitProblem) -> DMatrix<f64> {
    let npar = index.npar();
    let mut cov = DMatrix::zeros(npar, npar);
    for (id, obj) in problem.objects().iter() {
        let globals = index.object_params(id);
        for (i, gi) in globals.iter().enumerate() {
            let Some(gi) = *gi else { continue };
            for (j, gj) in globals.iter().enumerate() {
                let Some(gj) = *gj else { continue };
                cov[(gi, gj)] = obj.measurement_cov(i, j);
            }
        }
    }
    cov
}

/// Propagate the measurement covariance through the KKT system at the current
/// solution. Overwrites `ws.m`/`ws.mscal` and returns the `npar × npar`
/// covariance in global numbering.
pub(crate) fn propagate(
    index: &GlobalIndex,
    problem: &FitProblem,
    ws: &mut Workspace,
) -> Result<DMatrix<f64>, SolveError> {
    let npar = index.npar();
    let idim = index.idim();

    calc_m(index, problem, &ws.x, &ws.perr, &mut ws.m, &mut ws.mscal, true);

    // M⁻¹ = P · Mscal⁻¹ · P, better conditioned than inverting M directly
    let mut minv = invert(&ws.mscal)?;
    for j in 0..idim {
        for i in 0..idim {
            minv[(i, j)] *= ws.perr[i] * ws.perr[j];
        }
    }

    let mut curvature = DMatrix::zeros(idim, idim);
    add_object_curvature(index, problem, &mut curvature);
    let dchi2_deta = -curvature.columns(0, npar).into_owned();

    let dadeta = -(minv.rows(0, npar) * dchi2_deta);
    let cov_eta = measurement_cov(index, problem);
    let mut cov = &dadeta * cov_eta * dadeta.transpose();

    for i in 0..npar {
        for j in (i + 1)..npar {
            cov[(j, i)] = cov[(i, j)];
        }
    }
    if cov.iter().any(|v| !v.is_finite()) {
        return Err(SolveError::NonFinite);
    }
    trace!(%cov, "fitted covariance");
    Ok(cov)
}

/// Copy the global covariance into each object's local storage.
pub(crate) fn write_back(index: &GlobalIndex, problem: &mut FitProblem, cov: &DMatrix<f64>) {
    for (id, obj) in problem.objects.iter_mut() {
        let globals = index.object_params(id);
        for (i, gi) in globals.iter().enumerate() {
            let Some(gi) = *gi else { continue };
            for (j, gj) in globals.iter().enumerate().skip(i) {
                let Some(gj) = *gj else { continue };
                obj.set_cov(i, j, cov[(gi, gj)]);
            }
        }
    }
}
