//! Assembly of the KKT system.
//!
//! The fitter solves the stationarity conditions of the Lagrangian
//! `L(a, λ) = χ²(a) + Σₖ λₖ gₖ(a)` with Newton's method:
//!
//! ```text
//!  y = ∇L  = [ ∂χ²/∂a + Σ λₖ ∂gₖ/∂a ;  g(a) ]
//!  M = ∇²L = [ ∂²χ²/∂a² + Σ λₖ ∂²gₖ/∂a²   (∂g/∂a)ᵀ ]
//!            [ ∂g/∂a                      0        ]
//! ```
//!
//! Collaborators report derivatives in local numbering; every contribution is
//! scattered here through the [`GlobalIndex`], so an object or constraint can
//! only ever touch the rows and columns of its own parameters.
//!
//! Both `M` and `y` are rescaled by the per-slot error vector `perr` before
//! solving: `Mscal = P M P`, `yscal = P y` with `P = diag(perr)`.

use nalgebra::{DMatrix, DVector};

use crate::problem::FitProblem;

use super::index::GlobalIndex;

/// Copy the current object parameter values into the parameter part of `x`.
/// Multiplier slots are left untouched.
pub(crate) fn fill_params(index: &GlobalIndex, problem: &FitProblem, x: &mut DVector<f64>) {
    debug_assert_eq!(x.len(), index.idim());
    for (id, obj) in problem.objects().iter() {
        for (ilocal, g) in index.object_params(id).iter().enumerate() {
            if let Some(g) = *g {
                x[g] = obj.param(ilocal);
            }
        }
    }
}

/// Push the parameter part of `x` into the objects.
///
/// Returns `true` if any object reported a significant change.
pub(crate) fn update_params(
    index: &GlobalIndex,
    problem: &mut FitProblem,
    x: &DVector<f64>,
) -> bool {
    debug_assert_eq!(x.len(), index.idim());
    let mut significant = false;
    for (id, obj) in problem.objects.iter_mut() {
        for (ilocal, g) in index.object_params(id).iter().enumerate() {
            if let Some(g) = *g {
                significant |= obj.set_param(ilocal, x[g]);
            }
        }
    }
    significant
}

/// Scale vector: `|σ|` (or 1) per parameter, `1/σ_g` (or 1) per multiplier.
pub(crate) fn fill_perr(index: &GlobalIndex, problem: &FitProblem, perr: &mut DVector<f64>) {
    debug_assert_eq!(perr.len(), index.idim());
    perr.fill(1.0);
    for (id, obj) in problem.objects().iter() {
        for (ilocal, g) in index.object_params(id).iter().enumerate() {
            if let Some(g) = *g {
                let e = obj.error(ilocal).abs();
                perr[g] = if e > 0.0 && e.is_finite() { e } else { 1.0 };
            }
        }
    }
    for (k, c) in problem.constraints().iter().enumerate() {
        let e = c.error(problem.objects());
        perr[index.constraint(k)] = if e > 0.0 && e.is_finite() { 1.0 / e } else { 1.0 };
    }
}

/// Second-derivative contributions of the objects alone (`∂²χ²/∂a²`), added
/// into `m`.
pub(crate) fn add_object_curvature(
    index: &GlobalIndex,
    problem: &FitProblem,
    m: &mut DMatrix<f64>,
) {
    for (id, obj) in problem.objects().iter() {
        let globals = index.object_params(id);
        for (i, gi) in globals.iter().enumerate() {
            let Some(gi) = *gi else { continue };
            for (j, gj) in globals.iter().enumerate() {
                let Some(gj) = *gj else { continue };
                m[(gi, gj)] += obj.chi2_second_der(i, j);
            }
        }
    }
}

/// Assemble `M` and `Mscal`.
///
/// With `error_propagation` the `λ · ∂²g/∂a²` terms are left out: the
/// implicit-function derivation of the fitted covariance does not contain them.
pub(crate) fn calc_m(
    index: &GlobalIndex,
    problem: &FitProblem,
    x: &DVector<f64>,
    perr: &DVector<f64>,
    m: &mut DMatrix<f64>,
    mscal: &mut DMatrix<f64>,
    error_propagation: bool,
) {
    let idim = index.idim();
    debug_assert!(m.nrows() == idim && m.ncols() == idim);
    debug_assert!(mscal.nrows() == idim && mscal.ncols() == idim);

    m.fill(0.0);
    add_object_curvature(index, problem, m);

    let objects = problem.objects();
    for (k, c) in problem.constraints().iter().enumerate() {
        let kglobal = index.constraint(k);
        for (p, d) in c.first_derivatives(objects) {
            if let Some(g) = index.param(p) {
                m[(kglobal, g)] += d;
                m[(g, kglobal)] += d;
            }
        }
        if !error_propagation {
            let lambda = x[kglobal];
            for (p, q, d) in c.second_derivatives(objects) {
                if let (Some(gp), Some(gq)) = (index.param(p), index.param(q)) {
                    m[(gp, gq)] += lambda * d;
                }
            }
        }
    }

    for c in problem.soft_constraints() {
        for (p, q, d) in c.chi2_second_derivatives(objects) {
            if let (Some(gp), Some(gq)) = (index.param(p), index.param(q)) {
                m[(gp, gq)] += d;
            }
        }
    }

    for j in 0..idim {
        for i in 0..idim {
            mscal[(i, j)] = perr[i] * perr[j] * m[(i, j)];
        }
    }
}

/// Assemble `y` and `yscal`.
pub(crate) fn calc_y(
    index: &GlobalIndex,
    problem: &FitProblem,
    x: &DVector<f64>,
    perr: &DVector<f64>,
    y: &mut DVector<f64>,
    yscal: &mut DVector<f64>,
) {
    debug_assert_eq!(y.len(), index.idim());
    y.fill(0.0);

    for (id, obj) in problem.objects().iter() {
        for (ilocal, g) in index.object_params(id).iter().enumerate() {
            if let Some(g) = *g {
                y[g] += obj.chi2_first_der(ilocal);
            }
        }
    }

    let objects = problem.objects();
    for (k, c) in problem.constraints().iter().enumerate() {
        let kglobal = index.constraint(k);
        let lambda = x[kglobal];
        for (p, d) in c.first_derivatives(objects) {
            if let Some(g) = index.param(p) {
                y[g] += lambda * d;
            }
        }
        y[kglobal] = c.value(objects);
    }

    for c in problem.soft_constraints() {
        for (p, d) in c.chi2_first_derivatives(objects) {
            if let Some(g) = index.param(p) {
                y[g] += d;
            }
        }
    }

    yscal.copy_from(y);
    yscal.component_mul_assign(perr);
}
