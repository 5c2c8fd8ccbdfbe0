//! Backtracking line search along the Newton direction.
//!
//! The merit function is half the squared norm of the scaled gradient vector,
//! `f(t) = ½ |yscal(x₀ − t·dx)|²`, which vanishes at any stationary point of the
//! Lagrangian. Step-length estimation follows the classic `lnsrch` scheme:
//! a full step first, then a quadratic model, then cubic models through the
//! last two trials, each new scale clamped to `[0.1 t, 0.5 t]`.

use nalgebra::DVector;
use tracing::trace;

use crate::problem::FitProblem;

use super::assemble::{calc_y, update_params};
use super::index::GlobalIndex;
use super::workspace::Workspace;
use super::NewtonFitterConfig;

/// Best point seen so far in the current iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct BestPoint {
    /// Global vector, parameters and multipliers.
    pub x: DVector<f64>,
    pub chi2: f64,
    /// Merit value at `x`.
    pub fval: f64,
    /// Scale factor along the step that produced `x`.
    pub scale: f64,
    /// `scale · max|dxscal|`.
    pub step: f64,
}

impl BestPoint {
    /// The unmoved start point of an iteration.
    pub fn start(x: &DVector<f64>, chi2: f64, fval: f64) -> Self {
        Self {
            x: x.clone(),
            chi2,
            fval,
            scale: 0.0,
            step: 0.0,
        }
    }
}

/// Half squared norm of the scaled gradient vector.
pub fn merit(yscal: &DVector<f64>) -> f64 {
    0.5 * yscal.norm_squared()
}

/// Result of one line search.
#[derive(Debug, Clone)]
pub(crate) struct ScaleSearch {
    pub best: BestPoint,
    pub trials: usize,
}

/// Search along `−dx` starting from `ws.xold`.
///
/// Expects `ws.mscal` assembled at `ws.xold` and `ws.dx`/`ws.dxscal` holding the
/// Newton direction; both direction vectors are shortened in place if
/// `max|dxscal|` exceeds the configured cap. `best` is carried in from earlier
/// attempts of the same iteration and only replaced by a trial with a merit no
/// worse than its own. On return the objects and `ws.x` hold the *last* trial,
/// not the best one.
pub(crate) fn optimize_scale(
    index: &GlobalIndex,
    problem: &mut FitProblem,
    ws: &mut Workspace,
    config: &NewtonFitterConfig,
    mut best: BestPoint,
) -> ScaleSearch {
    ws.x.copy_from(&ws.xold);
    update_params(index, problem, &ws.x);
    calc_y(index, problem, &ws.x, &ws.perr, &mut ws.y, &mut ws.yscal);
    let f0 = merit(&ws.yscal);

    // gradient of the merit function
    ws.mscal.mul_to(&ws.yscal, &mut ws.grad);

    let mut stepsize = ws.dxscal.amax();
    if stepsize > config.max_step {
        let factor = config.max_step / stepsize;
        trace!(factor, "rescaling Newton step");
        ws.dxscal *= factor;
        ws.dx *= factor;
        stepsize = ws.dxscal.amax();
    }
    let slope = -ws.dxscal.dot(&ws.grad);

    let mut scale = 1.0;
    let mut prev_scale = 0.0;
    let mut prev_f = f0;
    let mut trials = 0;

    while trials < config.max_line_search_trials {
        ws.x.copy_from(&ws.xold);
        ws.x.axpy(-scale, &ws.dx, 1.0);
        update_params(index, problem, &ws.x);
        calc_y(index, problem, &ws.x, &ws.perr, &mut ws.y, &mut ws.yscal);
        trials += 1;

        let f = merit(&ws.yscal);
        let chi2 = problem.chi2();
        trace!(trials, scale, f, chi2, "line search trial");

        if f <= best.fval {
            best = BestPoint {
                x: ws.x.clone(),
                chi2,
                fval: f,
                scale,
                step: scale * stepsize,
            };
        }

        if f <= f0 + config.armijo_alpha * scale * slope {
            break;
        }

        let estimate = if trials == 1 {
            -slope / (2.0 * (f - f0 - slope))
        } else {
            cubic_estimate(f0, slope, scale, f, prev_scale, prev_f)
        };
        let estimate = if estimate.is_finite() { estimate } else { 0.5 * scale };

        prev_scale = scale;
        prev_f = f;
        scale = estimate.clamp(0.1 * scale, 0.5 * scale);

        if scale <= config.min_line_search_scale {
            break;
        }
    }

    ScaleSearch { best, trials }
}

/// Minimiser of the cubic through `f(0)`, `f'(0)` and the last two trials.
fn cubic_estimate(f0: f64, slope: f64, t1: f64, f1: f64, t2: f64, f2: f64) -> f64 {
    let rhs1 = f1 - f0 - t1 * slope;
    let rhs2 = f2 - f0 - t2 * slope;
    let a = (rhs1 / (t1 * t1) - rhs2 / (t2 * t2)) / (t1 - t2);
    let b = (-t2 * rhs1 / (t1 * t1) + t1 * rhs2 / (t2 * t2)) / (t1 - t2);
    if a == 0.0 {
        return -slope / (2.0 * b);
    }
    let disc = b * b - 3.0 * a * slope;
    if disc < 0.0 {
        0.5 * t1
    } else if b <= 0.0 {
        (-b + disc.sqrt()) / (3.0 * a)
    } else {
        -slope / (b + disc.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::LinearConstraint;
    use crate::fitter::assemble::{calc_m, fill_params, fill_perr};
    use crate::fitter::linsolve::solve_direct;
    use crate::objects::MeasuredObject;
    use crate::problem::ParamRef;

    fn setup(target: f64) -> (FitProblem, GlobalIndex, Workspace) {
        let mut problem = FitProblem::new();
        let a = problem
            .add_object(MeasuredObject::new("a").with_measured("x", 1.0, 1.0))
            .unwrap();
        let b = problem
            .add_object(MeasuredObject::new("b").with_measured("x", 1.0, 1.0))
            .unwrap();
        problem
            .add_constraint(
                LinearConstraint::new("sum", target)
                    .with_term(ParamRef::new(a, 0), 1.0)
                    .with_term(ParamRef::new(b, 0), 1.0),
            )
            .unwrap();
        let index = GlobalIndex::assign(&problem);
        let mut ws = Workspace::new(index.idim());
        fill_params(&index, &problem, &mut ws.x);
        ws.xold.copy_from(&ws.x);
        fill_perr(&index, &problem, &mut ws.perr);
        calc_m(&index, &problem, &ws.x, &ws.perr, &mut ws.m, &mut ws.mscal, false);
        calc_y(&index, &problem, &ws.x, &ws.perr, &mut ws.y, &mut ws.yscal);
        (problem, index, ws)
    }

    #[test]
    fn test_full_newton_step_accepted() {
        let (mut problem, index, mut ws) = setup(0.0);
        let f0 = merit(&ws.yscal);
        ws.dxscal = solve_direct(&ws.mscal, &ws.yscal).unwrap();
        ws.dx = ws.dxscal.component_mul(&ws.perr);
        let start = BestPoint::start(&ws.xold, problem.chi2(), f0);
        let config = NewtonFitterConfig::default();
        let search = optimize_scale(&index, &mut problem, &mut ws, &config, start);

        // linear problem: one full step solves it exactly
        assert_eq!(search.trials, 1);
        assert_eq!(search.best.scale, 1.0);
        assert!(search.best.fval < 1e-20);
        assert!(search.best.x[0].abs() < 1e-12);
        assert!(search.best.x[1].abs() < 1e-12);
        assert!((search.best.chi2 - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_best_never_worse_than_start() {
        let (mut problem, index, mut ws) = setup(0.0);
        let f0 = merit(&ws.yscal);
        // deliberately bad direction: uphill
        ws.dxscal = -solve_direct(&ws.mscal, &ws.yscal).unwrap();
        ws.dx = ws.dxscal.component_mul(&ws.perr);
        let start = BestPoint::start(&ws.xold, problem.chi2(), f0);
        let config = NewtonFitterConfig::default();
        let search = optimize_scale(&index, &mut problem, &mut ws, &config, start.clone());
        assert!(search.best.fval <= f0);
        assert!(search.trials <= config.max_line_search_trials);
        assert!(search.trials > 1);
    }

    #[test]
    fn test_step_is_capped() {
        let (mut problem, index, mut ws) = setup(100.0);
        let f0 = merit(&ws.yscal);
        ws.dxscal = solve_direct(&ws.mscal, &ws.yscal).unwrap();
        ws.dx = ws.dxscal.component_mul(&ws.perr);
        assert!(ws.dxscal.amax() > 5.0);
        let start = BestPoint::start(&ws.xold, problem.chi2(), f0);
        let config = NewtonFitterConfig::default();
        let search = optimize_scale(&index, &mut problem, &mut ws, &config, start);
        assert!((ws.dxscal.amax() - config.max_step).abs() < 1e-12);
        assert!((&ws.dx - ws.dxscal.component_mul(&ws.perr)).amax() < 1e-12);
        assert!(search.best.fval < f0);
    }

    #[test]
    fn test_cubic_estimate_is_minimum() {
        // f(t) = f0 + slope t + c t^2 + d t^3 is reproduced exactly by the cubic model
        let (f0, slope, c, d) = (1.0, -2.0, 0.5, 0.8);
        let f = |t: f64| f0 + slope * t + c * t * t + d * t * t * t;
        let t = cubic_estimate(f0, slope, 0.5, f(0.5), 1.0, f(1.0));
        let df = slope + 2.0 * c * t + 3.0 * d * t * t;
        assert!(df.abs() < 1e-12, "derivative at estimate: {df}");
    }
}
