//! Constrained Newton-Raphson fitter.
//!
//! [`NewtonFitter`] minimises the total chi-square of a [`FitProblem`] subject to
//! its hard constraints by solving the KKT conditions of the Lagrangian with a
//! damped Newton iteration:
//!
//! 1. number the free parameters and multipliers ([`GlobalIndex`]),
//! 2. per iteration, assemble the scaled KKT matrix and gradient,
//! 3. solve for the Newton direction with LU, falling back to a truncated
//!    eigen-decomposition when the system is singular or the LU step is useless,
//! 4. pick a step length with a backtracking line search on the merit
//!    `½ |yscal|²`,
//! 5. on convergence, propagate the measurement covariance to the fitted
//!    parameters.

mod assemble;
mod covariance;
pub mod index;
pub mod line_search;
pub mod linsolve;
mod workspace;

use std::fmt;

use anyhow::ensure;
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::problem::{FitProblem, ObjectId, ParamRef};
use crate::tracer::FitTracer;

use assemble::{calc_m, calc_y, fill_params, fill_perr, update_params};
use line_search::{merit, optimize_scale, BestPoint};
use workspace::Workspace;

pub use index::GlobalIndex;
pub use linsolve::{SolveError, SpectralSystem};

// ── Configuration ───────────────────────────────────────────────────────────

/// Tolerances and limits of the Newton iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct NewtonFitterConfig {
    /// Fit fails with error code 1 once this many iterations are exceeded.
    pub max_iterations: usize,
    /// Convergence requires `|Δχ²|` below this.
    pub chi2_tolerance: f64,
    /// Convergence requires the best merit below this.
    pub merit_tolerance: f64,
    /// A best merit below this counts as converged without the relative test.
    pub merit_floor: f64,
    /// Otherwise the merit must have changed by less than this fraction of itself.
    pub merit_relative_change: f64,
    /// Cap on `max|dxscal|` for a single step.
    pub max_step: f64,
    /// Sufficient-decrease constant of the line search.
    pub armijo_alpha: f64,
    pub max_line_search_trials: usize,
    /// The line search stops once the scale drops to this value.
    pub min_line_search_scale: f64,
    /// A best scale below this sends the step to the spectral solver, and keeps
    /// the spectral solver dropping eigenvectors.
    pub spectral_min_scale: f64,
    /// Iteration limit of the eigen-decomposition; 0 means unlimited.
    pub eigen_max_iterations: usize,
}

impl Default for NewtonFitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            chi2_tolerance: 1e-3,
            merit_tolerance: 1e-3,
            merit_floor: 1e-6,
            merit_relative_change: 0.2,
            max_step: 5.0,
            armijo_alpha: 1e-4,
            max_line_search_trials: 10,
            min_line_search_scale: 1e-4,
            spectral_min_scale: 0.01,
            eigen_max_iterations: 0,
        }
    }
}

impl NewtonFitterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_iterations > 0, "max_iterations must be positive");
        ensure!(
            self.chi2_tolerance > 0.0 && self.merit_tolerance > 0.0,
            "convergence tolerances must be positive (chi2 {}, merit {})",
            self.chi2_tolerance,
            self.merit_tolerance
        );
        ensure!(self.merit_floor >= 0.0, "merit_floor must be non-negative");
        ensure!(
            self.merit_relative_change > 0.0,
            "merit_relative_change must be positive"
        );
        ensure!(
            self.max_step > 0.0 && self.max_step.is_finite(),
            "max_step must be positive and finite, got {}",
            self.max_step
        );
        ensure!(
            self.armijo_alpha > 0.0 && self.armijo_alpha < 1.0,
            "armijo_alpha must lie in (0, 1), got {}",
            self.armijo_alpha
        );
        ensure!(
            self.max_line_search_trials > 0,
            "max_line_search_trials must be positive"
        );
        ensure!(
            self.min_line_search_scale > 0.0 && self.min_line_search_scale < 1.0,
            "min_line_search_scale must lie in (0, 1)"
        );
        ensure!(
            (0.0..=1.0).contains(&self.spectral_min_scale),
            "spectral_min_scale must lie in [0, 1]"
        );
        Ok(())
    }
}

// ── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitState {
    /// No fit has been run yet.
    #[default]
    Idle,
    Initializing,
    Iterating,
    Converged,
    Failed,
}

/// Why a fit failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("no convergence after {0} iterations")]
    IterationLimit(usize),

    #[error("step computation failed: {0}")]
    StepFailed(#[from] SolveError),
}

impl FitError {
    /// Numeric error code: 1 for the iteration limit, 2 for a failed step.
    pub fn code(&self) -> i32 {
        match self {
            FitError::IterationLimit(_) => 1,
            FitError::StepFailed(_) => 2,
        }
    }
}

/// Summary of the last accepted step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    pub iteration: usize,
    pub chi2_old: f64,
    pub chi2: f64,
    /// Merit at the start of the iteration.
    pub start_merit: f64,
    /// Merit of the accepted point.
    pub best_merit: f64,
    pub scale: f64,
    pub step: f64,
    pub spectral: bool,
    /// Number of eigenvectors kept, for spectral steps.
    pub rank: Option<usize>,
}

/// Counters for one fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FitStats {
    pub direct_solves: usize,
    pub spectral_fallbacks: usize,
    pub line_search_trials: usize,
}

struct StepOutcome {
    best: BestPoint,
    spectral: bool,
    rank: Option<usize>,
}

// ── Fitter ──────────────────────────────────────────────────────────────────

/// Lagrange-multiplier Newton-Raphson kinematic fitter.
///
/// The fitter keeps its workspace between fits; it is only reallocated when the
/// dimension of the system changes.
pub struct NewtonFitter {
    config: NewtonFitterConfig,
    debug: u32,
    state: FitState,
    index: GlobalIndex,
    ws: Workspace,
    chi2: f64,
    probability: f64,
    iterations: usize,
    error: Option<FitError>,
    covariance: Option<DMatrix<f64>>,
    last_step: Option<StepInfo>,
    stats: FitStats,
    tracer: Option<Box<dyn FitTracer>>,
}

impl fmt::Debug for NewtonFitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewtonFitter")
            .field("config", &self.config)
            .field("debug", &self.debug)
            .field("state", &self.state)
            .field("chi2", &self.chi2)
            .field("probability", &self.probability)
            .field("iterations", &self.iterations)
            .field("error", &self.error)
            .field("stats", &self.stats)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

impl Default for NewtonFitter {
    fn default() -> Self {
        Self::new()
    }
}

impl NewtonFitter {
    pub fn new() -> Self {
        Self {
            config: NewtonFitterConfig::default(),
            debug: 0,
            state: FitState::Idle,
            index: GlobalIndex::default(),
            ws: Workspace::default(),
            chi2: 0.0,
            probability: -1.0,
            iterations: 0,
            error: None,
            covariance: None,
            last_step: None,
            stats: FitStats::default(),
            tracer: None,
        }
    }

    /// Fitter with non-default tolerances; fails if the configuration is
    /// inconsistent.
    pub fn with_config(config: NewtonFitterConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    pub fn config(&self) -> &NewtonFitterConfig {
        &self.config
    }

    /// Diagnostic verbosity: 0 warnings only, 1 fit summary, 2 per-iteration
    /// progress, 3 and above also object listings and matrix dumps.
    pub fn set_debug(&mut self, level: u32) {
        self.debug = level;
    }

    pub fn debug_level(&self) -> u32 {
        self.debug
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn FitTracer>) {
        self.tracer = Some(tracer);
    }

    pub fn take_tracer(&mut self) -> Option<Box<dyn FitTracer>> {
        self.tracer.take()
    }

    /// Run the fit.
    ///
    /// Fitted values and, on success, covariances are written back into the
    /// objects of `problem`. Returns the fit probability, or −1 if the fit
    /// failed or has no degrees of freedom.
    pub fn fit(&mut self, problem: &mut FitProblem) -> f64 {
        let mut tracer = self.tracer.take();
        self.run(problem, &mut tracer);
        self.tracer = tracer;
        self.probability
    }

    fn run(&mut self, problem: &mut FitProblem, tracer: &mut Option<Box<dyn FitTracer>>) {
        self.initialize(problem);
        if let Some(t) = tracer.as_mut() {
            t.initialize(self, problem);
        }

        if self.index.idim() == 0 {
            self.state = FitState::Converged;
        } else {
            self.state = FitState::Iterating;
        }

        while self.state == FitState::Iterating {
            match self.iterate(problem) {
                Ok(converged) => {
                    // the cap is checked first: a fit that only settles past it fails
                    if self.iterations > self.config.max_iterations {
                        warn!(iterations = self.iterations, "fit did not converge");
                        self.fail(FitError::IterationLimit(self.iterations));
                    } else if converged {
                        self.state = FitState::Converged;
                    }
                }
                Err(e) => {
                    warn!(iteration = self.iterations, "{e}");
                    // leave the objects at the last accepted point
                    update_params(&self.index, problem, &self.ws.xold);
                    self.chi2 = problem.chi2();
                    self.fail(FitError::StepFailed(e));
                    break;
                }
            }
            if let Some(t) = tracer.as_mut() {
                t.step(self, problem);
            }
        }

        if self.state == FitState::Converged {
            self.finalize_covariance(problem);
        }
        self.probability = self.fit_probability();

        if self.debug > 0 {
            debug!(
                state = ?self.state,
                chi2 = self.chi2,
                dof = self.dof(),
                probability = self.probability,
                iterations = self.iterations,
                direct_solves = self.stats.direct_solves,
                spectral_fallbacks = self.stats.spectral_fallbacks,
                "fit finished"
            );
        }
        if let Some(t) = tracer.as_mut() {
            t.finish(self, problem);
        }
    }

    fn initialize(&mut self, problem: &FitProblem) {
        self.state = FitState::Initializing;
        self.iterations = 0;
        self.error = None;
        self.covariance = None;
        self.last_step = None;
        self.stats = FitStats::default();
        self.probability = -1.0;

        self.index = GlobalIndex::assign(problem);
        if self.index.is_underdetermined() {
            warn!(
                unmeasured = self.index.nunm(),
                constraints = self.index.ncon(),
                soft = self.index.nsoft(),
                "system is under-determined: more unmeasured parameters than constraints"
            );
        }

        self.ws.prepare(self.index.idim());
        fill_params(&self.index, problem, &mut self.ws.x);
        self.chi2 = problem.chi2();

        if self.debug > 0 {
            debug!(
                npar = self.index.npar(),
                ncon = self.index.ncon(),
                nsoft = self.index.nsoft(),
                nunm = self.index.nunm(),
                chi2 = self.chi2,
                "starting fit"
            );
        }
        if self.debug > 2 {
            log_problem(problem);
        }
    }

    fn fail(&mut self, error: FitError) {
        self.state = FitState::Failed;
        self.error = Some(error);
        self.covariance = None;
    }

    /// One Newton iteration. Returns whether the fit has converged.
    fn iterate(&mut self, problem: &mut FitProblem) -> Result<bool, SolveError> {
        let chi2_old = self.chi2;

        self.ws.xold.copy_from(&self.ws.x);
        fill_perr(&self.index, problem, &mut self.ws.perr);
        let ws = &mut self.ws;
        calc_m(&self.index, problem, &ws.x, &ws.perr, &mut ws.m, &mut ws.mscal, false);
        calc_y(&self.index, problem, &ws.x, &ws.perr, &mut ws.y, &mut ws.yscal);
        if self.debug > 2 {
            trace!(m = %ws.m, y = %ws.y, perr = %ws.perr, "assembled system");
        }

        let f0 = merit(&ws.yscal);
        let start = BestPoint::start(&ws.xold, chi2_old, f0);
        let outcome = self.compute_step(problem, start)?;

        let best = outcome.best;
        self.ws.x.copy_from(&best.x);
        update_params(&self.index, problem, &self.ws.x);
        let ws = &mut self.ws;
        calc_y(&self.index, problem, &ws.x, &ws.perr, &mut ws.y, &mut ws.yscal);
        self.chi2 = problem.chi2();
        self.iterations += 1;

        let config = &self.config;
        let converged = (self.chi2 - chi2_old).abs() < config.chi2_tolerance
            && best.fval < config.merit_tolerance
            && (best.fval < config.merit_floor
                || (f0 - best.fval).abs() < config.merit_relative_change * best.fval);

        if self.debug > 1 {
            debug!(
                iteration = self.iterations,
                chi2_old,
                chi2 = self.chi2,
                f0,
                fbest = best.fval,
                scale = best.scale,
                spectral = outcome.spectral,
                converged,
                "iteration"
            );
        }

        self.last_step = Some(StepInfo {
            iteration: self.iterations,
            chi2_old,
            chi2: self.chi2,
            start_merit: f0,
            best_merit: best.fval,
            scale: best.scale,
            step: best.step,
            spectral: outcome.spectral,
            rank: outcome.rank,
        });
        Ok(converged)
    }

    /// Newton direction plus line search: LU first, the spectral solver if LU
    /// fails or only a tiny step could be taken along its direction.
    fn compute_step(
        &mut self,
        problem: &mut FitProblem,
        start: BestPoint,
    ) -> Result<StepOutcome, SolveError> {
        let min_scale = self.config.spectral_min_scale;
        let mut best = start;

        self.stats.direct_solves += 1;
        match linsolve::solve_direct(&self.ws.mscal, &self.ws.yscal) {
            Ok(dxscal) => {
                self.set_direction(dxscal);
                let search = optimize_scale(&self.index, problem, &mut self.ws, &self.config, best);
                self.stats.line_search_trials += search.trials;
                best = search.best;
                if best.scale >= min_scale {
                    return Ok(StepOutcome {
                        best,
                        spectral: false,
                        rank: None,
                    });
                }
                if self.debug > 1 {
                    debug!(scale = best.scale, "direct step too short, trying spectral solve");
                }
                // the line search left y at its last trial point
                let ws = &mut self.ws;
                ws.x.copy_from(&ws.xold);
                update_params(&self.index, problem, &ws.x);
                calc_y(&self.index, problem, &ws.x, &ws.perr, &mut ws.y, &mut ws.yscal);
            }
            Err(e) => {
                if self.debug > 0 {
                    debug!("direct solve failed ({e}), trying spectral solve");
                }
            }
        }

        self.stats.spectral_fallbacks += 1;
        let spectral = SpectralSystem::new(
            &self.ws.mscal,
            &self.ws.yscal,
            self.config.eigen_max_iterations,
        )?;
        let idim = spectral.dim();
        let mut k = spectral.rank();
        if k < idim {
            warn!(rank = k, dim = idim, "KKT matrix is rank deficient");
        }

        loop {
            self.set_direction(spectral.step(k));
            let search = optimize_scale(&self.index, problem, &mut self.ws, &self.config, best);
            self.stats.line_search_trials += search.trials;
            best = search.best;
            if self.debug > 1 {
                debug!(kept = k, scale = best.scale, fval = best.fval, "spectral step");
            }
            if best.scale >= min_scale || k <= 1 {
                break;
            }
            k -= 1;
        }

        Ok(StepOutcome {
            best,
            spectral: true,
            rank: Some(k),
        })
    }

    fn set_direction(&mut self, dxscal: DVector<f64>) {
        self.ws.dx = dxscal.component_mul(&self.ws.perr);
        self.ws.dxscal = dxscal;
    }

    fn finalize_covariance(&mut self, problem: &mut FitProblem) {
        if self.index.npar() == 0 {
            self.covariance = Some(DMatrix::zeros(0, 0));
            return;
        }
        fill_perr(&self.index, problem, &mut self.ws.perr);
        match covariance::propagate(&self.index, problem, &mut self.ws) {
            Ok(cov) => {
                covariance::write_back(&self.index, problem, &cov);
                self.covariance = Some(cov);
            }
            Err(e) => {
                warn!("covariance propagation failed: {e}");
                self.covariance = None;
            }
        }
    }

    fn fit_probability(&self) -> f64 {
        if self.state != FitState::Converged {
            return -1.0;
        }
        let dof = self.dof();
        if dof <= 0 || self.chi2.is_nan() || self.chi2 < 0.0 {
            return -1.0;
        }
        match ChiSquared::new(dof as f64) {
            Ok(dist) => dist.sf(self.chi2),
            Err(_) => -1.0,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// 0 on success, 1 if the iteration limit was hit, 2 if a step failed.
    pub fn error_code(&self) -> i32 {
        self.error.as_ref().map_or(0, FitError::code)
    }

    pub fn last_error(&self) -> Option<&FitError> {
        self.error.as_ref()
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// `ncon + nsoft − nunm`.
    pub fn dof(&self) -> i64 {
        self.index.dof()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn n_par(&self) -> usize {
        self.index.npar()
    }

    pub fn n_con(&self) -> usize {
        self.index.ncon()
    }

    pub fn n_soft(&self) -> usize {
        self.index.nsoft()
    }

    pub fn n_unmeasured(&self) -> usize {
        self.index.nunm()
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Fitted covariance of all free parameters in global numbering; `None`
    /// unless the last fit converged and the propagation succeeded.
    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    pub fn index(&self) -> &GlobalIndex {
        &self.index
    }

    pub fn global_param_index(&self, object: ObjectId, ilocal: usize) -> Option<usize> {
        self.index.param(ParamRef::new(object, ilocal))
    }

    pub fn global_constraint_index(&self, k: usize) -> Option<usize> {
        (k < self.index.ncon()).then(|| self.index.constraint(k))
    }

    /// Lagrange multipliers of the hard constraints at the current point.
    pub fn multipliers(&self) -> &[f64] {
        let npar = self.index.npar().min(self.ws.x.len());
        &self.ws.x.as_slice()[npar..]
    }

    pub fn last_step(&self) -> Option<&StepInfo> {
        self.last_step.as_ref()
    }

    pub fn stats(&self) -> FitStats {
        self.stats
    }

    pub fn spectral_fallbacks(&self) -> usize {
        self.stats.spectral_fallbacks
    }

    /// L1 penalty merit `χ² + μ Σ|gₖ|` at the current parameters.
    pub fn merit_value(&self, problem: &FitProblem, mu: f64) -> f64 {
        let penalty: f64 = problem.constraint_values().iter().map(|g| g.abs()).sum();
        problem.chi2() + mu * penalty
    }
}

fn log_problem(problem: &FitProblem) {
    let objects = problem.objects();
    for (id, obj) in objects.iter() {
        let params: Vec<String> = (0..obj.n_params())
            .map(|i| format!("{}={:.6}", obj.param_name(i), obj.param(i)))
            .collect();
        trace!(object = id.index(), name = obj.name(), chi2 = obj.chi2(), "{}", params.join(" "));
    }
    for (k, c) in problem.constraints().iter().enumerate() {
        trace!(
            constraint = k,
            name = c.name(),
            value = c.value(objects),
            error = c.error(objects),
            "hard constraint"
        );
    }
    for (k, c) in problem.soft_constraints().iter().enumerate() {
        trace!(
            constraint = k,
            name = c.name(),
            value = c.value(objects),
            error = c.error(objects),
            chi2 = c.chi2(objects),
            "soft constraint"
        );
    }
}
