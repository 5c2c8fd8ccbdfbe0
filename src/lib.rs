//! # kinfit
//!
//! Constrained least-squares **kinematic fitting** in Rust.
//!
//! Given a set of measured physical objects (four-vectors of jets and leptons,
//! or any other small parameter vectors with Gaussian errors) and equality
//! constraints between them (energy and momentum conservation, known
//! invariant masses, ...), `kinfit` finds the parameter values closest to the
//! measurements in the chi-square sense that satisfy every constraint exactly,
//! and propagates the measurement errors into a covariance of the fitted
//! parameters.
//!
//! ## Features
//!
//! - **Lagrange-multiplier Newton-Raphson** on the full KKT system, with
//!   per-parameter error scaling
//! - **Robust steps** — LU solve with a rank-truncated eigen-decomposition
//!   fallback for singular or degenerate constraint sets
//! - **Globalized** — backtracking line search on the norm of the scaled
//!   gradient, with quadratic and cubic step estimates
//! - **Soft constraints** — Gaussian penalty terms, e.g. a resonance mass with a
//!   finite width
//! - **Unmeasured parameters** — e.g. an undetected neutrino, solved for by the
//!   constraints
//! - **Fitted covariance** via the implicit function theorem, written back into
//!   each object
//!
//! ## Example
//!
//! ```
//! use kinfit::{
//!     objects, FitProblem, LinearConstraint, MassConstraint, MeasuredObject, NewtonFitter,
//! };
//!
//! let mut problem = FitProblem::new();
//! let j1 = problem
//!     .add_object(MeasuredObject::four_vector(
//!         "j1",
//!         [48.0, 30.0, 10.0, 30.0],
//!         [4.0, 2.0, 2.0, 2.0],
//!     ))
//!     .unwrap();
//! let j2 = problem
//!     .add_object(MeasuredObject::four_vector(
//!         "j2",
//!         [52.0, -28.0, -12.0, -36.0],
//!         [4.0, 2.0, 2.0, 2.0],
//!     ))
//!     .unwrap();
//!
//! // back-to-back in the transverse plane, with the invariant mass of a Z boson
//! problem
//!     .add_constraint(LinearConstraint::component_sum("px", &[j1, j2], objects::PX, 0.0))
//!     .unwrap();
//! problem
//!     .add_constraint(LinearConstraint::component_sum("py", &[j1, j2], objects::PY, 0.0))
//!     .unwrap();
//! problem.add_constraint(MassConstraint::new("mZ", &[j1, j2], 91.19)).unwrap();
//!
//! let mut fitter = NewtonFitter::new();
//! let probability = fitter.fit(&mut problem);
//! assert_eq!(fitter.error_code(), 0);
//! println!("chi2 = {:.3}, dof = {}, P = {probability:.3}", fitter.chi2(), fitter.dof());
//!
//! let cov = fitter.covariance().unwrap();
//! println!("fitted covariance:\n{cov}");
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Indexing** — every free object parameter and every hard constraint's
//!    Lagrange multiplier get a slot in the global vector `x`
//! 2. **Assembly** — the KKT matrix `M = ∇²L` and gradient `y = ∇L` of the
//!    Lagrangian `L = χ² + Σ λₖ gₖ` are accumulated from per-object and
//!    per-constraint derivatives, then scaled by the parameter errors
//! 3. **Newton step** — `M · dx = y` is solved with LU; if the matrix is singular
//!    or the line search cannot make progress along the LU direction, the system
//!    is solved in the span of its largest eigenvectors, dropping directions
//!    until a useful step is found
//! 4. **Line search** — the step length minimises `½ |yscal|²` along `−dx`
//! 5. **Convergence** — stop when both `χ²` and the merit have settled; then
//!    propagate the measurement covariance through `M⁻¹`
//!
//! ## Logging
//!
//! The crate logs through [`tracing`]: warnings for under-determined systems,
//! rank deficiency and failed covariance propagation; fit summaries and
//! per-iteration progress at `debug` level, gated by
//! [`NewtonFitter::set_debug`]; matrix dumps at `trace` level.

pub mod constraints;
pub mod fitter;
pub mod objects;
pub mod problem;
pub mod tracer;

pub use constraints::{
    HardConstraint, LinearConstraint, MassConstraint, SoftConstraint, SoftLinearConstraint,
    SoftMassConstraint,
};
pub use fitter::{
    FitError, FitState, FitStats, GlobalIndex, NewtonFitter, NewtonFitterConfig, SolveError,
    StepInfo,
};
pub use objects::{FitObject, MeasuredObject, ParamKind};
pub use problem::{FitProblem, ObjectId, ObjectStore, ParamRef};
pub use tracer::{FitTracer, RecordingTracer, TraceEvent, TraceHistory, TraceRecord};
