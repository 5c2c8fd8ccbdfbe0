//! Parametrized fit objects.
//!
//! A fit object is a small parameter vector (a particle's four-momentum, a jet's
//! energy and angles, a track's helix parameters, ...) together with the
//! measurement it was derived from. The fitter only talks to objects through the
//! [`FitObject`] trait: it reads parameter values, errors and chi-square
//! derivatives in *local* parameter numbering, and writes fitted values and
//! covariances back the same way.
//!
//! # Supported objects
//!
//! - [`MeasuredObject`] — named parameters, each measured with a Gaussian error,
//!   unmeasured (free) or fixed. With [`MeasuredObject::four_vector`] the
//!   parameters follow the `[E, px, py, pz]` layout used by the kinematic
//!   constraints in [`crate::constraints`].

pub mod measured;

use std::fmt;

pub use measured::{MeasuredObject, ParamKind};

/// Local index of the energy in the four-vector layout.
pub const E: usize = 0;
/// Local index of the x momentum in the four-vector layout.
pub const PX: usize = 1;
/// Local index of the y momentum in the four-vector layout.
pub const PY: usize = 2;
/// Local index of the z momentum in the four-vector layout.
pub const PZ: usize = 3;

/// Interface between the fitter and a parametrized physical object.
///
/// All indices are local (`0..n_params()`). Chi-square derivatives are the
/// object's own contribution to the global chi-square; the fitter places them at
/// the global indices it assigned, so an implementation never sees the global
/// system.
pub trait FitObject: fmt::Debug {
    fn name(&self) -> &str;

    fn n_params(&self) -> usize;

    fn param_name(&self, ilocal: usize) -> &str;

    /// Current (fitted) value.
    fn param(&self, ilocal: usize) -> f64;

    /// Nominal measured value.
    fn measured_param(&self, ilocal: usize) -> f64;

    /// Measurement uncertainty (one standard deviation).
    fn error(&self, ilocal: usize) -> f64;

    fn is_fixed(&self, ilocal: usize) -> bool;

    fn is_measured(&self, ilocal: usize) -> bool;

    /// Set a parameter from the global vector.
    ///
    /// Returns `true` if the change is significant compared to the parameter's
    /// error. Fixed parameters must be left untouched.
    fn set_param(&mut self, ilocal: usize, value: f64) -> bool;

    /// Chi-square of this object at the current parameter values.
    fn chi2(&self) -> f64;

    /// `dχ²/da_i`.
    fn chi2_first_der(&self, ilocal: usize) -> f64;

    /// `d²χ²/da_i da_j`.
    fn chi2_second_der(&self, ilocal: usize, jlocal: usize) -> f64;

    /// Element of the measurement covariance matrix. Zero for unmeasured or
    /// fixed parameters.
    fn measurement_cov(&self, ilocal: usize, jlocal: usize) -> f64;

    /// Element of the fitted covariance matrix.
    fn cov(&self, ilocal: usize, jlocal: usize) -> f64;

    /// Store a fitted covariance element; implementations keep the matrix
    /// symmetric.
    fn set_cov(&mut self, ilocal: usize, jlocal: usize, value: f64);

    /// Restore the pre-fit state. Default is a no-op.
    fn reset(&mut self) {}

    /// Check the object is usable in a fit.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
