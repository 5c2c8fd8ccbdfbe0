//! Hard and soft constraints between fit objects.
//!
//! A **hard** constraint `g(a) = 0` must hold exactly at the solution and is
//! enforced with a Lagrange multiplier. A **soft** constraint adds a penalty
//! term to the chi-square instead and owns no multiplier.
//!
//! Constraints report derivatives in terms of [`ParamRef`]s (object id + local
//! parameter index). Derivatives with respect to fixed parameters may be
//! reported; the fitter ignores them.
//!
//! # Supported constraints
//!
//! - [`LinearConstraint`] — `Σ cₖ aₖ − target`, e.g. momentum or energy sums
//! - [`MassConstraint`] — invariant mass of a set of four-vectors
//! - [`SoftLinearConstraint`] — Gaussian penalty on a linear combination
//! - [`SoftMassConstraint`] — Gaussian penalty on an invariant mass (e.g. a
//!   resonance with a finite width)

pub mod linear;
pub mod mass;

use std::fmt;

use anyhow::ensure;

use crate::problem::{ObjectId, ObjectStore, ParamRef};

pub use linear::{LinearConstraint, SoftLinearConstraint};
pub use mass::{MassConstraint, SoftMassConstraint};

/// Sparse first derivatives: `(parameter, ∂/∂parameter)`.
pub type Gradient = Vec<(ParamRef, f64)>;

/// Sparse second derivatives: `(p, q, ∂²/∂p∂q)`. Every ordered pair is listed
/// once, so a symmetric off-diagonal term appears as both `(p, q)` and `(q, p)`.
pub type Hessian = Vec<(ParamRef, ParamRef, f64)>;

/// An equality constraint `g(a) = 0`.
pub trait HardConstraint: fmt::Debug {
    fn name(&self) -> &str;

    /// Objects whose parameters enter the constraint.
    fn object_ids(&self) -> &[ObjectId];

    /// Every parameter the constraint reads.
    fn params(&self) -> Vec<ParamRef>;

    /// Reject constraint settings that cannot produce a finite fit.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `g(a)` at the current parameter values.
    fn value(&self, objects: &ObjectStore) -> f64;

    /// `∂g/∂a`.
    fn first_derivatives(&self, objects: &ObjectStore) -> Gradient;

    /// `∂²g/∂a∂a`. Empty for linear constraints.
    fn second_derivatives(&self, objects: &ObjectStore) -> Hessian;

    /// Uncertainty of `g` propagated from the object errors.
    fn error(&self, objects: &ObjectStore) -> f64 {
        propagated_error(&self.first_derivatives(objects), objects)
    }
}

/// A penalty term added to the chi-square.
pub trait SoftConstraint: fmt::Debug {
    fn name(&self) -> &str;

    fn object_ids(&self) -> &[ObjectId];

    /// Every parameter the constraint reads.
    fn params(&self) -> Vec<ParamRef>;

    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The constrained quantity at the current parameter values.
    fn value(&self, objects: &ObjectStore) -> f64;

    /// Width of the penalty.
    fn error(&self, objects: &ObjectStore) -> f64;

    fn chi2(&self, objects: &ObjectStore) -> f64;

    /// `∂χ²/∂a`.
    fn chi2_first_derivatives(&self, objects: &ObjectStore) -> Gradient;

    /// `∂²χ²/∂a∂a`.
    fn chi2_second_derivatives(&self, objects: &ObjectStore) -> Hessian;
}

/// `sqrt(Σ (∂g/∂a · σ_a)²)` over the non-fixed parameters.
pub fn propagated_error(derivatives: &[(ParamRef, f64)], objects: &ObjectStore) -> f64 {
    derivatives
        .iter()
        .filter(|(p, _)| !objects[p.object].is_fixed(p.local))
        .map(|(p, d)| (d * objects[p.object].error(p.local)).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Positive, finite width of a soft constraint.
pub(crate) fn check_sigma(name: &str, sigma: f64) -> anyhow::Result<()> {
    ensure!(
        sigma.is_finite() && sigma > 0.0,
        "soft constraint '{}' has invalid width {}",
        name,
        sigma
    );
    Ok(())
}

/// Unique object ids in first-seen order.
pub(crate) fn collect_ids(params: impl IntoIterator<Item = ParamRef>) -> Vec<ObjectId> {
    let mut ids: Vec<ObjectId> = Vec::new();
    for p in params {
        if !ids.contains(&p.object) {
            ids.push(p.object);
        }
    }
    ids
}
