//! Invariant-mass constraints on sums of four-vectors.
//!
//! With `P = Σ pᵢ` over the participating objects (each in the
//! `[E, px, py, pz]` layout) and `m = sqrt(E² − |p|²)`:
//!
//! ```text
//! ∂m/∂q_c        = s_c q_c / m                       = g_c
//! ∂²m/∂q_c ∂q_d  = (s_c δ_cd − g_c g_d) / m
//! ```
//!
//! with metric signs `s = (+1, −1, −1, −1)`. Every object sees the same
//! component-space derivatives because `P` is a plain sum.

use crate::objects::{FitObject, E, PX, PY, PZ};
use crate::problem::{ObjectId, ObjectStore, ParamRef};

use super::{check_sigma, Gradient, HardConstraint, Hessian, SoftConstraint};

const METRIC: [f64; 4] = [1.0, -1.0, -1.0, -1.0];
const COMPONENTS: [usize; 4] = [E, PX, PY, PZ];

/// Guards the derivatives against a vanishing invariant mass.
const MIN_MASS: f64 = 1e-9;

fn four_vector_params(ids: &[ObjectId]) -> Vec<ParamRef> {
    ids.iter()
        .flat_map(|&id| COMPONENTS.iter().map(move |&c| ParamRef::new(id, c)))
        .collect()
}

fn four_momentum(obj: &dyn FitObject) -> [f64; 4] {
    [obj.param(E), obj.param(PX), obj.param(PY), obj.param(PZ)]
}

/// Invariant mass of the summed four-vectors plus its component-space
/// first and second derivatives.
struct MassTerms {
    mass: f64,
    grad: [f64; 4],
    hess: [[f64; 4]; 4],
}

impl MassTerms {
    fn new(ids: &[ObjectId], objects: &ObjectStore) -> Self {
        let mut q = [0.0; 4];
        for &id in ids {
            let p = four_momentum(&objects[id]);
            for c in 0..4 {
                q[c] += p[c];
            }
        }
        let m2: f64 = (0..4).map(|c| METRIC[c] * q[c] * q[c]).sum();
        let mass = m2.max(0.0).sqrt();
        let m = mass.max(MIN_MASS);

        let mut grad = [0.0; 4];
        for c in 0..4 {
            grad[c] = METRIC[c] * q[c] / m;
        }
        let mut hess = [[0.0; 4]; 4];
        for c in 0..4 {
            for d in 0..4 {
                let diag = if c == d { METRIC[c] } else { 0.0 };
                hess[c][d] = (diag - grad[c] * grad[d]) / m;
            }
        }
        Self { mass, grad, hess }
    }

    fn gradient(&self, ids: &[ObjectId], factor: f64) -> Gradient {
        let mut out = Vec::with_capacity(4 * ids.len());
        for &id in ids {
            for c in 0..4 {
                out.push((ParamRef::new(id, COMPONENTS[c]), factor * self.grad[c]));
            }
        }
        out
    }

    /// `outer · g gᵀ + inner · H`, expanded over all object pairs.
    fn hessian(&self, ids: &[ObjectId], outer: f64, inner: f64) -> Hessian {
        let mut out = Vec::with_capacity(16 * ids.len() * ids.len());
        for &a in ids {
            for &b in ids {
                for c in 0..4 {
                    for d in 0..4 {
                        let v = outer * self.grad[c] * self.grad[d] + inner * self.hess[c][d];
                        out.push((
                            ParamRef::new(a, COMPONENTS[c]),
                            ParamRef::new(b, COMPONENTS[d]),
                            v,
                        ));
                    }
                }
            }
        }
        out
    }
}

/// Hard constraint: invariant mass of `objects` equals `mass`.
#[derive(Debug, Clone)]
pub struct MassConstraint {
    name: String,
    ids: Vec<ObjectId>,
    mass: f64,
}

impl MassConstraint {
    pub fn new(name: impl Into<String>, objects: &[ObjectId], mass: f64) -> Self {
        Self {
            name: name.into(),
            ids: objects.to_vec(),
            mass,
        }
    }

    /// Invariant mass of the participating objects at the current parameters.
    pub fn current_mass(&self, objects: &ObjectStore) -> f64 {
        MassTerms::new(&self.ids, objects).mass
    }

    pub fn target(&self) -> f64 {
        self.mass
    }
}

impl HardConstraint for MassConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_ids(&self) -> &[ObjectId] {
        &self.ids
    }

    fn params(&self) -> Vec<ParamRef> {
        four_vector_params(&self.ids)
    }

    fn value(&self, objects: &ObjectStore) -> f64 {
        self.current_mass(objects) - self.mass
    }

    fn first_derivatives(&self, objects: &ObjectStore) -> Gradient {
        MassTerms::new(&self.ids, objects).gradient(&self.ids, 1.0)
    }

    fn second_derivatives(&self, objects: &ObjectStore) -> Hessian {
        MassTerms::new(&self.ids, objects).hessian(&self.ids, 0.0, 1.0)
    }
}

/// Soft constraint: Gaussian penalty `((m − mass)/σ)²` on the invariant mass.
#[derive(Debug, Clone)]
pub struct SoftMassConstraint {
    name: String,
    ids: Vec<ObjectId>,
    mass: f64,
    sigma: f64,
}

impl SoftMassConstraint {
    pub fn new(name: impl Into<String>, objects: &[ObjectId], mass: f64, sigma: f64) -> Self {
        Self {
            name: name.into(),
            ids: objects.to_vec(),
            mass,
            sigma,
        }
    }
}

impl SoftConstraint for SoftMassConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_ids(&self) -> &[ObjectId] {
        &self.ids
    }

    fn params(&self) -> Vec<ParamRef> {
        four_vector_params(&self.ids)
    }

    fn validate(&self) -> anyhow::Result<()> {
        check_sigma(&self.name, self.sigma)
    }

    fn value(&self, objects: &ObjectStore) -> f64 {
        MassTerms::new(&self.ids, objects).mass
    }

    fn error(&self, _objects: &ObjectStore) -> f64 {
        self.sigma
    }

    fn chi2(&self, objects: &ObjectStore) -> f64 {
        ((self.value(objects) - self.mass) / self.sigma).powi(2)
    }

    fn chi2_first_derivatives(&self, objects: &ObjectStore) -> Gradient {
        let terms = MassTerms::new(&self.ids, objects);
        let s2 = self.sigma * self.sigma;
        terms.gradient(&self.ids, 2.0 * (terms.mass - self.mass) / s2)
    }

    fn chi2_second_derivatives(&self, objects: &ObjectStore) -> Hessian {
        let terms = MassTerms::new(&self.ids, objects);
        let s2 = self.sigma * self.sigma;
        terms.hessian(&self.ids, 2.0 / s2, 2.0 * (terms.mass - self.mass) / s2)
    }
}
