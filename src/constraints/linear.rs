//! Linear constraints: `g(a) = Σ cₖ aₖ − target`.
//!
//! Covers the common conservation laws of a kinematic fit (total px, py, pz or
//! energy equal to a known value) as well as arbitrary linear relations between
//! parameters.

use crate::objects;
use crate::problem::{ObjectId, ObjectStore, ParamRef};

use super::{check_sigma, collect_ids, Gradient, HardConstraint, Hessian, SoftConstraint};

/// Terms plus target shared by the hard and soft variants.
#[derive(Debug, Clone)]
struct LinearForm {
    terms: Vec<(ParamRef, f64)>,
    target: f64,
    ids: Vec<ObjectId>,
}

impl LinearForm {
    fn new(target: f64) -> Self {
        Self {
            terms: Vec::new(),
            target,
            ids: Vec::new(),
        }
    }

    fn push(&mut self, param: ParamRef, coeff: f64) {
        self.terms.push((param, coeff));
        self.ids = collect_ids(self.terms.iter().map(|(p, _)| *p));
    }

    fn params(&self) -> Vec<ParamRef> {
        self.terms.iter().map(|(p, _)| *p).collect()
    }

    fn eval(&self, objects: &ObjectStore) -> f64 {
        self.terms
            .iter()
            .map(|(p, c)| c * objects.param(*p))
            .sum::<f64>()
            - self.target
    }

    fn component_sum(objs: &[ObjectId], component: usize, target: f64) -> Self {
        let mut form = Self::new(target);
        for &id in objs {
            form.push(ParamRef::new(id, component), 1.0);
        }
        form
    }
}

/// Hard linear constraint `Σ cₖ aₖ = target`.
#[derive(Debug, Clone)]
pub struct LinearConstraint {
    name: String,
    form: LinearForm,
}

impl LinearConstraint {
    pub fn new(name: impl Into<String>, target: f64) -> Self {
        Self {
            name: name.into(),
            form: LinearForm::new(target),
        }
    }

    /// Add `coeff · param` to the sum.
    pub fn with_term(mut self, param: ParamRef, coeff: f64) -> Self {
        self.form.push(param, coeff);
        self
    }

    /// Sum of one four-vector component over `objs`, e.g.
    /// `LinearConstraint::component_sum("px", &jets, objects::PX, 0.0)`.
    pub fn component_sum(
        name: impl Into<String>,
        objs: &[ObjectId],
        component: usize,
        target: f64,
    ) -> Self {
        Self {
            name: name.into(),
            form: LinearForm::component_sum(objs, component, target),
        }
    }

    /// Total energy of `objs` equal to `energy`.
    pub fn energy_sum(name: impl Into<String>, objs: &[ObjectId], energy: f64) -> Self {
        Self::component_sum(name, objs, objects::E, energy)
    }

    pub fn target(&self) -> f64 {
        self.form.target
    }
}

impl HardConstraint for LinearConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_ids(&self) -> &[ObjectId] {
        &self.form.ids
    }

    fn params(&self) -> Vec<ParamRef> {
        self.form.params()
    }

    fn value(&self, objects: &ObjectStore) -> f64 {
        self.form.eval(objects)
    }

    fn first_derivatives(&self, _objects: &ObjectStore) -> Gradient {
        self.form.terms.clone()
    }

    fn second_derivatives(&self, _objects: &ObjectStore) -> Hessian {
        Vec::new()
    }
}

/// Gaussian penalty `((Σ cₖ aₖ − target)/σ)²`.
#[derive(Debug, Clone)]
pub struct SoftLinearConstraint {
    name: String,
    form: LinearForm,
    sigma: f64,
}

impl SoftLinearConstraint {
    pub fn new(name: impl Into<String>, target: f64, sigma: f64) -> Self {
        Self {
            name: name.into(),
            form: LinearForm::new(target),
            sigma,
        }
    }

    pub fn with_term(mut self, param: ParamRef, coeff: f64) -> Self {
        self.form.push(param, coeff);
        self
    }

    pub fn component_sum(
        name: impl Into<String>,
        objs: &[ObjectId],
        component: usize,
        target: f64,
        sigma: f64,
    ) -> Self {
        Self {
            name: name.into(),
            form: LinearForm::component_sum(objs, component, target),
            sigma,
        }
    }
}

impl SoftConstraint for SoftLinearConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_ids(&self) -> &[ObjectId] {
        &self.form.ids
    }

    fn params(&self) -> Vec<ParamRef> {
        self.form.params()
    }

    fn validate(&self) -> anyhow::Result<()> {
        check_sigma(&self.name, self.sigma)
    }

    fn value(&self, objects: &ObjectStore) -> f64 {
        self.form.eval(objects) + self.form.target
    }

    fn error(&self, _objects: &ObjectStore) -> f64 {
        self.sigma
    }

    fn chi2(&self, objects: &ObjectStore) -> f64 {
        (self.form.eval(objects) / self.sigma).powi(2)
    }

    fn chi2_first_derivatives(&self, objects: &ObjectStore) -> Gradient {
        let f = 2.0 * self.form.eval(objects) / (self.sigma * self.sigma);
        self.form.terms.iter().map(|(p, c)| (*p, f * c)).collect()
    }

    fn chi2_second_derivatives(&self, _objects: &ObjectStore) -> Hessian {
        let f = 2.0 / (self.sigma * self.sigma);
        let mut hess = Vec::with_capacity(self.form.terms.len().pow(2));
        for (p, cp) in &self.form.terms {
            for (q, cq) in &self.form.terms {
                hess.push((*p, *q, f * cp * cq));
            }
        }
        hess
    }
}
