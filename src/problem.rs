//! Fit problem container.
//!
//! A [`FitProblem`] owns the fit objects and the hard and soft constraints that
//! relate them. Objects live in an arena ([`ObjectStore`]) and are referred to by
//! [`ObjectId`]; constraints name the parameters they depend on through
//! [`ParamRef`] (object id + local parameter index), so no collaborator ever
//! needs to know where its parameters end up in the global system.

use std::ops::Index;

use anyhow::ensure;

use crate::constraints::{HardConstraint, SoftConstraint};
use crate::objects::FitObject;

/// Handle of an object registered with a [`FitProblem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

impl ObjectId {
    /// Position of the object in registration order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A single parameter of a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamRef {
    pub object: ObjectId,
    /// Local parameter index inside the object.
    pub local: usize,
}

impl ParamRef {
    pub fn new(object: ObjectId, local: usize) -> Self {
        Self { object, local }
    }
}

/// Arena of fit objects, indexed by [`ObjectId`].
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: Vec<Box<dyn FitObject>>,
}

impl ObjectStore {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&dyn FitObject> {
        self.objects.get(id.0).map(|o| o.as_ref())
    }

    /// Current value of a single parameter.
    pub fn param(&self, p: ParamRef) -> f64 {
        self.objects[p.object.0].param(p.local)
    }

    /// Iterate over `(id, object)` in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &dyn FitObject)> + '_ {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, o)| (ObjectId(i), o.as_ref()))
    }

    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (ObjectId, &mut Box<dyn FitObject>)> + '_ {
        self.objects
            .iter_mut()
            .enumerate()
            .map(|(i, o)| (ObjectId(i), o))
    }

    fn contains(&self, id: ObjectId) -> bool {
        id.0 < self.objects.len()
    }
}

impl Index<ObjectId> for ObjectStore {
    type Output = dyn FitObject;

    fn index(&self, id: ObjectId) -> &Self::Output {
        self.objects[id.0].as_ref()
    }
}

/// Objects plus the constraints that tie them together.
///
/// The caller owns the problem; [`NewtonFitter::fit`](crate::NewtonFitter::fit)
/// borrows it mutably for the duration of one fit and writes fitted parameter
/// values and covariances back into the objects.
#[derive(Debug, Default)]
pub struct FitProblem {
    pub(crate) objects: ObjectStore,
    pub(crate) constraints: Vec<Box<dyn HardConstraint>>,
    pub(crate) soft_constraints: Vec<Box<dyn SoftConstraint>>,
}

impl FitProblem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fit object. Fails if the object reports an inconsistent state
    /// (see [`FitObject::validate`]).
    pub fn add_object<O: FitObject + 'static>(&mut self, object: O) -> anyhow::Result<ObjectId> {
        object.validate()?;
        let id = ObjectId(self.objects.objects.len());
        self.objects.objects.push(Box::new(object));
        Ok(id)
    }

    /// Register a hard constraint. Returns its position among the hard constraints.
    pub fn add_constraint<C: HardConstraint + 'static>(
        &mut self,
        constraint: C,
    ) -> anyhow::Result<usize> {
        constraint.validate()?;
        self.check_refs(constraint.name(), constraint.object_ids(), &constraint.params())?;
        self.constraints.push(Box::new(constraint));
        Ok(self.constraints.len() - 1)
    }

    /// Register a soft constraint. Returns its position among the soft constraints.
    pub fn add_soft_constraint<C: SoftConstraint + 'static>(
        &mut self,
        constraint: C,
    ) -> anyhow::Result<usize> {
        constraint.validate()?;
        self.check_refs(constraint.name(), constraint.object_ids(), &constraint.params())?;
        self.soft_constraints.push(Box::new(constraint));
        Ok(self.soft_constraints.len() - 1)
    }

    fn check_refs(&self, name: &str, ids: &[ObjectId], params: &[ParamRef]) -> anyhow::Result<()> {
        for &id in ids.iter().chain(params.iter().map(|p| &p.object)) {
            ensure!(
                self.objects.contains(id),
                "constraint '{}' references unknown object #{} ({} objects registered)",
                name,
                id.0,
                self.objects.len()
            );
        }
        for p in params {
            let obj = &self.objects[p.object];
            ensure!(
                p.local < obj.n_params(),
                "constraint '{}' references parameter {} of '{}', which has {} parameters",
                name,
                p.local,
                obj.name(),
                obj.n_params()
            );
        }
        Ok(())
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn object(&self, id: ObjectId) -> &dyn FitObject {
        &self.objects[id]
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut dyn FitObject {
        self.objects.objects[id.0].as_mut()
    }

    pub fn constraints(&self) -> &[Box<dyn HardConstraint>] {
        &self.constraints
    }

    pub fn soft_constraints(&self) -> &[Box<dyn SoftConstraint>] {
        &self.soft_constraints
    }

    /// Value of every hard constraint at the current parameters.
    pub fn constraint_values(&self) -> Vec<f64> {
        self.constraints
            .iter()
            .map(|c| c.value(&self.objects))
            .collect()
    }

    /// Total chi-square: objects plus soft constraints.
    pub fn chi2(&self) -> f64 {
        let objects: f64 = self.objects.iter().map(|(_, o)| o.chi2()).sum();
        let soft: f64 = self
            .soft_constraints
            .iter()
            .map(|c| c.chi2(&self.objects))
            .sum();
        objects + soft
    }

    /// Reset every object to its measured starting point.
    pub fn reset(&mut self) {
        for (_, obj) in self.objects.iter_mut() {
            obj.reset();
        }
    }
}
