//! Global parameter numbering.
//!
//! Every free (non-fixed) object parameter gets a dense global index in
//! registration order, followed by one Lagrange-multiplier slot per hard
//! constraint. The table is rebuilt at the start of every fit.

use crate::problem::{FitProblem, ObjectId, ParamRef};

/// Mapping from local parameters and constraints to global system indices.
#[derive(Debug, Clone, Default)]
pub struct GlobalIndex {
    params: Vec<Vec<Option<usize>>>,
    constraints: Vec<usize>,
    npar: usize,
    nunm: usize,
    nsoft: usize,
}

impl GlobalIndex {
    /// Number the free parameters of `problem`, then its hard constraints.
    pub fn assign(problem: &FitProblem) -> Self {
        let mut npar = 0;
        let mut nunm = 0;
        let mut params = Vec::with_capacity(problem.objects().len());

        for (_, obj) in problem.objects().iter() {
            let mut local = Vec::with_capacity(obj.n_params());
            for ilocal in 0..obj.n_params() {
                if obj.is_fixed(ilocal) {
                    local.push(None);
                    continue;
                }
                local.push(Some(npar));
                npar += 1;
                if !obj.is_measured(ilocal) {
                    nunm += 1;
                }
            }
            params.push(local);
        }

        let constraints = (0..problem.constraints().len()).map(|k| npar + k).collect();

        Self {
            params,
            constraints,
            npar,
            nunm,
            nsoft: problem.soft_constraints().len(),
        }
    }

    /// Global index of a parameter, `None` if it is fixed or unknown.
    pub fn param(&self, p: ParamRef) -> Option<usize> {
        self.params
            .get(p.object.index())
            .and_then(|local| local.get(p.local).copied().flatten())
    }

    /// Global indices of all local parameters of an object.
    pub fn object_params(&self, id: ObjectId) -> &[Option<usize>] {
        self.params.get(id.index()).map_or(&[], |v| v.as_slice())
    }

    /// Global index of the multiplier of hard constraint `k`.
    pub fn constraint(&self, k: usize) -> usize {
        self.constraints[k]
    }

    /// Number of free object parameters.
    pub fn npar(&self) -> usize {
        self.npar
    }

    /// Number of hard constraints.
    pub fn ncon(&self) -> usize {
        self.constraints.len()
    }

    pub fn nsoft(&self) -> usize {
        self.nsoft
    }

    /// Number of free parameters without a measurement.
    pub fn nunm(&self) -> usize {
        self.nunm
    }

    /// Dimension of the KKT system: `npar + ncon`.
    pub fn idim(&self) -> usize {
        self.npar + self.constraints.len()
    }

    /// Degrees of freedom: `ncon + nsoft − nunm`.
    pub fn dof(&self) -> i64 {
        self.ncon() as i64 + self.nsoft as i64 - self.nunm as i64
    }

    /// More unmeasured parameters than (hard + soft) constraints.
    pub fn is_underdetermined(&self) -> bool {
        self.nunm > self.ncon() + self.nsoft
    }
}
