//! Solver-private scratch buffers, sized to the KKT dimension.

use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    /// Current global vector: free parameters, then multipliers.
    pub x: DVector<f64>,
    /// Start point of the current iteration.
    pub xold: DVector<f64>,
    /// Step in physical units.
    pub dx: DVector<f64>,
    /// Step in scaled units.
    pub dxscal: DVector<f64>,
    /// Gradient of the merit function.
    pub grad: DVector<f64>,
    pub y: DVector<f64>,
    pub yscal: DVector<f64>,
    pub perr: DVector<f64>,
    pub m: DMatrix<f64>,
    pub mscal: DMatrix<f64>,
}

impl Workspace {
    pub fn new(idim: usize) -> Self {
        Self {
            x: DVector::zeros(idim),
            xold: DVector::zeros(idim),
            dx: DVector::zeros(idim),
            dxscal: DVector::zeros(idim),
            grad: DVector::zeros(idim),
            y: DVector::zeros(idim),
            yscal: DVector::zeros(idim),
            perr: DVector::from_element(idim, 1.0),
            m: DMatrix::zeros(idim, idim),
            mscal: DMatrix::zeros(idim, idim),
        }
    }

    pub fn dim(&self) -> usize {
        self.x.len()
    }

    /// Reallocate only if the dimension changed, then reset the fit state.
    pub fn prepare(&mut self, idim: usize) {
        if self.dim() != idim {
            *self = Self::new(idim);
            return;
        }
        self.x.fill(0.0);
        self.y.fill(0.0);
        self.perr.fill(1.0);
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new(0)
    }
}
