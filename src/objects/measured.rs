//! Generic object made of independently measured Gaussian parameters.
//!
//! Each parameter is one of
//!
//! - **measured**: value `η` with error `σ`, contributes `((a − η)/σ)²` to χ²;
//! - **unmeasured**: free in the fit, no χ² contribution (e.g. the momentum of
//!   an undetected neutrino);
//! - **fixed**: not a fit parameter at all.

use anyhow::ensure;
use nalgebra::DMatrix;

use super::FitObject;

/// Role of a parameter in the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Measured,
    Unmeasured,
    Fixed,
}

/// A fit object with named, uncorrelated Gaussian parameters.
#[derive(Debug, Clone)]
pub struct MeasuredObject {
    name: String,
    param_names: Vec<String>,
    kinds: Vec<ParamKind>,
    measured: Vec<f64>,
    values: Vec<f64>,
    errors: Vec<f64>,
    cov: DMatrix<f64>,
}

impl MeasuredObject {
    /// An object with no parameters; add them with the `with_*` builders.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_names: Vec::new(),
            kinds: Vec::new(),
            measured: Vec::new(),
            values: Vec::new(),
            errors: Vec::new(),
            cov: DMatrix::zeros(0, 0),
        }
    }

    /// A four-vector object with measured `[E, px, py, pz]`.
    pub fn four_vector(name: impl Into<String>, p: [f64; 4], errors: [f64; 4]) -> Self {
        let mut obj = Self::new(name);
        for (i, label) in ["E", "px", "py", "pz"].into_iter().enumerate() {
            obj = obj.with_measured(label, p[i], errors[i]);
        }
        obj
    }

    /// Add a measured parameter. `error` must be positive.
    pub fn with_measured(self, name: impl Into<String>, value: f64, error: f64) -> Self {
        self.push(name.into(), ParamKind::Measured, value, error)
    }

    /// Add an unmeasured parameter with a starting value.
    ///
    /// `scale` is only used to condition the linear system and to judge whether
    /// an update is significant; it does not enter the chi-square.
    pub fn with_unmeasured(self, name: impl Into<String>, start: f64, scale: f64) -> Self {
        self.push(name.into(), ParamKind::Unmeasured, start, scale)
    }

    /// Add a fixed parameter.
    pub fn with_fixed(self, name: impl Into<String>, value: f64) -> Self {
        self.push(name.into(), ParamKind::Fixed, value, 0.0)
    }

    fn push(mut self, name: String, kind: ParamKind, value: f64, error: f64) -> Self {
        self.param_names.push(name);
        self.kinds.push(kind);
        self.measured.push(value);
        self.values.push(value);
        self.errors.push(error);
        self.cov = self.measurement_cov_matrix();
        self
    }

    pub fn kind(&self, ilocal: usize) -> ParamKind {
        self.kinds[ilocal]
    }

    /// Change the role of a parameter, e.g. to fix it for one fit.
    pub fn set_kind(&mut self, ilocal: usize, kind: ParamKind) {
        self.kinds[ilocal] = kind;
        self.cov = self.measurement_cov_matrix();
    }

    /// Current parameter values.
    pub fn params(&self) -> &[f64] {
        &self.values
    }

    /// Fitted covariance (measurement covariance until a fit succeeds).
    pub fn cov_matrix(&self) -> &DMatrix<f64> {
        &self.cov
    }

    /// Normalized residual `(a − η)/σ'` using the fitted covariance:
    /// `σ'² = σ² − cov_fit`. Returns `None` for parameters that are not measured
    /// or when the fitted error is not smaller than the measured one.
    pub fn pull(&self, ilocal: usize) -> Option<f64> {
        if self.kinds[ilocal] != ParamKind::Measured {
            return None;
        }
        let var = self.errors[ilocal].powi(2) - self.cov[(ilocal, ilocal)];
        if var <= 0.0 {
            return None;
        }
        Some((self.values[ilocal] - self.measured[ilocal]) / var.sqrt())
    }

    fn measurement_cov_matrix(&self) -> DMatrix<f64> {
        let n = self.values.len();
        DMatrix::from_fn(n, n, |i, j| {
            if i == j && self.kinds[i] == ParamKind::Measured {
                self.errors[i] * self.errors[i]
            } else {
                0.0
            }
        })
    }
}

impl FitObject for MeasuredObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_params(&self) -> usize {
        self.values.len()
    }

    fn param_name(&self, ilocal: usize) -> &str {
        &self.param_names[ilocal]
    }

    fn param(&self, ilocal: usize) -> f64 {
        self.values[ilocal]
    }

    fn measured_param(&self, ilocal: usize) -> f64 {
        self.measured[ilocal]
    }

    fn error(&self, ilocal: usize) -> f64 {
        self.errors[ilocal]
    }

    fn is_fixed(&self, ilocal: usize) -> bool {
        self.kinds[ilocal] == ParamKind::Fixed
    }

    fn is_measured(&self, ilocal: usize) -> bool {
        self.kinds[ilocal] == ParamKind::Measured
    }

    fn set_param(&mut self, ilocal: usize, value: f64) -> bool {
        if self.is_fixed(ilocal) {
            return false;
        }
        let old = self.values[ilocal];
        self.values[ilocal] = value;
        let tolerance = if self.errors[ilocal] > 0.0 {
            1e-6 * self.errors[ilocal]
        } else {
            1e-6 * old.abs().max(1.0)
        };
        (value - old).abs() > tolerance
    }

    fn chi2(&self) -> f64 {
        (0..self.n_params())
            .filter(|&i| self.is_measured(i))
            .map(|i| ((self.values[i] - self.measured[i]) / self.errors[i]).powi(2))
            .sum()
    }

    fn chi2_first_der(&self, ilocal: usize) -> f64 {
        if !self.is_measured(ilocal) {
            return 0.0;
        }
        let s2 = self.errors[ilocal] * self.errors[ilocal];
        2.0 * (self.values[ilocal] - self.measured[ilocal]) / s2
    }

    fn chi2_second_der(&self, ilocal: usize, jlocal: usize) -> f64 {
        if ilocal != jlocal || !self.is_measured(ilocal) {
            return 0.0;
        }
        2.0 / (self.errors[ilocal] * self.errors[ilocal])
    }

    fn measurement_cov(&self, ilocal: usize, jlocal: usize) -> f64 {
        if ilocal != jlocal || !self.is_measured(ilocal) {
            return 0.0;
        }
        self.errors[ilocal] * self.errors[ilocal]
    }

    fn cov(&self, ilocal: usize, jlocal: usize) -> f64 {
        self.cov[(ilocal, jlocal)]
    }

    fn set_cov(&mut self, ilocal: usize, jlocal: usize, value: f64) {
        self.cov[(ilocal, jlocal)] = value;
        self.cov[(jlocal, ilocal)] = value;
    }

    fn reset(&mut self) {
        self.values.copy_from_slice(&self.measured);
        self.cov = self.measurement_cov_matrix();
    }

    fn validate(&self) -> anyhow::Result<()> {
        for i in 0..self.n_params() {
            ensure!(
                self.values[i].is_finite(),
                "{}: parameter '{}' is not finite",
                self.name,
                self.param_names[i]
            );
            if self.kinds[i] != ParamKind::Fixed {
                ensure!(
                    self.errors[i].is_finite() && self.errors[i] > 0.0,
                    "{}: parameter '{}' needs a positive error, got {}",
                    self.name,
                    self.param_names[i],
                    self.errors[i]
                );
            }
        }
        Ok(())
    }
}
