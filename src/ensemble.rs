//! Parameter and observation realization ensembles.
//!
//! Parameter realizations are stored in transformed space (log10 for
//! log-transformed parameters) while `log_transformed` is set; observation
//! realizations are always in model space.

use std::path::Path;

use csv::Writer;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::matrix::Covariance;
use crate::nullspace::NullProjector;
use crate::pst::{ControlFile, ParTrans};
use crate::{NsmcError, Result};

/// A labeled covariance usable for multivariate-normal sampling.
pub trait Sampleable {
    fn names(&self) -> &[String];
    fn covariance(&self) -> &DMatrix<f64>;
}

impl Sampleable for Covariance {
    fn names(&self) -> &[String] {
        Covariance::names(self)
    }

    fn covariance(&self) -> &DMatrix<f64> {
        self.x()
    }
}

fn aligned_covariance(cov: &dyn Sampleable, names: &[String]) -> Result<DMatrix<f64>> {
    let idx = names
        .iter()
        .map(|n| {
            cov.names()
                .iter()
                .position(|c| c == n)
                .ok_or_else(|| NsmcError::UnknownName {
                    context: "sampling covariance",
                    name: n.clone(),
                })
        })
        .collect::<Result<Vec<_>>>()?;
    let x = cov.covariance();
    Ok(DMatrix::from_fn(idx.len(), idx.len(), |i, j| x[(idx[i], idx[j])]))
}

/// `L` with `L·Lᵀ = C`. Cholesky for positive-definite `C`, otherwise a
/// symmetric eigendecomposition with non-negative eigenvalues.
pub fn sampling_factor(c: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if c.iter().any(|v| !v.is_finite()) {
        return Err(NsmcError::Numerical(
            "covariance has non-finite entries".to_string(),
        ));
    }
    if let Some(chol) = c.clone().cholesky() {
        return Ok(chol.l());
    }

    let eigen = SymmetricEigen::new(c.clone());
    let scale = eigen.eigenvalues.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let tolerance = 1e-10 * scale.max(f64::MIN_POSITIVE);
    if eigen.eigenvalues.iter().any(|&v| v < -tolerance) {
        return Err(NsmcError::Numerical(
            "covariance is not positive semidefinite".to_string(),
        ));
    }
    let roots = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
    Ok(&eigen.eigenvectors * DMatrix::from_diagonal(&roots))
}

/// `num_reals × n` matrix of draws from `N(mean, L·Lᵀ)`.
pub fn draw_multivariate_normal<R: Rng + ?Sized>(
    mean: &DVector<f64>,
    factor: &DMatrix<f64>,
    num_reals: usize,
    rng: &mut R,
) -> DMatrix<f64> {
    let n = mean.len();
    let mut out = DMatrix::zeros(num_reals, n);
    for real in 0..num_reals {
        let z = DVector::<f64>::from_fn(n, |_, _| rng.sample(StandardNormal));
        let x = mean + factor * z;
        out.row_mut(real).copy_from(&x.transpose());
    }
    out
}

fn fmt_f64(value: f64) -> String {
    format!("{value:.10}")
}

fn write_realizations_csv(path: &Path, names: &[String], values: &DMatrix<f64>) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    let mut header = vec!["real".to_string()];
    header.extend(names.iter().cloned());
    writer.write_record(&header)?;

    for (i, row) in values.row_iter().enumerate() {
        let mut record = vec![i.to_string()];
        record.extend(row.iter().map(|v| fmt_f64(*v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterEnsemble {
    names: Vec<String>,
    partrans: Vec<ParTrans>,
    /// Reference values, transformed
    reference: DVector<f64>,
    /// Model-space bounds
    lower: DVector<f64>,
    upper: DVector<f64>,
    values: DMatrix<f64>,
    log_transformed: bool,
}

impl ParameterEnsemble {
    /// Empty ensemble over every parameter of `pst`.
    pub fn from_control(pst: &ControlFile) -> Result<Self> {
        let npar = pst.npar();
        let mut ensemble = Self {
            names: pst.par_names(),
            partrans: pst.parameter_data.iter().map(|p| p.partrans.clone()).collect(),
            reference: DVector::zeros(npar),
            lower: DVector::zeros(npar),
            upper: DVector::zeros(npar),
            values: DMatrix::zeros(0, npar),
            log_transformed: false,
        };
        ensemble.set_reference(pst)?;
        Ok(ensemble)
    }

    /// Takes reference values and bounds from `pst`.
    pub fn set_reference(&mut self, pst: &ControlFile) -> Result<()> {
        for (j, name) in self.names.iter().enumerate() {
            if let Some(record) = pst.parameter(name) {
                record.validate_bounds()?;
                self.reference[j] = record.transformed_value();
                self.lower[j] = record.parlbnd;
                self.upper[j] = record.parubnd;
            }
        }
        Ok(())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_reals(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn is_log_transformed(&self) -> bool {
        self.log_transformed
    }

    fn has_log_columns(&self) -> bool {
        self.partrans.iter().any(ParTrans::is_log)
    }

    /// Replaces the realizations with `num_reals` draws around the reference
    /// values. Fixed and tied parameters stay at their reference values.
    pub fn draw<R: Rng + ?Sized>(
        &mut self,
        cov: &dyn Sampleable,
        num_reals: usize,
        rng: &mut R,
    ) -> Result<()> {
        let adjustable: Vec<usize> = (0..self.names.len())
            .filter(|&j| self.partrans[j].is_adjustable())
            .collect();
        let adj_names: Vec<String> = adjustable.iter().map(|&j| self.names[j].clone()).collect();

        let factor = sampling_factor(&aligned_covariance(cov, &adj_names)?)?;
        let mean = DVector::from_iterator(adjustable.len(), adjustable.iter().map(|&j| self.reference[j]));
        let draws = draw_multivariate_normal(&mean, &factor, num_reals, rng);

        let mut values = DMatrix::zeros(num_reals, self.names.len());
        for real in 0..num_reals {
            values.row_mut(real).copy_from(&self.reference.transpose());
            for (k, &j) in adjustable.iter().enumerate() {
                values[(real, j)] = draws[(real, k)];
            }
        }

        self.values = values;
        self.log_transformed = self.has_log_columns();
        debug!(num_reals, npar_adj = adjustable.len(), "drew parameter realizations");
        Ok(())
    }

    /// Clips every value to its parameter's bounds. Returns the number of
    /// values changed.
    pub fn enforce(&mut self) -> usize {
        let mut clipped = 0usize;
        for j in 0..self.names.len() {
            let (lower, upper) = if self.log_transformed && self.partrans[j].is_log() {
                (self.lower[j].log10(), self.upper[j].log10())
            } else {
                (self.lower[j], self.upper[j])
            };
            for real in 0..self.values.nrows() {
                let v = self.values[(real, j)];
                let bounded = v.clamp(lower, upper);
                if bounded != v {
                    self.values[(real, j)] = bounded;
                    clipped += 1;
                }
            }
        }
        clipped
    }

    /// Values in transformed space, whatever the current storage.
    pub fn transformed_values(&self) -> DMatrix<f64> {
        if self.log_transformed {
            return self.values.clone();
        }
        let mut out = self.values.clone();
        for (j, trans) in self.partrans.iter().enumerate() {
            if trans.is_log() {
                out.column_mut(j).apply(|v| *v = v.log10());
            }
        }
        out
    }

    /// Values in model space.
    pub fn back_transform(&self) -> DMatrix<f64> {
        if !self.log_transformed {
            return self.values.clone();
        }
        let mut out = self.values.clone();
        for (j, trans) in self.partrans.iter().enumerate() {
            if trans.is_log() {
                out.column_mut(j).apply(|v| *v = 10f64.powf(*v));
            }
        }
        out
    }

    /// `reference + P·(realization − reference)` for every realization, over
    /// the parameters the projector knows about. Other columns are copied.
    pub fn project(&self, projector: &NullProjector) -> Result<ParameterEnsemble> {
        let mut p_idx = Vec::new();
        let mut e_idx = Vec::new();
        for (pi, name) in projector.names().iter().enumerate() {
            if let Some(ei) = self.names.iter().position(|n| n == name) {
                p_idx.push(pi);
                e_idx.push(ei);
            }
        }
        if e_idx.is_empty() {
            return Err(NsmcError::Precondition(
                "null projector shares no parameters with the ensemble".to_string(),
            ));
        }

        let p = projector.matrix();
        let p_sub = DMatrix::from_fn(p_idx.len(), p_idx.len(), |i, j| p[(p_idx[i], p_idx[j])]);
        let base = DVector::from_iterator(e_idx.len(), e_idx.iter().map(|&j| self.reference[j]));

        let mut values = self.transformed_values();
        for real in 0..values.nrows() {
            let diff = DVector::from_iterator(
                e_idx.len(),
                e_idx.iter().map(|&j| values[(real, j)] - self.reference[j]),
            );
            let projected = &base + &p_sub * diff;
            for (k, &j) in e_idx.iter().enumerate() {
                values[(real, j)] = projected[k];
            }
        }

        Ok(ParameterEnsemble {
            values,
            log_transformed: self.has_log_columns(),
            ..self.clone()
        })
    }

    /// Writes model-space realizations, one row per realization.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        write_realizations_csv(path, &self.names, &self.back_transform())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationEnsemble {
    names: Vec<String>,
    reference: DVector<f64>,
    values: DMatrix<f64>,
}

impl ObservationEnsemble {
    /// Empty ensemble over every observation of `pst`.
    pub fn from_control(pst: &ControlFile) -> Self {
        Self {
            names: pst.obs_names(),
            reference: DVector::from_iterator(
                pst.nobs(),
                pst.observation_data.iter().map(|o| o.obsval),
            ),
            values: DMatrix::zeros(0, pst.nobs()),
        }
    }

    pub fn set_reference(&mut self, pst: &ControlFile) {
        for (j, name) in self.names.iter().enumerate() {
            if let Some(obs) = pst.observation(name) {
                self.reference[j] = obs.obsval;
            }
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_reals(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Replaces the realizations with `obsval + noise`, noise drawn from `cov`.
    pub fn draw<R: Rng + ?Sized>(
        &mut self,
        cov: &dyn Sampleable,
        num_reals: usize,
        rng: &mut R,
    ) -> Result<()> {
        let factor = sampling_factor(&aligned_covariance(cov, &self.names)?)?;
        let noise = draw_multivariate_normal(&DVector::zeros(self.names.len()), &factor, num_reals, rng);

        let mut values = noise;
        let reference = self.reference.transpose();
        for mut row in values.row_iter_mut() {
            row += &reference;
        }
        self.values = values;
        debug!(num_reals, nobs = self.names.len(), "drew observation realizations");
        Ok(())
    }

    /// Drops all realizations.
    pub fn clear(&mut self) {
        self.values = DMatrix::zeros(0, self.names.len());
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        write_realizations_csv(path, &self.names, &self.values)
    }
}
