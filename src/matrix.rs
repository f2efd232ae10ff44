//! Dense matrices with named rows and columns.

use std::collections::HashMap;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use nalgebra::DMatrix;

use crate::files::template::normalize_name;
use crate::pst::ControlFile;
use crate::{require_file, NsmcError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    pub row_names: Vec<String>,
    pub col_names: Vec<String>,
    pub x: DMatrix<f64>,
}

fn name_index(names: &[String]) -> HashMap<&str, usize> {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect()
}

impl LabeledMatrix {
    pub fn new(row_names: Vec<String>, col_names: Vec<String>, x: DMatrix<f64>) -> Result<Self> {
        if row_names.len() != x.nrows() {
            return Err(NsmcError::LengthMismatch {
                context: "matrix row names",
                expected: x.nrows(),
                got: row_names.len(),
            });
        }
        if col_names.len() != x.ncols() {
            return Err(NsmcError::LengthMismatch {
                context: "matrix column names",
                expected: x.ncols(),
                got: col_names.len(),
            });
        }
        Ok(Self {
            row_names,
            col_names,
            x,
        })
    }

    /// Sub-matrix with the given rows and columns, in the order given.
    pub fn get(&self, rows: &[String], cols: &[String]) -> Result<Self> {
        let row_lookup = name_index(&self.row_names);
        let col_lookup = name_index(&self.col_names);

        let row_idx = rows
            .iter()
            .map(|r| {
                row_lookup
                    .get(r.as_str())
                    .copied()
                    .ok_or_else(|| NsmcError::UnknownName {
                        context: "matrix row",
                        name: r.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let col_idx = cols
            .iter()
            .map(|c| {
                col_lookup
                    .get(c.as_str())
                    .copied()
                    .ok_or_else(|| NsmcError::UnknownName {
                        context: "matrix column",
                        name: c.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let x = DMatrix::from_fn(row_idx.len(), col_idx.len(), |i, j| {
            self.x[(row_idx[i], col_idx[j])]
        });
        Ok(Self {
            row_names: rows.to_vec(),
            col_names: cols.to_vec(),
            x,
        })
    }

    /// Reads a CSV matrix: the header row holds column names after one
    /// leading cell, each later row starts with its row name.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        require_file(path)?;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .flexible(true)
            .from_path(path)?;

        let col_names: Vec<String> = reader
            .headers()?
            .iter()
            .skip(1)
            .map(normalize_name)
            .collect();
        if col_names.is_empty() {
            return Err(NsmcError::format(path, 1, "matrix header has no columns"));
        }

        let mut row_names = Vec::new();
        let mut values = Vec::new();
        for (offset, record) in reader.records().enumerate() {
            let line = offset + 2;
            let record = record?;
            if record.len() != col_names.len() + 1 {
                return Err(NsmcError::format(
                    path,
                    line,
                    format!(
                        "expected {} fields, found {}",
                        col_names.len() + 1,
                        record.len()
                    ),
                ));
            }
            row_names.push(normalize_name(&record[0]));
            for field in record.iter().skip(1) {
                let value: f64 = field.parse().map_err(|_| {
                    NsmcError::format(path, line, format!("invalid number '{field}'"))
                })?;
                values.push(value);
            }
        }

        let x = DMatrix::from_row_slice(row_names.len(), col_names.len(), &values);
        Self::new(row_names, col_names, x)
    }
}

/// Square, symmetric covariance matrix labeled by parameter or observation name.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariance {
    names: Vec<String>,
    x: DMatrix<f64>,
}

impl Covariance {
    pub fn new(names: Vec<String>, x: DMatrix<f64>) -> Result<Self> {
        if !x.is_square() {
            return Err(NsmcError::Numerical(format!(
                "covariance must be square, got {}x{}",
                x.nrows(),
                x.ncols()
            )));
        }
        if names.len() != x.nrows() {
            return Err(NsmcError::LengthMismatch {
                context: "covariance names",
                expected: x.nrows(),
                got: names.len(),
            });
        }
        Ok(Self { names, x })
    }

    pub fn from_diagonal(names: Vec<String>, variances: &[f64]) -> Result<Self> {
        let x = DMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(variances));
        Self::new(names, x)
    }

    /// Prior parameter covariance from bounds: the bound range spans
    /// `sigma_range` standard deviations, in log10 space for log-transformed
    /// parameters. Fixed and tied parameters get zero variance.
    pub fn from_parameter_bounds(pst: &ControlFile, sigma_range: f64) -> Result<Self> {
        if !(sigma_range.is_finite() && sigma_range > 0.0) {
            return Err(NsmcError::InvalidConfig(
                "sigma_range must be finite and greater than zero".to_string(),
            ));
        }

        let mut names = Vec::with_capacity(pst.parameter_data.len());
        let mut variances = Vec::with_capacity(pst.parameter_data.len());
        for par in &pst.parameter_data {
            par.validate_bounds()?;
            let variance = if par.partrans.is_adjustable() {
                let (lower, upper) = par.transformed_bounds();
                let std = (upper - lower) / sigma_range;
                std * std
            } else {
                0.0
            };
            names.push(par.parnme.clone());
            variances.push(variance);
        }
        Self::from_diagonal(names, &variances)
    }

    /// Observation noise covariance from weights (`1 / w^2`). Zero-weight
    /// observations get no noise.
    pub fn from_observation_weights(pst: &ControlFile) -> Result<Self> {
        let names = pst.obs_names();
        let variances: Vec<f64> = pst
            .observation_data
            .iter()
            .map(|obs| {
                if obs.weight > 0.0 {
                    1.0 / (obs.weight * obs.weight)
                } else {
                    0.0
                }
            })
            .collect();
        Self::from_diagonal(names, &variances)
    }

    /// Reads a square labeled CSV matrix; row and column names must agree.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let matrix = LabeledMatrix::from_csv(path)?;
        if matrix.row_names != matrix.col_names {
            return Err(NsmcError::format(
                path,
                1,
                "covariance row and column names differ",
            ));
        }
        Self::new(matrix.row_names, matrix.x)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn x(&self) -> &DMatrix<f64> {
        &self.x
    }
}
