//! Weighted sensitivity product `XᵀQX` and its singular value decomposition.

use nalgebra::{DMatrix, SVD};
use tracing::debug;

use crate::matrix::LabeledMatrix;
use crate::pst::ControlFile;
use crate::{NsmcError, Result};

/// Singular values and right singular vectors of a sensitivity product,
/// indexed by parameter name.
pub trait SensitivityDecomposition {
    /// Row labels of [`right_singular_vectors`](Self::right_singular_vectors)
    fn parameter_names(&self) -> &[String];
    /// Descending, non-negative
    fn singular_values(&self) -> &[f64];
    /// One column per singular value, in the same order
    fn right_singular_vectors(&self) -> &DMatrix<f64>;
}

#[derive(Debug, Clone)]
pub struct SensitivityProduct {
    names: Vec<String>,
    singular_values: Vec<f64>,
    v: DMatrix<f64>,
}

impl SensitivityProduct {
    /// Builds a decomposition from precomputed parts, reordering the
    /// singular values (and their vectors) to descending order.
    pub fn from_parts(names: Vec<String>, singular_values: Vec<f64>, v: DMatrix<f64>) -> Result<Self> {
        if v.nrows() != names.len() {
            return Err(NsmcError::LengthMismatch {
                context: "right singular vector rows",
                expected: names.len(),
                got: v.nrows(),
            });
        }
        if v.ncols() != singular_values.len() {
            return Err(NsmcError::LengthMismatch {
                context: "right singular vector columns",
                expected: singular_values.len(),
                got: v.ncols(),
            });
        }

        let mut order: Vec<usize> = (0..singular_values.len()).collect();
        order.sort_by(|&a, &b| singular_values[b].total_cmp(&singular_values[a]));

        let sorted_values = order.iter().map(|&i| singular_values[i]).collect();
        let sorted_v = DMatrix::from_fn(v.nrows(), order.len(), |r, c| v[(r, order[c])]);
        Ok(Self {
            names,
            singular_values: sorted_values,
            v: sorted_v,
        })
    }

    /// Forms `XᵀQX` with `Q = diag(w²)` from a Jacobian whose rows are
    /// observations and columns parameters. Columns for parameters that are
    /// not adjustable in `pst` are dropped.
    pub fn from_jacobian(jco: &LabeledMatrix, pst: &ControlFile) -> Result<Self> {
        let mut par_names = Vec::with_capacity(jco.col_names.len());
        for name in &jco.col_names {
            let record = pst.parameter(name).ok_or_else(|| NsmcError::UnknownName {
                context: "jacobian parameter",
                name: name.clone(),
            })?;
            if record.partrans.is_adjustable() {
                par_names.push(name.clone());
            }
        }
        if par_names.is_empty() {
            return Err(NsmcError::Precondition(
                "jacobian has no adjustable parameter columns".to_string(),
            ));
        }

        let weights = jco
            .row_names
            .iter()
            .map(|name| {
                pst.observation(name)
                    .map(|obs| obs.weight)
                    .ok_or_else(|| NsmcError::UnknownName {
                        context: "jacobian observation",
                        name: name.clone(),
                    })
            })
            .collect::<Result<Vec<f64>>>()?;

        let x = jco.get(&jco.row_names, &par_names)?.x;
        let mut weighted = x;
        for (r, w) in weights.iter().enumerate() {
            weighted.row_mut(r).scale_mut(*w);
        }
        let xtqx = weighted.transpose() * &weighted;
        debug!(
            nobs = jco.row_names.len(),
            npar = par_names.len(),
            "formed weighted sensitivity product"
        );

        let svd = SVD::new(xtqx, false, true);
        let v_t = svd.v_t.ok_or_else(|| {
            NsmcError::Numerical("SVD of the sensitivity product did not converge".to_string())
        })?;
        Self::from_parts(
            par_names,
            svd.singular_values.iter().copied().collect(),
            v_t.transpose(),
        )
    }
}

impl SensitivityDecomposition for SensitivityProduct {
    fn parameter_names(&self) -> &[String] {
        &self.names
    }

    fn singular_values(&self) -> &[f64] {
        &self.singular_values
    }

    fn right_singular_vectors(&self) -> &DMatrix<f64> {
        &self.v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_parts_sorts_descending() {
        let v = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let d = SensitivityProduct::from_parts(names(&["a", "b"]), vec![1.0, 5.0], v).unwrap();
        assert_eq!(d.singular_values(), &[5.0, 1.0]);
        assert_eq!(d.right_singular_vectors()[(1, 0)], 1.0);
        assert_eq!(d.right_singular_vectors()[(0, 1)], 1.0);
    }

    #[test]
    fn test_from_jacobian_rank_deficient() {
        let pst = ControlFile::generic(&names(&["a", "b"]), &names(&["h1", "h2"])).unwrap();
        let jco = LabeledMatrix::new(
            names(&["h1", "h2"]),
            names(&["a", "b"]),
            DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 2.0, 2.0]),
        )
        .unwrap();
        let d = SensitivityProduct::from_jacobian(&jco, &pst).unwrap();
        let s = d.singular_values();
        assert_relative_eq!(s[0], 10.0, epsilon = 1e-10);
        assert!(s[1].abs() < 1e-10);

        // trailing vector spans (1, -1)
        let v = d.right_singular_vectors();
        assert_relative_eq!(v[(0, 1)].abs(), 0.5f64.sqrt(), epsilon = 1e-10);
        assert_relative_eq!(v[(0, 1)], -v[(1, 1)], epsilon = 1e-10);
    }

    #[test]
    fn test_from_jacobian_applies_weights_and_drops_fixed() {
        let mut pst =
            ControlFile::generic(&names(&["a", "b"]), &names(&["h1", "h2"])).unwrap();
        pst.observation_mut("h2").unwrap().weight = 0.0;
        pst.set_partrans("b", crate::pst::ParTrans::Fixed).unwrap();
        let jco = LabeledMatrix::new(
            names(&["h1", "h2"]),
            names(&["a", "b"]),
            DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 100.0, 1.0]),
        )
        .unwrap();
        let d = SensitivityProduct::from_jacobian(&jco, &pst).unwrap();
        assert_eq!(d.parameter_names(), &names(&["a"])[..]);
        assert_relative_eq!(d.singular_values()[0], 9.0, epsilon = 1e-10);
    }

    #[test]
    fn test_from_jacobian_unknown_observation() {
        let pst = ControlFile::generic(&names(&["a"]), &names(&["h1"])).unwrap();
        let jco = LabeledMatrix::new(names(&["h9"]), names(&["a"]), DMatrix::from_element(1, 1, 1.0))
            .unwrap();
        assert!(matches!(
            SensitivityProduct::from_jacobian(&jco, &pst),
            Err(NsmcError::UnknownName { .. })
        ));
    }
}
