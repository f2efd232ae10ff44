//! Solution-space dimension and null-space projection.

use nalgebra::DMatrix;

use crate::jacobian::SensitivityDecomposition;
use crate::progress::Stage;
use crate::{NsmcError, Result};

/// Smallest singular-value ratio, relative to the largest, still treated as
/// resolvable by the calibration data.
pub const DEFAULT_EPSILON: f64 = 1.0e-6;

/// Number of singular values whose ratio to the largest is at least `epsilon`.
///
/// Non-increasing in `epsilon`; 0 for an empty or all-zero spectrum.
pub fn effective_rank(spectrum: &[f64], epsilon: f64) -> usize {
    let max = spectrum.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || max <= 0.0 {
        return 0;
    }

    let mut ratios: Vec<f64> = spectrum.iter().map(|s| s / max).collect();
    ratios.sort_by(|a, b| a.total_cmp(b));
    let insertion = ratios.partition_point(|r| *r < epsilon);
    ratios.len() - insertion
}

/// Orthogonal projector `V2·V2ᵀ` onto the span of the right singular vectors
/// beyond the first `nsing`.
#[derive(Debug, Clone, PartialEq)]
pub struct NullProjector {
    names: Vec<String>,
    nsing: usize,
    x: DMatrix<f64>,
}

impl NullProjector {
    /// Builds the projector, deriving `nsing` from [`DEFAULT_EPSILON`] when
    /// not given.
    pub fn build(decomposition: &dyn SensitivityDecomposition, nsing: Option<usize>) -> Result<Self> {
        Self::build_with_epsilon(decomposition, nsing, DEFAULT_EPSILON)
    }

    pub fn build_with_epsilon(
        decomposition: &dyn SensitivityDecomposition,
        nsing: Option<usize>,
        epsilon: f64,
    ) -> Result<Self> {
        let spectrum = decomposition.singular_values();
        let nsing = nsing.unwrap_or_else(|| effective_rank(spectrum, epsilon));
        let v = decomposition.right_singular_vectors();
        if nsing > v.ncols() {
            return Err(NsmcError::InvalidConfig(format!(
                "nsing {nsing} exceeds the {} available singular components",
                v.ncols()
            )));
        }

        let _stage = Stage::start(format!(
            "forming null space projection matrix with {nsing} singular components"
        ));
        let v2 = v.columns(nsing, v.ncols() - nsing);
        let x = &v2 * v2.transpose();

        Ok(Self {
            names: decomposition.parameter_names().to_vec(),
            nsing,
            x,
        })
    }

    /// Row and column labels
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn nsing(&self) -> usize {
        self.nsing
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.x
    }
}
