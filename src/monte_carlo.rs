//! Null-space Monte Carlo engine.
//!
//! Owns a calibrated control file, its prior covariances and the two
//! realization ensembles, and moves through
//! `Empty -> Drawn -> (Projected) -> Written`.

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::ensemble::{ObservationEnsemble, ParameterEnsemble};
use crate::jacobian::{SensitivityDecomposition, SensitivityProduct};
use crate::matrix::{Covariance, LabeledMatrix};
use crate::nullspace::{effective_rank, NullProjector, DEFAULT_EPSILON};
use crate::progress::Stage;
use crate::pst::{ControlFile, Serializable};
use crate::{require_file, NsmcError, Result};

pub const DEFAULT_SEED: u64 = 2016;
pub const DEFAULT_SIGMA_RANGE: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Empty,
    Drawn,
    Projected,
    Written,
}

impl EngineState {
    fn has_realizations(self) -> bool {
        !matches!(self, EngineState::Empty)
    }

    fn can_project(self) -> bool {
        matches!(self, EngineState::Drawn | EngineState::Projected)
    }
}

#[derive(Debug, Clone)]
pub struct DrawOptions {
    pub num_reals: usize,
    /// Parameter-value file replacing the reference values before drawing
    pub par_file: Option<PathBuf>,
    /// Also draw observation noise realizations
    pub obs: bool,
    pub enforce_bounds: bool,
    /// Overrides the engine's parameter covariance for this draw
    pub cov: Option<Covariance>,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            num_reals: 1,
            par_file: None,
            obs: false,
            enforce_bounds: false,
            cov: None,
        }
    }
}

pub struct MonteCarlo {
    pst: ControlFile,
    parcov: Covariance,
    obscov: Covariance,
    sensitivity: Option<Box<dyn SensitivityDecomposition>>,
    parensemble: ParameterEnsemble,
    obsensemble: ObservationEnsemble,
    state: EngineState,
    rng: ChaCha8Rng,
    epsilon: f64,
}

impl MonteCarlo {
    /// Engine over `pst` with bound-derived parameter covariance and
    /// weight-derived observation covariance.
    pub fn new(pst: ControlFile) -> Result<Self> {
        if pst.npar() == 0 {
            return Err(NsmcError::Precondition(
                "control file has no parameters".to_string(),
            ));
        }
        let parcov = Covariance::from_parameter_bounds(&pst, DEFAULT_SIGMA_RANGE)?;
        let obscov = Covariance::from_observation_weights(&pst)?;
        Ok(Self {
            parensemble: ParameterEnsemble::from_control(&pst)?,
            obsensemble: ObservationEnsemble::from_control(&pst),
            pst,
            parcov,
            obscov,
            sensitivity: None,
            state: EngineState::Empty,
            rng: ChaCha8Rng::seed_from_u64(DEFAULT_SEED),
            epsilon: DEFAULT_EPSILON,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Result<Self> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(NsmcError::InvalidConfig(
                "epsilon must be finite and greater than zero".to_string(),
            ));
        }
        self.epsilon = epsilon;
        Ok(self)
    }

    pub fn with_parcov(mut self, parcov: Covariance) -> Self {
        self.parcov = parcov;
        self
    }

    pub fn with_sigma_range(mut self, sigma_range: f64) -> Result<Self> {
        self.parcov = Covariance::from_parameter_bounds(&self.pst, sigma_range)?;
        Ok(self)
    }

    pub fn with_sensitivity(mut self, sensitivity: Box<dyn SensitivityDecomposition>) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }

    /// Forms the weighted sensitivity product from `jco` and keeps its SVD.
    pub fn with_jacobian(self, jco: &LabeledMatrix) -> Result<Self> {
        let product = SensitivityProduct::from_jacobian(jco, &self.pst)?;
        Ok(self.with_sensitivity(Box::new(product)))
    }

    pub fn pst(&self) -> &ControlFile {
        &self.pst
    }

    pub fn parcov(&self) -> &Covariance {
        &self.parcov
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn num_reals(&self) -> usize {
        self.parensemble.num_reals()
    }

    pub fn parensemble(&self) -> &ParameterEnsemble {
        &self.parensemble
    }

    pub fn obsensemble(&self) -> &ObservationEnsemble {
        &self.obsensemble
    }

    fn require_sensitivity(&self) -> Result<&dyn SensitivityDecomposition> {
        self.sensitivity.as_deref().ok_or_else(|| {
            NsmcError::Precondition("projection requires a sensitivity decomposition".to_string())
        })
    }

    /// Effective rank of the sensitivity spectrum, at `epsilon` or the
    /// engine's own tolerance.
    pub fn get_nsing(&self, epsilon: Option<f64>) -> Result<usize> {
        let sensitivity = self.require_sensitivity()?;
        Ok(effective_rank(
            sensitivity.singular_values(),
            epsilon.unwrap_or(self.epsilon),
        ))
    }

    pub fn get_null_proj(&self, nsing: Option<usize>) -> Result<NullProjector> {
        let sensitivity = self.require_sensitivity()?;
        NullProjector::build_with_epsilon(sensitivity, nsing, self.epsilon)
    }

    /// Replaces both ensembles with fresh draws. Without `opts.obs` the
    /// observation ensemble is left empty.
    pub fn draw(&mut self, opts: DrawOptions) -> Result<()> {
        if opts.num_reals == 0 {
            return Err(NsmcError::InvalidConfig(
                "num_reals must be greater than zero".to_string(),
            ));
        }

        let mut pst = self.pst.clone();
        if let Some(par_file) = &opts.par_file {
            require_file(par_file)?;
            let replaced = pst.parrep(par_file)?;
            debug!(file = %par_file.display(), replaced, "replaced reference parameter values");
        }

        let mut parensemble = ParameterEnsemble::from_control(&pst)?;
        {
            let _stage = Stage::start(format!("drawing {} parameter realizations", opts.num_reals));
            let cov = opts.cov.as_ref().unwrap_or(&self.parcov);
            parensemble.draw(cov, opts.num_reals, &mut self.rng)?;
            if opts.enforce_bounds {
                let clipped = parensemble.enforce();
                debug!(clipped, "enforced parameter bounds");
            }
        }

        let mut obsensemble = ObservationEnsemble::from_control(&pst);
        if opts.obs {
            let _stage = Stage::start(format!("drawing {} observation realizations", opts.num_reals));
            obsensemble.draw(&self.obscov, opts.num_reals, &mut self.rng)?;
        }

        self.pst = pst;
        self.parensemble = parensemble;
        self.obsensemble = obsensemble;
        self.state = EngineState::Drawn;
        Ok(())
    }

    /// Projects the parameter ensemble onto the null space. With `inplace`
    /// the engine's ensemble is replaced and `None` returned; otherwise the
    /// projected ensemble is returned and the engine is left untouched.
    pub fn project_parensemble(
        &mut self,
        par_file: Option<&Path>,
        nsing: Option<usize>,
        inplace: bool,
    ) -> Result<Option<ParameterEnsemble>> {
        self.require_sensitivity()?;
        if !self.state.has_realizations() {
            return Err(NsmcError::Precondition(
                "no parameter realizations to project; draw first".to_string(),
            ));
        }
        if !self.state.can_project() {
            return Err(NsmcError::Precondition(
                "realizations already written; draw again before projecting".to_string(),
            ));
        }

        let mut pst = self.pst.clone();
        let mut base = self.parensemble.clone();
        if let Some(par_file) = par_file {
            require_file(par_file)?;
            pst.parrep(par_file)?;
            base.set_reference(&pst)?;
        }

        let projector = self.get_null_proj(nsing)?;
        let projected = {
            let _stage = Stage::start(format!(
                "projecting {} parameter realizations",
                base.num_reals()
            ));
            base.project(&projector)?
        };
        info!(nsing = projector.nsing(), inplace, "projected parameter ensemble");

        if inplace {
            self.pst = pst;
            self.parensemble = projected;
            self.state = EngineState::Projected;
            Ok(None)
        } else {
            Ok(Some(projected))
        }
    }

    /// Writes `{prefix}{i}.pst` for every realization and returns the paths.
    /// Observation values are overwritten only when the observation ensemble
    /// holds as many realizations as the parameter ensemble.
    pub fn write_psts(&mut self, prefix: &str) -> Result<Vec<PathBuf>> {
        if !self.state.has_realizations() {
            return Err(NsmcError::Precondition(
                "no realizations to write; draw first".to_string(),
            ));
        }

        let num_reals = self.parensemble.num_reals();
        let _stage = Stage::start(format!("writing {num_reals} realized control files"));
        let par_values = self.parensemble.back_transform();
        let write_obs = self.obsensemble.num_reals() == num_reals;
        debug_assert_eq!(self.parensemble.names(), &self.pst.par_names()[..]);

        let mut pst = self.pst.clone();
        let mut paths = Vec::with_capacity(num_reals);
        for real in 0..num_reals {
            for (record, value) in pst
                .parameter_data
                .iter_mut()
                .zip(par_values.row(real).iter())
            {
                record.parval1 = *value;
            }
            if write_obs {
                for (record, value) in pst
                    .observation_data
                    .iter_mut()
                    .zip(self.obsensemble.values().row(real).iter())
                {
                    record.obsval = *value;
                }
            }

            let path = PathBuf::from(format!("{prefix}{real}.pst"));
            pst.write(&path)?;
            debug!(path = %path.display(), "wrote realization");
            paths.push(path);
        }

        self.state = EngineState::Written;
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    use crate::pst::{write_parfile, ParTrans, ParValue};

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn control() -> ControlFile {
        let mut pst = ControlFile::generic(&names(&["k1", "k2"]), &names(&["h1", "h2"])).unwrap();
        for p in &mut pst.parameter_data {
            p.parval1 = 1.0;
            p.parlbnd = 0.01;
            p.parubnd = 100.0;
        }
        pst.observation_mut("h1").unwrap().obsval = 3.0;
        pst.observation_mut("h2").unwrap().obsval = 4.0;
        pst
    }

    fn sensitivity() -> Box<dyn SensitivityDecomposition> {
        Box::new(
            SensitivityProduct::from_parts(
                names(&["k1", "k2"]),
                vec![10.0, 0.0],
                DMatrix::identity(2, 2),
            )
            .unwrap(),
        )
    }

    fn draw(n: usize, obs: bool) -> DrawOptions {
        DrawOptions {
            num_reals: n,
            obs,
            ..DrawOptions::default()
        }
    }

    fn field(text: &str, name: &str, token: usize) -> f64 {
        let line = text
            .lines()
            .find(|l| l.trim_start().starts_with(&format!("{name} ")))
            .unwrap();
        line.split_whitespace().nth(token).unwrap().parse().unwrap()
    }

    #[test]
    fn test_new_requires_parameters() {
        let pst = ControlFile::generic(&[], &names(&["h1"])).unwrap();
        assert!(matches!(MonteCarlo::new(pst), Err(NsmcError::Precondition(_))));
    }

    #[test]
    fn test_new_rejects_invalid_bounds() {
        let mut pst = control();
        let k1 = pst.parameter_mut("k1").unwrap();
        k1.partrans = ParTrans::None;
        k1.parlbnd = 5.0;
        k1.parubnd = 1.0;
        assert!(matches!(MonteCarlo::new(pst), Err(NsmcError::InvalidConfig(_))));
    }

    #[test]
    fn test_project_requires_sensitivity() {
        let mut mc = MonteCarlo::new(control()).unwrap();
        mc.draw(draw(3, false)).unwrap();
        let err = mc.project_parensemble(None, None, true).unwrap_err();
        match err {
            NsmcError::Precondition(msg) => {
                assert_eq!(msg, "projection requires a sensitivity decomposition")
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(mc.state(), EngineState::Drawn);
        assert!(matches!(mc.get_nsing(None), Err(NsmcError::Precondition(_))));
    }

    #[test]
    fn test_project_and_write_require_draw() {
        let mut mc = MonteCarlo::new(control()).unwrap().with_sensitivity(sensitivity());
        assert_eq!(mc.state(), EngineState::Empty);
        assert!(matches!(
            mc.project_parensemble(None, None, true),
            Err(NsmcError::Precondition(_))
        ));
        assert!(matches!(mc.write_psts("r"), Err(NsmcError::Precondition(_))));
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("r").display().to_string();
        let mut mc = MonteCarlo::new(control()).unwrap().with_sensitivity(sensitivity());
        assert_eq!(mc.get_nsing(None).unwrap(), 1);

        mc.draw(draw(4, false)).unwrap();
        assert_eq!(mc.state(), EngineState::Drawn);

        let detached = mc.project_parensemble(None, None, false).unwrap();
        assert!(detached.is_some());
        assert_eq!(mc.state(), EngineState::Drawn);

        assert!(mc.project_parensemble(None, None, true).unwrap().is_none());
        assert_eq!(mc.state(), EngineState::Projected);
        // k1 is resolved by the data and collapses onto the reference
        assert!(mc.parensemble().values().column(0).iter().all(|v| v.abs() < 1e-12));

        mc.write_psts(&prefix).unwrap();
        assert_eq!(mc.state(), EngineState::Written);
        let again = mc.write_psts(&prefix).unwrap();
        assert_eq!(again.len(), 4);
        assert_eq!(mc.state(), EngineState::Written);
        assert!(matches!(
            mc.project_parensemble(None, None, true),
            Err(NsmcError::Precondition(_))
        ));
        assert_eq!(mc.state(), EngineState::Written);

        mc.draw(draw(2, false)).unwrap();
        assert_eq!(mc.state(), EngineState::Drawn);
        assert_eq!(mc.num_reals(), 2);
    }

    #[test]
    fn test_write_psts_one_file_per_realization() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("r").display().to_string();
        let mut mc = MonteCarlo::new(control()).unwrap().with_seed(7);
        mc.draw(draw(5, false)).unwrap();
        let paths = mc.write_psts(&prefix).unwrap();

        assert_eq!(paths.len(), 5);
        let model = mc.parensemble().back_transform();
        for (i, path) in paths.iter().enumerate() {
            assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("r{i}.pst"));
            let text = std::fs::read_to_string(path).unwrap();
            assert_relative_eq!(field(&text, "k1", 3), model[(i, 0)], max_relative = 1e-6);
            assert_relative_eq!(field(&text, "k2", 3), model[(i, 1)], max_relative = 1e-6);
            // no observation realizations, values untouched
            assert_eq!(field(&text, "h1", 1), 3.0);
        }
    }

    #[test]
    fn test_write_psts_overwrites_observations_when_counts_match() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("o").display().to_string();
        let mut mc = MonteCarlo::new(control()).unwrap();
        mc.draw(draw(2, true)).unwrap();
        assert_eq!(mc.obsensemble().num_reals(), 2);

        let paths = mc.write_psts(&prefix).unwrap();
        let text = std::fs::read_to_string(&paths[1]).unwrap();
        assert_relative_eq!(
            field(&text, "h1", 1),
            mc.obsensemble().values()[(1, 0)],
            max_relative = 1e-6
        );

        // a redraw without observations drops the old noise realizations
        mc.draw(draw(2, false)).unwrap();
        assert_eq!(mc.obsensemble().num_reals(), 0);
    }

    #[test]
    fn test_same_seed_same_draws() {
        let mut a = MonteCarlo::new(control()).unwrap().with_seed(99);
        let mut b = MonteCarlo::new(control()).unwrap().with_seed(99);
        a.draw(draw(6, true)).unwrap();
        b.draw(draw(6, true)).unwrap();
        assert_eq!(a.parensemble(), b.parensemble());
        assert_eq!(a.obsensemble(), b.obsensemble());
    }

    #[test]
    fn test_draw_with_par_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.par");
        let mut mc = MonteCarlo::new(control()).unwrap();
        let err = mc
            .draw(DrawOptions {
                par_file: Some(missing),
                ..draw(2, false)
            })
            .unwrap_err();
        assert!(matches!(err, NsmcError::MissingFile(_)));
        assert_eq!(mc.state(), EngineState::Empty);

        let par_file = dir.path().join("cal.par");
        write_parfile(
            &par_file,
            &[ParValue {
                parnme: "k1".to_string(),
                parval1: 10.0,
                scale: 1.0,
                offset: 0.0,
            }],
        )
        .unwrap();
        let zero = Covariance::from_diagonal(names(&["k1", "k2"]), &[0.0, 0.0]).unwrap();
        mc.draw(DrawOptions {
            par_file: Some(par_file),
            cov: Some(zero),
            ..draw(3, false)
        })
        .unwrap();
        assert_eq!(mc.pst().parameter("k1").unwrap().parval1, 10.0);
        let model = mc.parensemble().back_transform();
        assert!(model.column(0).iter().all(|v| (*v - 10.0).abs() < 1e-9));
        assert!(model.column(1).iter().all(|v| (*v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_draw_rejects_zero_reals() {
        let mut mc = MonteCarlo::new(control()).unwrap();
        assert!(matches!(mc.draw(draw(0, false)), Err(NsmcError::InvalidConfig(_))));
    }
}
