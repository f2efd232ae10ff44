//! Control-file default tables and the TOML run configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::nullspace::DEFAULT_EPSILON;
use crate::{NsmcError, Result};

/// How a control-file field is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    /// Right-aligned string, width 20
    Str,
    /// Scientific notation, width 15, six decimals
    Float,
    /// Right-aligned integer, width 10
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub format: FieldFormat,
}

const fn field(name: &'static str, format: FieldFormat) -> FieldSpec {
    FieldSpec { name, format }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterDefaults {
    pub partrans: &'static str,
    pub parchglim: &'static str,
    pub parval1: f64,
    pub parlbnd: f64,
    pub parubnd: f64,
    pub pargp: &'static str,
    pub scale: f64,
    pub offset: f64,
    pub dercom: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterGroupDefaults {
    pub pargpnme: &'static str,
    pub inctyp: &'static str,
    pub derinc: f64,
    pub derinclb: f64,
    pub forcen: &'static str,
    pub derincmul: f64,
    pub dermthd: &'static str,
    pub splitthresh: f64,
    pub splitreldiff: f64,
    pub splitaction: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationDefaults {
    pub obsval: f64,
    pub weight: f64,
    pub obgnme: &'static str,
}

/// Everything a generated control file needs that is not derived from the model files.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PstDefaults {
    pub par_fields: [FieldSpec; 10],
    pub pargp_fields: [FieldSpec; 10],
    pub obs_fields: [FieldSpec; 4],
    pub tied_fields: [FieldSpec; 2],
    pub parameter: ParameterDefaults,
    pub parameter_group: ParameterGroupDefaults,
    pub observation: ObservationDefaults,
    pub model_command: &'static str,
    /// Lines 4-8 of the control data section
    pub control_data_lines: [&'static str; 5],
    /// SVD truncation ratio written to the singular value decomposition section
    pub svd_eigthresh: f64,
}

pub const PST_DEFAULTS: PstDefaults = PstDefaults {
    par_fields: [
        field("parnme", FieldFormat::Str),
        field("partrans", FieldFormat::Str),
        field("parchglim", FieldFormat::Str),
        field("parval1", FieldFormat::Float),
        field("parlbnd", FieldFormat::Float),
        field("parubnd", FieldFormat::Float),
        field("pargp", FieldFormat::Str),
        field("scale", FieldFormat::Float),
        field("offset", FieldFormat::Float),
        field("dercom", FieldFormat::Int),
    ],
    pargp_fields: [
        field("pargpnme", FieldFormat::Str),
        field("inctyp", FieldFormat::Str),
        field("derinc", FieldFormat::Float),
        field("derinclb", FieldFormat::Float),
        field("forcen", FieldFormat::Str),
        field("derincmul", FieldFormat::Float),
        field("dermthd", FieldFormat::Str),
        field("splitthresh", FieldFormat::Float),
        field("splitreldiff", FieldFormat::Float),
        field("splitaction", FieldFormat::Str),
    ],
    obs_fields: [
        field("obsnme", FieldFormat::Str),
        field("obsval", FieldFormat::Float),
        field("weight", FieldFormat::Float),
        field("obgnme", FieldFormat::Str),
    ],
    tied_fields: [
        field("parnme", FieldFormat::Str),
        field("partied", FieldFormat::Str),
    ],
    parameter: ParameterDefaults {
        partrans: "log",
        parchglim: "factor",
        parval1: 1.0,
        parlbnd: 1.1e-10,
        parubnd: 1.1e10,
        pargp: "pargp",
        scale: 1.0,
        offset: 0.0,
        dercom: 1,
    },
    parameter_group: ParameterGroupDefaults {
        pargpnme: "pargp",
        inctyp: "relative",
        derinc: 0.01,
        derinclb: 0.0,
        forcen: "switch",
        derincmul: 2.0,
        dermthd: "parabolic",
        splitthresh: 1.0e-5,
        splitreldiff: 0.5,
        splitaction: "smaller",
    },
    observation: ObservationDefaults {
        obsval: 1.0e10,
        weight: 1.0,
        obgnme: "obgnme",
    },
    model_command: "model.bat",
    control_data_lines: [
        "  1.000000E+01 -3.000000E+00  3.000000E-01  1.000000E-02 10",
        "  1.000000E+01  1.000000E+01  1.000000E-03",
        "  1.000000E-01",
        "  30  1.000000E-02 3 3  1.000000E-02 3",
        "  1 1 1",
    ],
    svd_eigthresh: 1.0e-6,
};

/// A PEST-side file and the model file it maps onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPair {
    pub pest_file: PathBuf,
    pub model_file: PathBuf,
}

/// Null-space Monte Carlo run settings for the `run` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Template files and the model input files they write
    pub templates: Vec<IoPair>,
    /// Instruction files and the model output files they read
    pub instructions: Vec<IoPair>,
    /// CSV Jacobian, observations by parameters
    pub jacobian: Option<PathBuf>,
    /// Calibrated parameter values
    pub par_file: Option<PathBuf>,
    /// CSV prior parameter covariance; bounds-derived when absent
    pub parcov: Option<PathBuf>,
    pub num_reals: usize,
    pub seed: u64,
    pub epsilon: f64,
    /// Fixed solution-space dimension; derived from `epsilon` when absent
    pub nsing: Option<usize>,
    pub draw_obs: bool,
    pub enforce_bounds: bool,
    pub project: bool,
    /// Number of standard deviations spanned by each parameter's bounds
    pub sigma_range: f64,
    pub prefix: String,
    pub outdir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            templates: Vec::new(),
            instructions: Vec::new(),
            jacobian: None,
            par_file: None,
            parcov: None,
            num_reals: 100,
            seed: 2016,
            epsilon: DEFAULT_EPSILON,
            nsing: None,
            draw_obs: false,
            enforce_bounds: false,
            project: true,
            sigma_range: 4.0,
            prefix: "real_".to_string(),
            outdir: PathBuf::from("output-pest-nsmc"),
        }
    }
}

impl RunConfig {
    /// Loads a config file; relative paths inside it are taken relative to
    /// the file's own directory.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut cfg: RunConfig = toml::from_str(&raw)?;
        if let Some(base) = path.parent() {
            cfg.resolve_paths(base);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for pair in self.templates.iter_mut().chain(self.instructions.iter_mut()) {
            join(&mut pair.pest_file);
            join(&mut pair.model_file);
        }
        for p in [&mut self.jacobian, &mut self.par_file, &mut self.parcov]
            .into_iter()
            .flatten()
        {
            join(p);
        }
        join(&mut self.outdir);
    }

    pub fn validate(&self) -> Result<()> {
        if self.templates.is_empty() {
            return Err(NsmcError::InvalidConfig(
                "at least one template file is required".to_string(),
            ));
        }
        if self.instructions.is_empty() {
            return Err(NsmcError::InvalidConfig(
                "at least one instruction file is required".to_string(),
            ));
        }
        if self.num_reals == 0 {
            return Err(NsmcError::InvalidConfig(
                "num_reals must be greater than zero".to_string(),
            ));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(NsmcError::InvalidConfig(
                "epsilon must be finite and greater than zero".to_string(),
            ));
        }
        if !(self.sigma_range.is_finite() && self.sigma_range > 0.0) {
            return Err(NsmcError::InvalidConfig(
                "sigma_range must be finite and greater than zero".to_string(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(NsmcError::InvalidConfig(
                "prefix must not be empty".to_string(),
            ));
        }
        if self.project && self.jacobian.is_none() {
            return Err(NsmcError::InvalidConfig(
                "projection requires a jacobian".to_string(),
            ));
        }
        Ok(())
    }
}
