//! pest-nsmc - PEST file parsing and null-space Monte Carlo
//!
//! Reads the template and instruction mini-languages that bind parameter and
//! observation names to model input/output files, and generates parameter
//! realizations projected onto the null space of a calibrated model's
//! weighted sensitivity product, writing one control file per realization.

use std::path::PathBuf;

use thiserror::Error;

pub mod config;
pub mod ensemble;
pub mod files {
    pub mod instruction;
    pub mod scanner;
    pub mod template;
}
pub mod jacobian;
pub mod matrix;
pub mod monte_carlo;
pub mod nullspace;
pub mod progress;
pub mod pst;

pub use config::{RunConfig, PST_DEFAULTS};
pub use ensemble::{ObservationEnsemble, ParameterEnsemble, Sampleable};
pub use files::instruction::{parse_ins_file, InstructionFile};
pub use files::scanner::scan_instruction_line;
pub use files::template::{parse_tpl_file, TemplateFile};
pub use jacobian::{SensitivityDecomposition, SensitivityProduct};
pub use matrix::{Covariance, LabeledMatrix};
pub use monte_carlo::{DrawOptions, EngineState, MonteCarlo};
pub use nullspace::{effective_rank, NullProjector, DEFAULT_EPSILON};
pub use pst::{ControlFile, ParTrans, Serializable};

pub type Result<T> = std::result::Result<T, NsmcError>;

#[derive(Debug, Error)]
pub enum NsmcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("format error in {file} (line {line}): {message}")]
    Format {
        file: String,
        line: usize,
        message: String,
    },
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{context} length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{context}: unknown name '{name}'")]
    UnknownName { context: &'static str, name: String },
    #[error("{context}: duplicate name '{name}'")]
    DuplicateName { context: &'static str, name: String },
    #[error("numerical error: {0}")]
    Numerical(String),
}

impl NsmcError {
    pub(crate) fn format(file: &std::path::Path, line: usize, message: impl Into<String>) -> Self {
        Self::Format {
            file: file.display().to_string(),
            line,
            message: message.into(),
        }
    }
}

/// Fails with [`NsmcError::MissingFile`] unless `path` exists.
pub(crate) fn require_file(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(NsmcError::MissingFile(path.to_path_buf()))
    }
}
