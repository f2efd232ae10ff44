//! Minimal PEST control-file model.
//!
//! Built from template/instruction files with the [`PST_DEFAULTS`] tables,
//! updated from parameter-value files, and written back out as `.pst`.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::config::{FieldFormat, FieldSpec, IoPair, PST_DEFAULTS};
use crate::files::instruction::parse_ins_file;
use crate::files::template::{normalize_name, parse_tpl_file};
use crate::{require_file, NsmcError, Result};

/// Anything that can be written to a control-file path.
pub trait Serializable {
    fn write(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParTrans {
    Log,
    None,
    Fixed,
    /// Tied to the named parent parameter
    Tied(String),
}

impl ParTrans {
    pub fn is_adjustable(&self) -> bool {
        matches!(self, ParTrans::Log | ParTrans::None)
    }

    pub fn is_log(&self) -> bool {
        matches!(self, ParTrans::Log)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParTrans::Log => "log",
            ParTrans::None => "none",
            ParTrans::Fixed => "fixed",
            ParTrans::Tied(_) => "tied",
        }
    }
}

impl FromStr for ParTrans {
    type Err = NsmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "log" => Ok(ParTrans::Log),
            "none" => Ok(ParTrans::None),
            "fixed" => Ok(ParTrans::Fixed),
            other => Err(NsmcError::InvalidConfig(format!(
                "unsupported parameter transform '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRecord {
    pub parnme: String,
    pub partrans: ParTrans,
    pub parchglim: String,
    pub parval1: f64,
    pub parlbnd: f64,
    pub parubnd: f64,
    pub pargp: String,
    pub scale: f64,
    pub offset: f64,
    pub dercom: i64,
}

impl ParameterRecord {
    pub fn with_defaults(name: &str) -> Result<Self> {
        let d = PST_DEFAULTS.parameter;
        Ok(Self {
            parnme: name.to_string(),
            partrans: d.partrans.parse()?,
            parchglim: d.parchglim.to_string(),
            parval1: d.parval1,
            parlbnd: d.parlbnd,
            parubnd: d.parubnd,
            pargp: d.pargp.to_string(),
            scale: d.scale,
            offset: d.offset,
            dercom: d.dercom,
        })
    }

    /// Maps a model-space value into the space the ensembles work in.
    pub fn transform(&self, value: f64) -> f64 {
        if self.partrans.is_log() {
            value.log10()
        } else {
            value
        }
    }

    /// Bounds must be finite and ordered; log-transformed parameters also
    /// need a positive lower bound and value.
    pub fn validate_bounds(&self) -> Result<()> {
        if !(self.parlbnd.is_finite() && self.parubnd.is_finite() && self.parlbnd <= self.parubnd) {
            return Err(NsmcError::InvalidConfig(format!(
                "parameter '{}' has invalid bounds [{}, {}]",
                self.parnme, self.parlbnd, self.parubnd
            )));
        }
        if self.partrans.is_log() && !(self.parlbnd > 0.0 && self.parval1 > 0.0) {
            return Err(NsmcError::InvalidConfig(format!(
                "log-transformed parameter '{}' needs a positive lower bound and value",
                self.parnme
            )));
        }
        Ok(())
    }

    pub fn transformed_value(&self) -> f64 {
        self.transform(self.parval1)
    }

    pub fn transformed_bounds(&self) -> (f64, f64) {
        (self.transform(self.parlbnd), self.transform(self.parubnd))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroupRecord {
    pub pargpnme: String,
    pub inctyp: String,
    pub derinc: f64,
    pub derinclb: f64,
    pub forcen: String,
    pub derincmul: f64,
    pub dermthd: String,
    pub splitthresh: f64,
    pub splitreldiff: f64,
    pub splitaction: String,
}

impl ParameterGroupRecord {
    pub fn with_defaults(name: &str) -> Self {
        let d = PST_DEFAULTS.parameter_group;
        Self {
            pargpnme: name.to_string(),
            inctyp: d.inctyp.to_string(),
            derinc: d.derinc,
            derinclb: d.derinclb,
            forcen: d.forcen.to_string(),
            derincmul: d.derincmul,
            dermthd: d.dermthd.to_string(),
            splitthresh: d.splitthresh,
            splitreldiff: d.splitreldiff,
            splitaction: d.splitaction.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRecord {
    pub obsnme: String,
    pub obsval: f64,
    pub weight: f64,
    pub obgnme: String,
}

impl ObservationRecord {
    pub fn with_defaults(name: &str) -> Self {
        let d = PST_DEFAULTS.observation;
        Self {
            obsnme: name.to_string(),
            obsval: d.obsval,
            weight: d.weight,
            obgnme: d.obgnme.to_string(),
        }
    }
}

/// One row of a parameter-value file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParValue {
    pub parnme: String,
    pub parval1: f64,
    pub scale: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlFile {
    pub parameter_groups: Vec<ParameterGroupRecord>,
    pub parameter_data: Vec<ParameterRecord>,
    pub observation_data: Vec<ObservationRecord>,
    pub model_command: Vec<String>,
    pub template_files: Vec<IoPair>,
    pub instruction_files: Vec<IoPair>,
}

impl ControlFile {
    /// Control file with default records for the given names.
    pub fn generic(par_names: &[String], obs_names: &[String]) -> Result<Self> {
        let mut seen = HashSet::new();
        for name in obs_names {
            if !seen.insert(name.as_str()) {
                return Err(NsmcError::DuplicateName {
                    context: "observation data",
                    name: name.clone(),
                });
            }
        }
        let mut seen = HashSet::new();
        for name in par_names {
            if !seen.insert(name.as_str()) {
                return Err(NsmcError::DuplicateName {
                    context: "parameter data",
                    name: name.clone(),
                });
            }
        }

        Ok(Self {
            parameter_groups: vec![ParameterGroupRecord::with_defaults(
                PST_DEFAULTS.parameter.pargp,
            )],
            parameter_data: par_names
                .iter()
                .map(|n| ParameterRecord::with_defaults(n))
                .collect::<Result<Vec<_>>>()?,
            observation_data: obs_names
                .iter()
                .map(|n| ObservationRecord::with_defaults(n))
                .collect(),
            model_command: vec![PST_DEFAULTS.model_command.to_string()],
            template_files: vec![IoPair {
                pest_file: "file.tpl".into(),
                model_file: "file.in".into(),
            }],
            instruction_files: vec![IoPair {
                pest_file: "file.ins".into(),
                model_file: "file.out".into(),
            }],
        })
    }

    /// Control file whose parameters and observations come from the given
    /// template and instruction files.
    pub fn from_io_files(templates: &[IoPair], instructions: &[IoPair]) -> Result<Self> {
        let mut par_names: Vec<String> = Vec::new();
        for pair in templates {
            require_file(&pair.pest_file)?;
            for name in parse_tpl_file(&pair.pest_file)?.parameter_names {
                if !par_names.contains(&name) {
                    par_names.push(name);
                }
            }
        }

        let mut obs_names = Vec::new();
        for pair in instructions {
            require_file(&pair.pest_file)?;
            obs_names.extend(parse_ins_file(&pair.pest_file)?.observation_names);
        }
        debug!(
            npar = par_names.len(),
            nobs = obs_names.len(),
            "parsed model io files"
        );

        let mut pst = Self::generic(&par_names, &obs_names)?;
        pst.template_files = templates.to_vec();
        pst.instruction_files = instructions.to_vec();
        Ok(pst)
    }

    pub fn npar(&self) -> usize {
        self.parameter_data.len()
    }

    pub fn nobs(&self) -> usize {
        self.observation_data.len()
    }

    pub fn npar_adj(&self) -> usize {
        self.parameter_data
            .iter()
            .filter(|p| p.partrans.is_adjustable())
            .count()
    }

    pub fn par_names(&self) -> Vec<String> {
        self.parameter_data.iter().map(|p| p.parnme.clone()).collect()
    }

    pub fn obs_names(&self) -> Vec<String> {
        self.observation_data
            .iter()
            .map(|o| o.obsnme.clone())
            .collect()
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterRecord> {
        self.parameter_data.iter().find(|p| p.parnme == name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut ParameterRecord> {
        self.parameter_data.iter_mut().find(|p| p.parnme == name)
    }

    pub fn observation(&self, name: &str) -> Option<&ObservationRecord> {
        self.observation_data.iter().find(|o| o.obsnme == name)
    }

    pub fn observation_mut(&mut self, name: &str) -> Option<&mut ObservationRecord> {
        self.observation_data.iter_mut().find(|o| o.obsnme == name)
    }

    pub fn set_partrans(&mut self, name: &str, partrans: ParTrans) -> Result<()> {
        if let ParTrans::Tied(parent) = &partrans {
            if self.parameter(parent).is_none() {
                return Err(NsmcError::UnknownName {
                    context: "tied parent",
                    name: parent.clone(),
                });
            }
        }
        let record = self
            .parameter_mut(name)
            .ok_or_else(|| NsmcError::UnknownName {
                context: "parameter data",
                name: name.to_string(),
            })?;
        record.partrans = partrans;
        Ok(())
    }

    /// Replaces `parval1`, `scale` and `offset` from a parameter-value file.
    pub fn parrep(&mut self, par_file: &Path) -> Result<usize> {
        let values = read_parfile(par_file)?;
        let mut replaced = 0usize;
        for value in values {
            match self.parameter_mut(&value.parnme) {
                Some(record) => {
                    record.parval1 = value.parval1;
                    record.scale = value.scale;
                    record.offset = value.offset;
                    replaced += 1;
                }
                None => warn!(
                    parameter = %value.parnme,
                    file = %par_file.display(),
                    "parameter in par file not found in control file"
                ),
            }
        }
        Ok(replaced)
    }

    fn observation_groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for obs in &self.observation_data {
            if !groups.contains(&obs.obgnme.as_str()) {
                groups.push(obs.obgnme.as_str());
            }
        }
        groups
    }

    pub fn to_pst_string(&self) -> String {
        let d = &PST_DEFAULTS;
        let mut out = String::new();
        let obs_groups = self.observation_groups();

        out.push_str("pcf\n* control data\nrestart estimation\n");
        let _ = writeln!(
            out,
            "{:>10}{:>10}{:>10}{:>10}{:>10}",
            self.npar(),
            self.nobs(),
            self.parameter_groups.len(),
            0,
            obs_groups.len()
        );
        let _ = writeln!(
            out,
            "{:>10}{:>10} single point 1 0 0",
            self.template_files.len(),
            self.instruction_files.len()
        );
        for line in d.control_data_lines {
            out.push_str(line);
            out.push('\n');
        }

        out.push_str("* singular value decomposition\n1\n");
        let _ = writeln!(out, "{} {}", self.npar_adj(), sci(d.svd_eigthresh, 6));
        out.push_str("1\n");

        out.push_str("* parameter groups\n");
        for g in &self.parameter_groups {
            let values = [
                FieldValue::Str(&g.pargpnme),
                FieldValue::Str(&g.inctyp),
                FieldValue::Float(g.derinc),
                FieldValue::Float(g.derinclb),
                FieldValue::Str(&g.forcen),
                FieldValue::Float(g.derincmul),
                FieldValue::Str(&g.dermthd),
                FieldValue::Float(g.splitthresh),
                FieldValue::Float(g.splitreldiff),
                FieldValue::Str(&g.splitaction),
            ];
            out.push_str(&format_row(&d.pargp_fields, &values));
        }

        out.push_str("* parameter data\n");
        for p in &self.parameter_data {
            let values = [
                FieldValue::Str(&p.parnme),
                FieldValue::Str(p.partrans.as_str()),
                FieldValue::Str(&p.parchglim),
                FieldValue::Float(p.parval1),
                FieldValue::Float(p.parlbnd),
                FieldValue::Float(p.parubnd),
                FieldValue::Str(&p.pargp),
                FieldValue::Float(p.scale),
                FieldValue::Float(p.offset),
                FieldValue::Int(p.dercom),
            ];
            out.push_str(&format_row(&d.par_fields, &values));
        }
        for p in &self.parameter_data {
            if let ParTrans::Tied(parent) = &p.partrans {
                let values = [FieldValue::Str(&p.parnme), FieldValue::Str(parent)];
                out.push_str(&format_row(&d.tied_fields, &values));
            }
        }

        out.push_str("* observation groups\n");
        for g in &obs_groups {
            out.push_str(g);
            out.push('\n');
        }

        out.push_str("* observation data\n");
        for o in &self.observation_data {
            let values = [
                FieldValue::Str(&o.obsnme),
                FieldValue::Float(o.obsval),
                FieldValue::Float(o.weight),
                FieldValue::Str(&o.obgnme),
            ];
            out.push_str(&format_row(&d.obs_fields, &values));
        }

        out.push_str("* model command line\n");
        for cmd in &self.model_command {
            out.push_str(cmd);
            out.push('\n');
        }

        out.push_str("* model input/output\n");
        for pair in self.template_files.iter().chain(&self.instruction_files) {
            let _ = writeln!(
                out,
                "{} {}",
                pair.pest_file.display(),
                pair.model_file.display()
            );
        }
        out
    }
}

impl Serializable for ControlFile {
    fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_pst_string())?;
        Ok(())
    }
}

enum FieldValue<'a> {
    Str(&'a str),
    Float(f64),
    Int(i64),
}

impl FieldValue<'_> {
    fn format(&self) -> FieldFormat {
        match self {
            FieldValue::Str(_) => FieldFormat::Str,
            FieldValue::Float(_) => FieldFormat::Float,
            FieldValue::Int(_) => FieldFormat::Int,
        }
    }
}

fn format_row(fields: &[FieldSpec], values: &[FieldValue<'_>]) -> String {
    let mut row = String::new();
    for (spec, value) in fields.iter().zip(values) {
        debug_assert_eq!(spec.format, value.format(), "field {}", spec.name);
        let cell = match value {
            FieldValue::Str(s) => sfmt(s),
            FieldValue::Float(v) => ffmt(*v),
            FieldValue::Int(v) => format!("{v:>10}"),
        };
        row.push_str(&cell);
        row.push(' ');
    }
    row.pop();
    row.push('\n');
    row
}

fn sfmt(s: &str) -> String {
    format!("{s:>20}")
}

/// Scientific notation with a signed, two-digit exponent: `1.000000E+00`.
pub(crate) fn sci(value: f64, precision: usize) -> String {
    let raw = format!("{value:.precision$E}");
    match raw.split_once('E') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}E{sign}{:02}", exp.abs())
        }
        None => raw,
    }
}

fn ffmt(value: f64) -> String {
    format!("{:>15}", sci(value, 6))
}

/// Reads a PEST parameter-value file (`single point` / `double point`).
pub fn read_parfile(path: &Path) -> Result<Vec<ParValue>> {
    require_file(path)?;
    let raw = fs::read_to_string(path)?;
    let mut lines = raw.lines();

    let header = lines.next().unwrap_or_default().trim().to_lowercase();
    if !(header.starts_with("single") || header.starts_with("double")) {
        return Err(NsmcError::format(
            path,
            1,
            format!("expected 'single point' or 'double point', found '{header}'"),
        ));
    }

    let mut values = Vec::new();
    for (offset, line) in lines.enumerate() {
        let line_no = offset + 2;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != 4 {
            return Err(NsmcError::format(
                path,
                line_no,
                format!("expected 4 entries, found {}", tokens.len()),
            ));
        }
        let number = |raw: &str| -> Result<f64> {
            raw.parse()
                .map_err(|_| NsmcError::format(path, line_no, format!("invalid number '{raw}'")))
        };
        values.push(ParValue {
            parnme: normalize_name(tokens[0]),
            parval1: number(tokens[1])?,
            scale: number(tokens[2])?,
            offset: number(tokens[3])?,
        });
    }
    Ok(values)
}

pub fn write_parfile(path: &Path, values: &[ParValue]) -> Result<PathBuf> {
    let mut out = String::from("single point\n");
    for v in values {
        let _ = writeln!(
            out,
            "{:<20} {:>20} {:>20} {:>20}",
            v.parnme,
            sci(v.parval1, 7),
            sci(v.scale, 7),
            sci(v.offset, 7)
        );
    }
    fs::write(path, out)?;
    Ok(path.to_path_buf())
}
