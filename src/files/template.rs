//! PEST template files (`ptf`/`jtf`).
//!
//! Line 1 is `ptf <marker>`; every later line alternates literal text and
//! marker-delimited parameter fields, e.g. `value = #k1# #k2#`.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::{require_file, NsmcError, Result};

const TEMPLATE_KEYWORDS: [&str; 2] = ["ptf", "jtf"];

/// Parsed template file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    pub path: PathBuf,
    pub marker: char,
    /// Distinct parameter names, lower-cased and trimmed, in first-seen order
    pub parameter_names: Vec<String>,
}

/// Reads and validates the `<keyword> <marker>` header shared by template and
/// instruction files, returning the marker.
pub(crate) fn read_header(
    path: &Path,
    lines: &mut Lines<BufReader<File>>,
    keywords: &[&str],
    kind: &str,
) -> Result<char> {
    let header = match lines.next() {
        Some(line) => line.map_err(|e| NsmcError::format(path, 1, e.to_string()))?,
        None => return Err(NsmcError::format(path, 1, format!("empty {kind} file"))),
    };

    let tokens: Vec<&str> = header.split_whitespace().collect();
    let Some(keyword) = tokens.first() else {
        return Err(NsmcError::format(path, 1, format!("blank {kind} header")));
    };
    if !keywords.iter().any(|k| keyword.eq_ignore_ascii_case(k)) {
        return Err(NsmcError::format(
            path,
            1,
            format!(
                "{kind} file must start with one of [{}], not '{keyword}'",
                keywords.join(",")
            ),
        ));
    }
    if tokens.len() != 2 {
        return Err(NsmcError::format(
            path,
            1,
            format!("header line must have two entries, found {}", tokens.len()),
        ));
    }

    let mut marker_chars = tokens[1].chars();
    match (marker_chars.next(), marker_chars.next()) {
        (Some(marker), None) => Ok(marker),
        _ => Err(NsmcError::format(
            path,
            1,
            format!("marker must be a single character, not '{}'", tokens[1]),
        )),
    }
}

pub(crate) fn normalize_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Parses a template file and returns its parameter names.
pub fn parse_tpl_file(path: impl AsRef<Path>) -> Result<TemplateFile> {
    let path = path.as_ref();
    require_file(path)?;

    let mut lines = BufReader::new(File::open(path)?).lines();
    let marker = read_header(path, &mut lines, &TEMPLATE_KEYWORDS, "template")?;

    let mut parameter_names: Vec<String> = Vec::new();
    for (offset, line) in lines.enumerate() {
        let line_no = offset + 2;
        let line = line.map_err(|e| {
            NsmcError::format(path, line_no, format!("error processing template line: {e}"))
        })?;

        for field in line.trim().split(marker).skip(1).step_by(2) {
            let name = normalize_name(field);
            if !parameter_names.contains(&name) {
                parameter_names.push(name);
            }
        }
    }

    Ok(TemplateFile {
        path: path.to_path_buf(),
        marker,
        parameter_names,
    })
}
