//! PEST instruction files (`pif`/`jif`).
//!
//! Text between a pair of markers is a search string matched against the
//! model output and is never scanned for observation names.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::files::scanner::scan_instruction_line;
use crate::files::template::{normalize_name, read_header};
use crate::{require_file, NsmcError, Result};

const INSTRUCTION_KEYWORDS: [&str; 2] = ["pif", "jif"];

/// Parsed instruction file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionFile {
    pub path: PathBuf,
    pub marker: char,
    /// Observation names in scan order; duplicates are kept and `dum` is not
    pub observation_names: Vec<String>,
}

/// Observation tokens of one instruction line, before normalisation.
pub fn instruction_line_tokens(line: &str, marker: char) -> Vec<String> {
    let line = line.trim();
    if !line.contains(marker) {
        return scan_instruction_line(line);
    }

    line.split(marker)
        .step_by(2)
        .flat_map(scan_instruction_line)
        .collect()
}

/// Parses an instruction file and returns its observation names.
pub fn parse_ins_file(path: impl AsRef<Path>) -> Result<InstructionFile> {
    let path = path.as_ref();
    require_file(path)?;

    let mut lines = BufReader::new(File::open(path)?).lines();
    let marker = read_header(path, &mut lines, &INSTRUCTION_KEYWORDS, "instruction")?;

    let mut observation_names = Vec::new();
    for (offset, line) in lines.enumerate() {
        let line = line.map_err(|e| {
            NsmcError::format(
                path,
                offset + 2,
                format!("error processing instruction line: {e}"),
            )
        })?;
        observation_names.extend(
            instruction_line_tokens(&line, marker)
                .iter()
                .map(|token| normalize_name(token)),
        );
    }

    Ok(InstructionFile {
        path: path.to_path_buf(),
        marker,
        observation_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_ins(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_instruction_with_marker_segments() {
        let file = write_ins("pif ~\nl1 ~,~ !h1!\n");
        let ins = parse_ins_file(file.path()).unwrap();
        assert_eq!(ins.marker, '~');
        assert_eq!(ins.observation_names, vec!["h1"]);
    }

    #[test]
    fn test_parse_instruction_skips_dummy() {
        let file = write_ins("pif ~\nl1 w w w !obs1! w !dum! !obs2!\n");
        let ins = parse_ins_file(file.path()).unwrap();
        assert_eq!(ins.observation_names, vec!["obs1", "obs2"]);
    }

    #[test]
    fn test_marker_delimited_text_is_not_scanned() {
        // "[fake]" sits between markers, so it is a search string
        let file = write_ins("pif @\n@ [fake] @ [Real]20:30\nl1 (Other)1:5\n");
        let ins = parse_ins_file(file.path()).unwrap();
        assert_eq!(ins.observation_names, vec!["real", "other"]);
    }

    #[test]
    fn test_instruction_keeps_duplicates_in_order() {
        let file = write_ins("jif ~\nl1 !a!\nl1 !b! !a!\n");
        let ins = parse_ins_file(file.path()).unwrap();
        assert_eq!(ins.observation_names, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_instruction_wrong_keyword() {
        let file = write_ins("ptf ~\nl1 !a!\n");
        let err = parse_ins_file(file.path()).unwrap_err();
        assert!(matches!(err, NsmcError::Format { line: 1, .. }));
        assert!(err.to_string().contains("pif,jif"));
    }

    #[test]
    fn test_instruction_multichar_marker() {
        let file = write_ins("pif ~~\nl1 !a!\n");
        assert!(matches!(
            parse_ins_file(file.path()),
            Err(NsmcError::Format { .. })
        ));
    }

    #[test]
    fn test_line_tokens_even_segments_only() {
        let tokens = instruction_line_tokens("  !a! ~!b!~ !c!  ", '~');
        assert_eq!(tokens, vec!["a", "c"]);
    }

    #[test]
    fn test_unreadable_body_line_reports_file_and_line() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"pif ~\nl1 !h\xff1!\n").unwrap();
        match parse_ins_file(file.path()).unwrap_err() {
            NsmcError::Format { file: name, line, .. } => {
                assert_eq!(line, 2);
                assert_eq!(name, file.path().display().to_string());
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
