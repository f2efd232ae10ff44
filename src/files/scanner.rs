//! Extraction-marker scanner for a single instruction line.
//!
//! Observation names sit inside `[..]`, `(..)` or `!..!` spans. There is no
//! nesting: after an opening marker the first matching closer wins, and the
//! scan resumes one character past it.

/// Name PEST uses for fields that are read but not kept.
pub const DUMMY_OBSERVATION: &str = "dum";

const MARKER_PAIRS: [(char, char); 3] = [('[', ']'), ('(', ')'), ('!', '!')];

fn closing_marker(c: char) -> Option<char> {
    MARKER_PAIRS
        .iter()
        .find(|(open, _)| *open == c)
        .map(|(_, close)| *close)
}

/// Returns the observation tokens found in `line`, in order of appearance.
///
/// The last character is never examined as an opening marker. A span without
/// a closer runs to the end of the line. Tokens equal to `dum` (any case) are
/// dropped; all other tokens are returned untrimmed.
pub fn scan_instruction_line(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();

    let mut idx = 0usize;
    while idx + 1 < len {
        let Some(close) = closing_marker(chars[idx]) else {
            idx += 1;
            continue;
        };

        let end = chars[idx + 1..]
            .iter()
            .position(|&c| c == close)
            .map(|offset| idx + 1 + offset)
            .unwrap_or(len);

        let token: String = chars[idx + 1..end].iter().collect();
        if !token.eq_ignore_ascii_case(DUMMY_OBSERVATION) {
            tokens.push(token);
        }
        idx = end + 1;
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_mixed_markers() {
        let tokens = scan_instruction_line("l1 [h1]1:10 (h2)12:20 !h3!");
        assert_eq!(tokens, vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn test_scan_drops_dummy_any_case() {
        let tokens = scan_instruction_line("l1 w w w !obs1! w !DUM! !obs2!");
        assert_eq!(tokens, vec!["obs1", "obs2"]);
    }

    #[test]
    fn test_scan_unterminated_runs_to_end() {
        assert_eq!(scan_instruction_line("l1 [head1"), vec!["head1"]);
    }

    #[test]
    fn test_scan_ignores_opener_in_last_position() {
        assert!(scan_instruction_line("l1 w [").is_empty());
        assert!(scan_instruction_line("!").is_empty());
        assert!(scan_instruction_line("").is_empty());
    }

    #[test]
    fn test_scan_no_nesting() {
        // the first ']' closes the span opened by the first '['
        assert_eq!(scan_instruction_line("[a[b]c]"), vec!["a[b"]);
    }

    #[test]
    fn test_scan_keeps_whitespace_inside_token() {
        assert_eq!(scan_instruction_line("! obs1 !"), vec![" obs1 "]);
    }

    #[test]
    fn test_scan_empty_span() {
        assert_eq!(scan_instruction_line("l1 [] w"), vec![""]);
    }
}
