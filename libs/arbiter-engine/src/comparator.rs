//! Verdict Comparator - decides whether one test case passed
//!
//! **Normalization Rules (applied to actual and expected output alike):**
//! - Trailing whitespace on every line is stripped (this also absorbs `\r\n`)
//! - A single trailing newline at end of string is stripped
//! - Leading whitespace, internal whitespace and blank lines are preserved
//! - Case sensitive, exact match; no floating-point tolerance
//!
//! Problems needing tolerance must pre-format their expected output.

/// Outcome of comparing one program output with the expected output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub passed: bool,
    /// Actual output after normalization, suitable for display.
    pub normalized_actual: String,
}

/// Normalize output for comparison.
pub fn normalize_output(output: &str) -> String {
    let mut normalized = output
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");

    if normalized.ends_with('\n') {
        normalized.pop();
    }
    normalized
}

/// Compare program output with the expected output.
pub fn compare(actual: &str, expected: &str) -> Comparison {
    let normalized_actual = normalize_output(actual);
    let passed = normalized_actual == normalize_output(expected);
    Comparison {
        passed,
        normalized_actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello"), "hello");
        assert_eq!(normalize_output("hello\n"), "hello");
        assert_eq!(normalize_output("hello  \t\n"), "hello");
        assert_eq!(normalize_output("a \nb\t\n"), "a\nb");
        assert_eq!(normalize_output(""), "");
        assert_eq!(normalize_output("   "), "");
    }

    #[test]
    fn test_only_one_trailing_newline_is_removed() {
        assert_eq!(normalize_output("8\n\n"), "8\n");
        assert!(!compare("8\n\n", "8").passed);
    }

    #[test]
    fn test_leading_whitespace_is_significant() {
        assert_eq!(normalize_output("  hello"), "  hello");
        assert!(!compare("  hello", "hello").passed);
    }

    #[test]
    fn test_exact_match() {
        let result = compare("120", "120");
        assert!(result.passed);
        assert_eq!(result.normalized_actual, "120");
    }

    #[test]
    fn test_crlf_matches_lf() {
        assert!(compare("line1\r\nline2\r\n", "line1\nline2").passed);
    }

    #[test]
    fn test_trailing_spaces_per_line() {
        assert!(compare("1 2 3 \n4 5 6 \n", "1 2 3\n4 5 6\n").passed);
    }

    #[test]
    fn test_internal_whitespace_is_not_collapsed() {
        assert!(!compare("1  2", "1 2").passed);
    }

    #[test]
    fn test_case_sensitivity() {
        assert!(!compare("hello", "Hello").passed);
    }

    #[test]
    fn test_blank_lines_inside_output_are_kept() {
        assert!(compare("a\n\nb\n", "a\n\nb").passed);
        assert!(!compare("a\nb\n", "a\n\nb").passed);
    }

    #[test]
    fn test_no_numeric_tolerance() {
        assert!(!compare("0.3333", "0.333").passed);
        assert!(!compare("1.0", "1").passed);
    }

    #[test]
    fn test_empty_output() {
        assert!(compare("", "").passed);
        assert!(compare("\n", "").passed);
        assert!(!compare("", "0").passed);
    }
}
