//! Completion detection for assistant output.
//!
//! The external assistant signals a finished implementation by printing
//! `IMPLEMENTATION_COMPLETE` in its output, followed by a structured
//! report. Success requires both the sentinel and a zero exit code; the
//! contract with the assistant is conventional, not enforceable here.

/// Token signalling a finished implementation.
pub const COMPLETION_TOKEN: &str = "IMPLEMENTATION_COMPLETE";

/// Parsed outcome of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    /// Sentinel present and exit code zero.
    pub success: bool,
    /// Whether the sentinel appeared anywhere in the output.
    pub token_found: bool,
    /// Paths listed under a `Files changed:` block.
    pub files_changed: Vec<String>,
    /// Text captured from `What was built:` up to a blank line or
    /// `How to verify:`.
    pub summary: String,
}

/// Scan accumulated assistant output for the completion sentinel and the
/// structured report blocks.
pub fn parse_completion(output: &str, exit_ok: bool) -> CompletionReport {
    let token_found = output.contains(COMPLETION_TOKEN);

    let mut files_changed = Vec::new();
    let mut summary_lines: Vec<&str> = Vec::new();

    if token_found {
        let mut lines = output.lines().peekable();
        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.starts_with("Files changed:") {
                while let Some(next) = lines.peek() {
                    let item = next.trim();
                    if let Some(path) = item.strip_prefix('-') {
                        files_changed.push(path.trim().to_string());
                        lines.next();
                    } else {
                        break;
                    }
                }
            } else if trimmed.starts_with("What was built:") {
                for next in lines.by_ref() {
                    let text = next.trim();
                    if text.is_empty() || text.starts_with("How to verify:") {
                        break;
                    }
                    summary_lines.push(text);
                }
            }
        }
    }

    let summary = if summary_lines.is_empty() {
        "Feature implemented".to_string()
    } else {
        summary_lines.join("\n")
    };

    CompletionReport {
        success: exit_ok && token_found,
        token_found,
        files_changed,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Working on it...
IMPLEMENTATION_COMPLETE

Files changed:
- src/theme.rs
- src/settings.rs

What was built:
A dark mode toggle wired into the settings page.
Persisted via the preferences store.

How to verify:
Run the app and flip the toggle.
";

    #[test]
    fn parses_full_report() {
        let report = parse_completion(SAMPLE, true);
        assert!(report.success);
        assert!(report.token_found);
        assert_eq!(report.files_changed, vec!["src/theme.rs", "src/settings.rs"]);
        assert_eq!(
            report.summary,
            "A dark mode toggle wired into the settings page.\nPersisted via the preferences store."
        );
    }

    #[test]
    fn summary_stops_at_blank_line() {
        let output = "IMPLEMENTATION_COMPLETE\nWhat was built:\nOne line.\n\nTrailing noise.";
        let report = parse_completion(output, true);
        assert_eq!(report.summary, "One line.");
    }

    #[test]
    fn missing_token_fails_even_on_zero_exit() {
        let report = parse_completion("all done, probably", true);
        assert!(!report.success);
        assert!(!report.token_found);
        assert!(report.files_changed.is_empty());
        assert_eq!(report.summary, "Feature implemented");
    }

    #[test]
    fn nonzero_exit_fails_even_with_token() {
        let report = parse_completion("IMPLEMENTATION_COMPLETE", false);
        assert!(!report.success);
        assert!(report.token_found);
    }

    #[test]
    fn files_block_without_items_yields_empty_list() {
        let output = "IMPLEMENTATION_COMPLETE\nFiles changed:\nno list here";
        let report = parse_completion(output, true);
        assert!(report.files_changed.is_empty());
    }

    #[test]
    fn empty_output() {
        let report = parse_completion("", true);
        assert!(!report.success);
        assert!(!report.token_found);
    }
}
