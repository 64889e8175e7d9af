//! Structural validation of synchronized content.
//!
//! Checks never block synchronization. A non-empty report is raised as an
//! `IntegrityWarning` by the session that applied the content.

use crate::merge::has_conflict_markers;
use crate::protocol::DocumentType;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// The text between the brackets of a markdown task item, e.g. `x` for `- [x] done`.
///
/// Returns `None` for lines that are not task items (including bullets that
/// start with a link), and `Some(Err(()))` for a checkbox that is never closed.
pub(crate) fn task_marker(line: &str) -> Option<Result<&str, ()>> {
    let trimmed = line.trim_start();
    let rest = ["- ", "* ", "+ "]
        .iter()
        .find_map(|bullet| trimmed.strip_prefix(bullet))?;
    let inner = rest.strip_prefix('[')?;
    match inner.find(']') {
        Some(end) if inner[..end].chars().count() <= 1 => Some(Ok(&inner[..end])),
        Some(_) => None,
        None if inner.chars().count() <= 1 => Some(Err(())),
        None => None,
    }
}

pub fn check_document(document_type: DocumentType, content: &str) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    if content.trim().is_empty() {
        report.warnings.push("document is empty".to_string());
        return report;
    }

    if has_conflict_markers(content) {
        report
            .errors
            .push("document contains unresolved merge conflict markers".to_string());
    }

    match document_type {
        DocumentType::Config => match serde_json::from_str::<serde_json::Value>(content) {
            Ok(value) if value.is_object() => {}
            Ok(_) => report
                .errors
                .push("configuration must be a JSON object".to_string()),
            Err(e) => report.errors.push(format!("invalid JSON: {e}")),
        },
        DocumentType::Tasks => {
            for (index, line) in content.lines().enumerate() {
                match task_marker(line) {
                    Some(Ok(" " | "x" | "X" | "-")) | None => {}
                    Some(Ok(other)) => report
                        .errors
                        .push(format!("line {}: invalid task checkbox '[{other}]'", index + 1)),
                    Some(Err(())) => report
                        .errors
                        .push(format!("line {}: unterminated task checkbox", index + 1)),
                }
            }
        }
        DocumentType::Requirements | DocumentType::Design => {
            if !content.lines().any(|line| line.starts_with("# ")) {
                report.warnings.push("missing top-level heading".to_string());
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_documents() {
        assert!(check_document(DocumentType::Requirements, "# Requirements\n\n- login").is_clean());
        assert!(check_document(DocumentType::Config, r#"{"name": "alpha"}"#).is_clean());
        assert!(check_document(DocumentType::Tasks, "# Tasks\n- [ ] a\n- [x] b\n  * [X] c\n- [-] d").is_clean());
    }

    #[test]
    fn test_empty_is_warning() {
        let report = check_document(DocumentType::Design, "  \n");
        assert!(report.errors.is_empty());
        assert_eq!(report.warnings, vec!["document is empty".to_string()]);
    }

    #[test]
    fn test_config_rules() {
        let report = check_document(DocumentType::Config, "{ not json");
        assert!(report.errors[0].starts_with("invalid JSON"));

        let report = check_document(DocumentType::Config, "[1, 2]");
        assert_eq!(report.errors, vec!["configuration must be a JSON object".to_string()]);
    }

    #[test]
    fn test_task_checkboxes() {
        let report = check_document(DocumentType::Tasks, "- [ ] ok\n- [?] bad\n- [x");
        assert_eq!(
            report.errors,
            vec![
                "line 2: invalid task checkbox '[?]'".to_string(),
                "line 3: unterminated task checkbox".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_heading() {
        let report = check_document(DocumentType::Requirements, "just text\n## Sub heading");
        assert_eq!(report.warnings, vec!["missing top-level heading".to_string()]);
        assert!(report.errors.is_empty());

        // Tasks need no heading
        assert!(check_document(DocumentType::Tasks, "- [ ] one").is_clean());
    }

    #[test]
    fn test_conflict_markers_are_errors() {
        let content = "# Design\n<<<<<<< local\na\n=======\nb\n>>>>>>> remote";
        let report = check_document(DocumentType::Design, content);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("conflict markers"));
    }

    #[test]
    fn test_task_marker() {
        assert_eq!(task_marker("- [x] done"), Some(Ok("x")));
        assert_eq!(task_marker("   + [ ] pending"), Some(Ok(" ")));
        assert_eq!(task_marker("- plain bullet"), None);
        assert_eq!(task_marker("[x] no bullet"), None);
        assert_eq!(task_marker("- [x"), Some(Err(())));
        assert_eq!(task_marker("- [docs](https://example.com)"), None);
    }
}
