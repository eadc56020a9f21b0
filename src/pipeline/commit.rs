//! Commit-message generation for a bundle's change.
//!
//! Header shape is `type(scope): subject` with the conventional type drawn
//! from the bundle's most common defect kind. The generator and validator
//! are kept in lockstep: a generated message always validates.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::defects::{Defect, DefectKind};

const SUBJECT_MAX_LEN: usize = 72;

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(fix|feat|refactor|docs|test|chore)\(([A-Za-z0-9._/-]+)\): (.+)$")
        .expect("header pattern is valid")
});

/// Net diff counts used in message/proposal bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffStat {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

/// Parse `git diff --shortstat` output, e.g.
/// ` 3 files changed, 14 insertions(+), 2 deletions(-)`.
pub fn parse_shortstat(output: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for part in output.trim().split(',') {
        let part = part.trim();
        let Some(number) = part.split_whitespace().next().and_then(|n| n.parse().ok()) else {
            continue;
        };
        if part.contains("file") {
            stat.files_changed = number;
        } else if part.contains("insertion") {
            stat.insertions = number;
        } else if part.contains("deletion") {
            stat.deletions = number;
        }
    }
    stat
}

/// Most common defect kind; ties break toward the earliest defect.
fn dominant_kind(defects: &[Defect]) -> DefectKind {
    let mut counts: HashMap<DefectKind, usize> = HashMap::new();
    for d in defects {
        *counts.entry(d.kind).or_insert(0) += 1;
    }
    // max_by_key keeps the last maximum, so iterate back-to-front to make
    // ties break toward the earliest defect.
    defects
        .iter()
        .rev()
        .map(|d| d.kind)
        .max_by_key(|k| counts.get(k).copied().unwrap_or(0))
        .unwrap_or(DefectKind::Bug)
}

/// Scope for the header: the defects' single shared component, the literal
/// `multiple`, or the first directory of the first changed file.
fn derive_scope(defects: &[Defect], changed_files: &[String]) -> String {
    let mut components: Vec<&str> = Vec::new();
    for d in defects {
        if let Some(c) = d.component() {
            if !components.contains(&c) {
                components.push(c);
            }
        }
    }
    match components.as_slice() {
        [single] => sanitize_scope(single),
        [] => changed_files
            .first()
            .and_then(|f| f.split('/').next())
            .map(sanitize_scope)
            .unwrap_or_else(|| "repo".to_string()),
        _ => "multiple".to_string(),
    }
}

fn sanitize_scope(raw: &str) -> String {
    let scope: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._/-".contains(c) {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if scope.is_empty() {
        "repo".to_string()
    } else {
        scope
    }
}

fn subject(defects: &[Defect]) -> String {
    let raw = if defects.len() == 1 {
        let mut title = defects[0].title.trim().to_string();
        if let Some(first) = title.get(0..1) {
            let lowered = first.to_ascii_lowercase();
            title.replace_range(0..1, &lowered);
        }
        title
    } else {
        let kind = dominant_kind(defects);
        format!("resolve {} {} issues", defects.len(), kind)
    };
    truncate_subject(&raw)
}

fn truncate_subject(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        return "apply automated fix".to_string();
    }
    if cleaned.chars().count() <= SUBJECT_MAX_LEN {
        return cleaned;
    }
    let truncated: String = cleaned.chars().take(SUBJECT_MAX_LEN - 1).collect();
    // Cut back to a word boundary when one exists.
    let cut = truncated.rfind(' ').unwrap_or(truncated.len());
    format!("{}…", truncated[..cut].trim_end())
}

/// Generate the full commit message: header, body listing files and issue
/// ids, and a `Fixes` footer.
pub fn generate_commit_message(defects: &[Defect], changed_files: &[String]) -> String {
    let kind = dominant_kind(defects);
    let scope = derive_scope(defects, changed_files);
    let header = format!("{}({}): {}", kind.commit_type(), scope, subject(defects));

    let mut message = header;
    message.push_str("\n\n");
    if !changed_files.is_empty() {
        message.push_str("Files changed:\n");
        for file in changed_files {
            message.push_str(&format!("- {file}\n"));
        }
    }
    if !defects.is_empty() {
        message.push_str("Issues:\n");
        for d in defects {
            message.push_str(&format!("- #{} {}\n", d.id, d.title));
        }
        let refs: Vec<String> = defects.iter().map(|d| format!("#{}", d.id)).collect();
        message.push_str(&format!("\nFixes {}\n", refs.join(", ")));
    }
    message
}

/// Validate a commit message against the generated shape.
pub fn validate_commit_message(message: &str) -> bool {
    let Some(header) = message.lines().next() else {
        return false;
    };
    let Some(captures) = HEADER_RE.captures(header) else {
        return false;
    };
    if captures[3].chars().count() > SUBJECT_MAX_LEN {
        return false;
    }
    // A Fixes footer, when present, must reference at least one issue.
    if let Some(footer) = message.lines().rev().find(|l| l.starts_with("Fixes ")) {
        if !footer.contains('#') {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defects::test_support::defect;
    use crate::defects::DefectPriority;

    #[test]
    fn single_bug_in_one_component() {
        let defects = vec![defect(1, DefectKind::Bug, DefectPriority::High, "auth")];
        let message = generate_commit_message(&defects, &["src/auth/mod.rs".to_string()]);
        assert!(message.starts_with("fix(auth): "));
        assert!(message.contains("Fixes #1"));
        assert!(validate_commit_message(&message));
    }

    #[test]
    fn multiple_components_use_literal_multiple() {
        let defects = vec![
            defect(1, DefectKind::Bug, DefectPriority::High, "auth"),
            defect(2, DefectKind::Bug, DefectPriority::Low, "billing"),
        ];
        let message = generate_commit_message(&defects, &[]);
        assert!(message.starts_with("fix(multiple): "));
        assert!(validate_commit_message(&message));
    }

    #[test]
    fn no_component_falls_back_to_first_directory() {
        let mut d = defect(3, DefectKind::Docs, DefectPriority::Low, "x");
        d.context.component = None;
        let message = generate_commit_message(
            &[d],
            &["docs/guide.md".to_string(), "src/lib.rs".to_string()],
        );
        assert!(message.starts_with("docs(docs): "), "got: {message}");
        assert!(validate_commit_message(&message));
    }

    #[test]
    fn dominant_kind_decides_commit_type() {
        let defects = vec![
            defect(1, DefectKind::Feature, DefectPriority::High, "api"),
            defect(2, DefectKind::Feature, DefectPriority::Low, "api"),
            defect(3, DefectKind::Bug, DefectPriority::Low, "api"),
        ];
        let message = generate_commit_message(&defects, &[]);
        assert!(message.starts_with("feat(api): "));
    }

    #[test]
    fn long_titles_are_truncated_to_valid_subjects() {
        let mut d = defect(9, DefectKind::Bug, DefectPriority::High, "core");
        d.title = "a".repeat(300);
        let message = generate_commit_message(&[d], &[]);
        assert!(validate_commit_message(&message));
        let header = message.lines().next().unwrap();
        let subject = header.split_once(": ").unwrap().1;
        assert!(subject.chars().count() <= SUBJECT_MAX_LEN);
    }

    #[test]
    fn generated_messages_always_validate() {
        // A small grid of shapes; the property test in tests/ covers more.
        for n in 1..=4u64 {
            let defects: Vec<_> = (1..=n)
                .map(|i| defect(i, DefectKind::Chore, DefectPriority::Medium, "tools"))
                .collect();
            let files: Vec<String> = (0..n).map(|i| format!("src/f{i}.rs")).collect();
            let message = generate_commit_message(&defects, &files);
            assert!(validate_commit_message(&message), "failed for: {message}");
        }
    }

    #[test]
    fn validator_rejects_malformed_headers() {
        assert!(!validate_commit_message(""));
        assert!(!validate_commit_message("fix: no scope"));
        assert!(!validate_commit_message("wat(auth): unknown type"));
        assert!(!validate_commit_message("fix(auth):missing space"));
        assert!(!validate_commit_message(&format!(
            "fix(auth): {}",
            "x".repeat(100)
        )));
        assert!(!validate_commit_message("fix(au th): bad scope chars"));
    }

    #[test]
    fn shortstat_parsing() {
        let stat = parse_shortstat(" 3 files changed, 14 insertions(+), 2 deletions(-)");
        assert_eq!(stat.files_changed, 3);
        assert_eq!(stat.insertions, 14);
        assert_eq!(stat.deletions, 2);

        let stat = parse_shortstat(" 1 file changed, 1 insertion(+)");
        assert_eq!(stat.files_changed, 1);
        assert_eq!(stat.insertions, 1);
        assert_eq!(stat.deletions, 0);

        assert_eq!(parse_shortstat("").files_changed, 0);
    }
}
