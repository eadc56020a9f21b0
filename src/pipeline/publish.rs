//! Change-proposal title and body generation, shaped like the bundle PR
//! bodies the review flow expects.

use crate::agent::FixResult;
use crate::bundling::Bundle;
use crate::checks::CheckRun;

use super::commit::DiffStat;

pub fn generate_pr_title(bundle: &Bundle) -> String {
    if bundle.defects.len() == 1 {
        format!("[AUTO] {}", bundle.defects[0].title)
    } else {
        format!(
            "[AUTO] {}: {} defects",
            bundle.group_value,
            bundle.defects.len()
        )
    }
}

/// Sections: Summary, Issues Fixed (with acceptance criteria), Changes,
/// Verification Checklist, automation footer.
pub fn generate_pr_body(
    bundle: &Bundle,
    fix: Option<&FixResult>,
    check_run: Option<&CheckRun>,
    diff: DiffStat,
) -> String {
    let mut body = String::from("## Summary\n\n");
    match fix {
        Some(fix) if !fix.summary.is_empty() => {
            body.push_str(&fix.summary);
            body.push('\n');
        }
        _ => {
            body.push_str(&format!(
                "Automated remediation of {} defect(s) grouped by {} = `{}`.\n",
                bundle.defects.len(),
                bundle.policy,
                bundle.group_value
            ));
        }
    }

    body.push_str("\n## Issues Fixed\n\n");
    for defect in &bundle.defects {
        body.push_str(&format!("- Fixes #{} - {}\n", defect.id, defect.title));
        for criterion in defect.acceptance_criteria() {
            body.push_str(&format!("  - [ ] {criterion}\n"));
        }
    }

    body.push_str("\n## Changes\n\n");
    let files = fix.map(|f| f.files_changed.as_slice()).unwrap_or_default();
    body.push_str(&format!(
        "{} file(s) changed, +{} / -{}\n",
        if diff.files_changed > 0 {
            diff.files_changed
        } else {
            files.len()
        },
        diff.insertions,
        diff.deletions
    ));
    for file in files {
        body.push_str(&format!("- `{file}`\n"));
    }

    body.push_str("\n## Verification Checklist\n\n");
    match check_run {
        Some(run) if !run.results.is_empty() => {
            for result in &run.results {
                let mark = if result.failed() { " " } else { "x" };
                body.push_str(&format!(
                    "- [{mark}] {} (`{}`)\n",
                    result.kind.as_str(),
                    result.command
                ));
            }
        }
        _ => body.push_str("- [ ] no checks configured\n"),
    }

    body.push_str("\n---\n🤖 Opened automatically by fixwright\n");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundling::{group_defects, GroupPolicy, GroupingOptions};
    use crate::checks::{CheckKind, CheckResult, CheckStatus};
    use crate::defects::test_support::defect;
    use crate::defects::{DefectKind, DefectPriority};

    fn bundle() -> Bundle {
        let mut d1 = defect(11, DefectKind::Bug, DefectPriority::High, "auth");
        d1.body = "- [ ] login survives token refresh".to_string();
        let d2 = defect(12, DefectKind::Bug, DefectPriority::Low, "auth");
        group_defects(&[d1, d2], GroupPolicy::Component, &GroupingOptions::default())
            .bundles
            .remove(0)
    }

    #[test]
    fn body_contains_all_sections() {
        let fix = FixResult {
            success: true,
            summary: "Guard the session refresh path.".to_string(),
            files_changed: vec!["src/auth/session.rs".to_string()],
        };
        let run = CheckRun {
            results: vec![CheckResult {
                kind: CheckKind::Test,
                command: "cargo test".to_string(),
                status: CheckStatus::Passed,
                duration_ms: 1200,
                stderr: String::new(),
            }],
        };
        let body = generate_pr_body(
            &bundle(),
            Some(&fix),
            Some(&run),
            DiffStat {
                files_changed: 1,
                insertions: 4,
                deletions: 1,
            },
        );
        assert!(body.contains("## Summary"));
        assert!(body.contains("Fixes #11"));
        assert!(body.contains("Fixes #12"));
        assert!(body.contains("- [ ] login survives token refresh"));
        assert!(body.contains("+4 / -1"));
        assert!(body.contains("- [x] test"));
        assert!(body.contains("fixwright"));
    }

    #[test]
    fn failed_checks_render_unchecked() {
        let run = CheckRun {
            results: vec![CheckResult {
                kind: CheckKind::Lint,
                command: "npm run lint".to_string(),
                status: CheckStatus::Failed,
                duration_ms: 300,
                stderr: "2 errors".to_string(),
            }],
        };
        let body = generate_pr_body(&bundle(), None, Some(&run), DiffStat::default());
        assert!(body.contains("- [ ] lint"));
    }

    #[test]
    fn title_for_single_and_multi_defect_bundles() {
        let b = bundle();
        assert!(generate_pr_title(&b).contains("2 defects"));

        let single = group_defects(
            &[defect(5, DefectKind::Bug, DefectPriority::High, "core")],
            GroupPolicy::Component,
            &GroupingOptions::default(),
        )
        .bundles
        .remove(0);
        assert_eq!(generate_pr_title(&single), "[AUTO] Defect #5");
    }
}
