//! Prompt construction for the two agent call shapes.

use crate::bundling::Bundle;
use crate::checks::CheckRun;

use super::{bundle_brief, AnalysisResult};

/// Failed-check feedback carried from one attempt into the next fix call.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub failed_checks: Vec<(String, String)>,
}

impl RetryContext {
    pub fn from_check_run(attempt: u32, run: &CheckRun) -> Self {
        Self {
            attempt,
            failed_checks: run
                .failed_checks()
                .into_iter()
                .map(|c| (c.kind.as_str().to_string(), c.stderr.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.failed_checks.is_empty()
    }
}

/// Read-only analysis prompt: asks for the structured root-cause JSON.
pub fn analysis_prompt(bundle: &Bundle) -> String {
    format!(
        "Analyze the following related defects without modifying any file.\n\n\
         {}\n\
         Respond with a single JSON object: {{\"confidence\": 0..1, \
         \"rootCause\": string, \"suggestedFix\": string, \
         \"affectedFiles\": string[] (max 3), \
         \"complexity\": \"low\"|\"medium\"|\"high\"}}.",
        bundle_brief(bundle)
    )
}

/// Write-capable fix prompt, optionally enriched with prior analysis and
/// failed-check feedback from the previous attempt.
pub fn fix_prompt(
    bundle: &Bundle,
    analysis: Option<&AnalysisResult>,
    retry: Option<&RetryContext>,
) -> String {
    let mut prompt = format!(
        "Fix the following related defects in the current working copy.\n\n{}",
        bundle_brief(bundle)
    );

    if let Some(analysis) = analysis {
        prompt.push_str(&format!(
            "\nPrior analysis (confidence {:.2}):\nRoot cause: {}\nSuggested fix: {}\n",
            analysis.confidence, analysis.root_cause, analysis.suggested_fix
        ));
    }

    if let Some(retry) = retry.filter(|r| !r.is_empty()) {
        prompt.push_str(&format!(
            "\nAttempt {} previously failed these checks; address them first:\n",
            retry.attempt
        ));
        for (check, stderr) in &retry.failed_checks {
            prompt.push_str(&format!("--- {check} ---\n{stderr}\n"));
        }
    }

    prompt.push_str(
        "\nWhen done, respond with a single JSON object: \
         {\"success\": bool, \"summary\": string, \"filesChanged\": string[]}.",
    );
    prompt
}
