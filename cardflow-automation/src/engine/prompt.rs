//! Worker prompts and evaluation verdicts.

use crate::model::{BoardState, Card};
use crate::worker::WorkerReport;

/// Marker an evaluation worker uses to accept the result.
pub const PASS_MARKER: &str = "RESULT: PASS";

/// Marker an evaluation worker uses to reject the result.
pub const FAIL_MARKER: &str = "RESULT: FAIL";

const DEFAULT_FAIL_REASON: &str = "Evaluation failed";

/// Prompt for the execution worker.
pub fn build_execution_prompt(state: &BoardState, card: &Card) -> String {
    let mut prompt = String::new();
    if !state.execution_prompt.trim().is_empty() {
        prompt.push_str(state.execution_prompt.trim());
        prompt.push_str("\n\n");
    }
    push_card(&mut prompt, card);
    prompt
}

/// Prompt for the evaluation worker.
pub fn build_evaluation_prompt(state: &BoardState, card: &Card, report: &WorkerReport) -> String {
    let mut prompt = String::new();
    let instructions = state.effective_evaluation_prompt().trim();
    if !instructions.is_empty() {
        prompt.push_str(instructions);
        prompt.push_str("\n\n");
    }
    push_card(&mut prompt, card);

    prompt.push_str("\n\n## Execution Summary\n\n");
    if report.summary.trim().is_empty() {
        prompt.push_str("(no summary)");
    } else {
        prompt.push_str(report.summary.trim());
    }

    if !report.files_modified.is_empty() {
        prompt.push_str("\n\n## Files Modified\n");
        for file in &report.files_modified {
            prompt.push_str("\n- ");
            prompt.push_str(file);
        }
    }

    prompt.push_str(&format!(
        "\n\nEvaluate whether the work above satisfies the card. \
         Reply with `{PASS_MARKER}` if it does, or `{FAIL_MARKER} - <reason>` if it does not."
    ));
    prompt
}

fn push_card(prompt: &mut String, card: &Card) {
    prompt.push_str("## Card: ");
    prompt.push_str(&card.title);
    if !card.body.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(card.body.trim());
    }
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

impl Verdict {
    /// Parse an evaluation summary. Anything without the pass marker fails.
    pub fn parse(summary: &str) -> Self {
        if summary.contains(PASS_MARKER) {
            return Self::Pass;
        }

        let text = summary.trim();
        let reason = text
            .strip_prefix(FAIL_MARKER)
            .map(|rest| rest.trim_start().trim_start_matches(['-', ':']).trim())
            .unwrap_or(text);

        if reason.is_empty() {
            Self::Fail(DEFAULT_FAIL_REASON.to_string())
        } else {
            Self::Fail(reason.to_string())
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn state() -> BoardState {
        BoardState::new("review", "Review", 1).automatic("Implement the feature.")
    }

    fn card() -> Card {
        Card::new("b1", "Add login", "review", "lane").with_body("Users sign in with email.")
    }

    #[test_case("RESULT: PASS" => Verdict::Pass ; "bare pass")]
    #[test_case("All good.\nRESULT: PASS\n" => Verdict::Pass ; "pass anywhere")]
    #[test_case("RESULT: FAIL - tests are red" => Verdict::Fail("tests are red".into()) ; "fail with dash")]
    #[test_case("RESULT: FAIL: missing docs" => Verdict::Fail("missing docs".into()) ; "fail with colon")]
    #[test_case("  RESULT: FAIL  " => Verdict::Fail("Evaluation failed".into()) ; "fail without reason")]
    #[test_case("" => Verdict::Fail("Evaluation failed".into()) ; "empty summary")]
    #[test_case("Looks incomplete" => Verdict::Fail("Looks incomplete".into()) ; "no marker")]
    fn test_parse_verdict(summary: &str) -> Verdict {
        Verdict::parse(summary)
    }

    #[test]
    fn test_execution_prompt() {
        let prompt = build_execution_prompt(&state(), &card());
        assert!(prompt.starts_with("Implement the feature."));
        assert!(prompt.contains("## Card: Add login"));
        assert!(prompt.ends_with("Users sign in with email."));
    }

    #[test]
    fn test_evaluation_prompt_falls_back_to_execution_prompt() {
        let report = WorkerReport {
            summary: "Added the form".into(),
            files_modified: vec!["src/login.rs".into()],
        };
        let prompt = build_evaluation_prompt(&state(), &card(), &report);
        assert!(prompt.starts_with("Implement the feature."));
        assert!(prompt.contains("Added the form"));
        assert!(prompt.contains("- src/login.rs"));
        assert!(prompt.contains(PASS_MARKER));

        let custom = state().with_evaluation_prompt("Check the login flow.");
        let prompt = build_evaluation_prompt(&custom, &card(), &WorkerReport::default());
        assert!(prompt.starts_with("Check the login flow."));
        assert!(prompt.contains("(no summary)"));
        assert!(!prompt.contains("## Files Modified"));
    }
}
