use crate::types::{ClaimOutcome, RunSummary};

/// Emit a claim outcome as a single JSON line to stdout.
pub fn report_claim(outcome: &ClaimOutcome) {
    if let Ok(json) = serde_json::to_string(outcome) {
        println!("{json}");
    }
}

/// Emit the run summary as pretty-printed JSON to stdout.
pub fn report_summary(summary: &RunSummary) {
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        println!("{json}");
    }
}
