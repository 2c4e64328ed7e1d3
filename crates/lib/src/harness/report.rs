//! Scenario results, the one-shot recorder, and the ordered summary report.

use crate::harness::classify::Outcome;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioResult {
    pub name: String,
    pub requested: Vec<String>,
    pub outcome: Outcome,
}

/// Holds the first outcome recorded for a scenario; later ones are ignored.
#[derive(Debug, Default)]
pub struct OutcomeRecorder {
    outcome: Option<Outcome>,
}

impl OutcomeRecorder {
    /// Record `outcome` unless one is already recorded. Returns whether it was taken.
    pub fn record(&mut self, outcome: Outcome) -> bool {
        if self.outcome.is_some() {
            log::debug!("outcome already recorded; ignoring {:?}", outcome);
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    pub fn is_recorded(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn finish(self, name: impl Into<String>, requested: Vec<String>) -> ScenarioResult {
        ScenarioResult {
            name: name.into(),
            requested,
            outcome: self
                .outcome
                .unwrap_or_else(|| Outcome::Failure("no outcome recorded".to_string())),
        }
    }
}

/// Ordered result log for one harness run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessReport {
    results: Vec<ScenarioResult>,
}

impl HarnessReport {
    pub fn push(&mut self, result: ScenarioResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[ScenarioResult] {
        &self.results
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.outcome.is_success()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures() == 0
    }
}

impl fmt::Display for HarnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Test Summary:")?;
        for r in &self.results {
            let mark = if r.outcome.is_success() { "ok  " } else { "FAIL" };
            writeln!(f, "{} {}: {}", mark, r.name, r.outcome)?;
        }
        write!(
            f,
            "{} scenario(s), {} failed",
            self.results.len(),
            self.failures()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_recorded_outcome_wins() {
        let mut rec = OutcomeRecorder::default();
        assert!(!rec.is_recorded());
        assert!(rec.record(Outcome::Failure("Handshake failed: reset".into())));
        assert!(!rec.record(Outcome::Success("json".into())));
        let result = rec.finish("race", vec!["json".into()]);
        assert_eq!(result.outcome, Outcome::Failure("Handshake failed: reset".into()));
        assert_eq!(result.requested, vec!["json".to_string()]);
    }

    #[test]
    fn report_keeps_order_and_renders_summary() {
        let mut report = HarnessReport::default();
        report.push(ScenarioResult {
            name: "Single-valid".into(),
            requested: vec!["json".into()],
            outcome: Outcome::Success("json".into()),
        });
        report.push(ScenarioResult {
            name: "All-unsupported".into(),
            requested: vec!["foo".into(), "bar".into()],
            outcome: Outcome::Failure("No subprotocol negotiated (unsupported)".into()),
        });

        assert_eq!(report.failures(), 1);
        assert!(!report.all_succeeded());
        assert_eq!(report.results()[0].name, "Single-valid");
        assert!(report.get("All-unsupported").is_some());

        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Test Summary:");
        assert_eq!(lines[1], "ok   Single-valid: subprotocol = json");
        assert_eq!(
            lines[2],
            "FAIL All-unsupported: No subprotocol negotiated (unsupported)"
        );
        assert_eq!(lines[3], "2 scenario(s), 1 failed");
    }
}
