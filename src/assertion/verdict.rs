use std::fmt;

use crate::assertion::expectations::{AnomalyClass, Expected};
use crate::isolation::TransactionIsolation;

/// Outcome of one anomaly probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub class: AnomalyClass,
    pub expected: Expected,
    /// Whether the anomaly showed up; `None` if the probe's checkpoints were
    /// never reached.
    pub occurred: Option<bool>,
}

impl Finding {
    /// Whether this finding agrees with the expectation table.
    pub fn holds(&self) -> bool {
        match (self.expected, self.occurred) {
            (Expected::EngineDefined, _) => true,
            (_, None) => false,
            (Expected::Exhibited, Some(occurred)) => occurred,
            (Expected::Prevented, Some(occurred)) => !occurred,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observed = match self.occurred {
            Some(true) => "occurred",
            Some(false) => "did not occur",
            None => "not observed",
        };
        write!(f, "{}: expected {}, {}", self.class, self.expected, observed)
    }
}

/// A single disagreement between what the scenario expects and what the run
/// produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Where the disagreement was found: a checkpoint, a step or an anomaly.
    pub subject: String,
    pub expected: String,
    pub observed: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, observed {}",
            self.subject, self.expected, self.observed
        )
    }
}

/// Pass/fail judgement of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub scenario: String,
    pub isolation: TransactionIsolation,
    pub findings: Vec<Finding>,
    pub mismatches: Vec<Mismatch>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Findings for one anomaly class.
    pub fn finding(&self, class: AnomalyClass) -> Option<&Finding> {
        self.findings.iter().find(|finding| finding.class == class)
    }
}

/// Findings and mismatches first, one per line, then the closing
/// `PASS`/`FAIL` line.
impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for finding in &self.findings {
            writeln!(f, "  {}", finding)?;
        }
        for mismatch in &self.mismatches {
            writeln!(f, "  mismatch - {}", mismatch)?;
        }
        let status = if self.passed() { "PASS" } else { "FAIL" };
        write!(f, "{} {} ({})", status, self.scenario, self.isolation)
    }
}
