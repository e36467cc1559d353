/// The per-level expectation table.
pub mod expectations;
/// Verdicts and their report form.
pub mod verdict;

use ahash::AHashMap as HashMap;

use crate::data_store::observation_log::{Captured, Observation};
use crate::data_store::value::Value;
use crate::scenario::{Detection, Scenario, StepId};

pub use expectations::{AnomalyClass, Expected, expectation};
pub use verdict::{Finding, Mismatch, Verdict};

/// Judges a run of `scenario` from its observations.
///
/// Pure and deterministic: timestamps are ignored and the result depends only
/// on the scenario and the captured values.
///
/// A verdict fails when
/// * a probe contradicts the expectation table for the scenario's level,
/// * a probe's checkpoint was never reached (or never produced a value),
/// * a value expectation is not met,
/// * a step allowed to fail completed normally.
pub fn evaluate(scenario: &Scenario, observations: &[Observation]) -> Verdict {
    let by_checkpoint: HashMap<&str, &Observation> = observations
        .iter()
        .filter_map(|o| o.checkpoint.as_deref().map(|name| (name, o)))
        .collect();
    let by_step: HashMap<&StepId, &Observation> =
        observations.iter().map(|o| (&o.step, o)).collect();

    let mut findings = Vec::new();
    let mut mismatches = Vec::new();

    for probe in scenario.probes() {
        let expected = expectation(scenario.isolation(), probe.class);
        let occurred = detect(&probe.detection, &by_checkpoint);
        let finding = Finding {
            class: probe.class,
            expected,
            occurred,
        };
        if !finding.holds() {
            mismatches.push(Mismatch {
                subject: probe.class.to_string(),
                expected: expected.to_string(),
                observed: match occurred {
                    Some(true) => "it occurred".to_string(),
                    Some(false) => "it did not occur".to_string(),
                    None => "its checkpoints were not reached".to_string(),
                },
            });
        }
        findings.push(finding);
    }

    for expectation in scenario.expected_values() {
        let observed = by_checkpoint
            .get(expectation.checkpoint.as_str())
            .map(|o| &o.captured);
        let holds = observed
            .and_then(Captured::value)
            .is_some_and(|value| value.matches(&expectation.value));
        if !holds {
            mismatches.push(Mismatch {
                subject: format!("checkpoint '{}'", expectation.checkpoint),
                expected: expectation.value.to_string(),
                observed: observed.map_or_else(|| "nothing".to_string(), ToString::to_string),
            });
        }
    }

    for participant in scenario.participants() {
        for (index, step) in participant.steps.iter().enumerate() {
            let Some(failure) = step.expect else {
                continue;
            };
            let id = StepId {
                participant: participant.id.clone(),
                index,
            };
            match by_step.get(&id).map(|o| &o.captured) {
                Some(Captured::Failed(err)) if failure.accepts(err.class) => {}
                Some(captured) => mismatches.push(Mismatch {
                    subject: format!("step {} ({})", id, step.action),
                    expected: failure.to_string(),
                    observed: captured.to_string(),
                }),
                None => mismatches.push(Mismatch {
                    subject: format!("step {} ({})", id, step.action),
                    expected: failure.to_string(),
                    observed: "step never ran".to_string(),
                }),
            }
        }
    }

    Verdict {
        scenario: scenario.name().to_string(),
        isolation: scenario.isolation(),
        findings,
        mismatches,
    }
}

/// Whether the anomaly described by `detection` occurred; `None` if the
/// required checkpoints are missing.
///
/// A read the engine refused (the step failed as expected, or was skipped
/// because its transaction had already been refused) saw nothing, so a
/// read-based anomaly did not occur.
fn detect(detection: &Detection, by_checkpoint: &HashMap<&str, &Observation>) -> Option<bool> {
    match detection {
        Detection::ReadsValue { checkpoint, value } => {
            let read = read_at(by_checkpoint, checkpoint)?;
            Some(read.is_some_and(|read| read.matches(value)))
        }
        Detection::Changes { first, second } => {
            let first = read_at(by_checkpoint, first)?;
            let second = read_at(by_checkpoint, second)?;
            Some(match (first, second) {
                (Some(first), Some(second)) => !first.matches(&second),
                _ => false,
            })
        }
        Detection::Fails {
            checkpoint,
            failure,
        } => by_checkpoint
            .get(checkpoint.as_str())
            .map(|o| match &o.captured {
                Captured::Failed(err) => failure.accepts(err.class),
                _ => false,
            }),
    }
}

/// `Some(None)` when the read at `checkpoint` was refused.
fn read_at(by_checkpoint: &HashMap<&str, &Observation>, checkpoint: &str) -> Option<Option<Value>> {
    let observation = by_checkpoint.get(checkpoint)?;
    match &observation.captured {
        Captured::Failed(_) | Captured::Skipped => Some(None),
        captured => captured.value().map(Some),
    }
}
