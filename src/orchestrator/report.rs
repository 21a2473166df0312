use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::{ExecutionStatus, Isolation};
use crate::parallel::WorkerStats;
use crate::rules::{Severity, ValidationResult};
use crate::shared::serde_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Fresh,
    Cached,
}

/// Final outcome of one targeted rule
#[derive(Debug, Clone, Serialize)]
pub struct RuleOutcome {
    pub result: ValidationResult,
    pub source: ResultSource,
    /// How a fresh execution ended; `None` for cache hits
    pub status: Option<ExecutionStatus>,
    #[serde(rename = "duration_ms", with = "serde_millis")]
    pub duration: Duration,
    pub batch: usize,
    pub worker: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchTiming {
    pub layer: usize,
    pub rules: usize,
    pub workers: usize,
    #[serde(rename = "elapsed_ms", with = "serde_millis")]
    pub elapsed: Duration,
    pub worker_stats: Vec<WorkerStats>,
}

impl BatchTiming {
    pub fn steals(&self) -> usize {
        self.worker_stats.iter().map(|w| w.steals).sum()
    }
}

/// Immutable summary of one validation run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: Uuid,
    pub mode: String,
    /// Unix milliseconds
    pub started_at: u64,
    #[serde(rename = "elapsed_ms", with = "serde_millis")]
    pub elapsed: Duration,
    /// One entry per targeted rule, sorted by rule id
    pub entries: Vec<RuleOutcome>,
    pub passed: usize,
    pub failed: usize,
    /// Failing results per severity
    pub failures_by_severity: BTreeMap<Severity, usize>,
    pub cache_hits: usize,
    pub fresh_executions: usize,
    pub batches: Vec<BatchTiming>,
    pub crashes: usize,
    pub timeouts: usize,
    pub errors: usize,
    pub isolation: Isolation,
    pub isolation_fallback: Option<String>,
    /// Why an incremental run widened to the full catalog
    pub incremental_fallback: Option<String>,
    pub changed_files: usize,
}

impl Report {
    pub(super) fn tally(&mut self) {
        self.entries.sort_by(|a, b| a.result.rule_id.cmp(&b.result.rule_id));
        self.passed = self.entries.iter().filter(|e| e.result.passed).count();
        self.failed = self.entries.len() - self.passed;
        self.cache_hits = self
            .entries
            .iter()
            .filter(|e| e.source == ResultSource::Cached)
            .count();
        self.fresh_executions = self.entries.len() - self.cache_hits;

        self.failures_by_severity.clear();
        for entry in self.entries.iter().filter(|e| !e.result.passed) {
            *self.failures_by_severity.entry(entry.result.severity).or_default() += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, rule_id: &str) -> Option<&RuleOutcome> {
        self.entries
            .binary_search_by(|e| e.result.rule_id.as_str().cmp(rule_id))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Failing entries at or above `threshold`
    pub fn failures_at_or_above(&self, threshold: Severity) -> impl Iterator<Item = &RuleOutcome> {
        self.entries
            .iter()
            .filter(move |e| !e.result.passed && e.result.severity >= threshold)
    }

    /// 0 when nothing at or above `fail_on` failed, else 1
    pub fn exit_code(&self, fail_on: Severity) -> i32 {
        if self.failures_at_or_above(fail_on).next().is_some() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(result: ValidationResult, source: ResultSource) -> RuleOutcome {
        RuleOutcome {
            result,
            source,
            status: None,
            duration: Duration::from_millis(1),
            batch: 0,
            worker: 0,
        }
    }

    fn report(entries: Vec<RuleOutcome>) -> Report {
        let mut report = Report {
            run_id: Uuid::new_v4(),
            mode: "full".to_string(),
            started_at: 0,
            elapsed: Duration::ZERO,
            entries,
            passed: 0,
            failed: 0,
            failures_by_severity: BTreeMap::new(),
            cache_hits: 0,
            fresh_executions: 0,
            batches: Vec::new(),
            crashes: 0,
            timeouts: 0,
            errors: 0,
            isolation: Isolation::Thread,
            isolation_fallback: None,
            incremental_fallback: None,
            changed_files: 0,
        };
        report.tally();
        report
    }

    #[test]
    fn test_tally_and_exit_code() {
        let report = report(vec![
            outcome(ValidationResult::fail("b", Severity::Medium, "x"), ResultSource::Fresh),
            outcome(ValidationResult::pass("a", Severity::High, "ok"), ResultSource::Cached),
            outcome(ValidationResult::fail("c", Severity::High, "x"), ResultSource::Fresh),
        ]);

        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.fresh_executions, 2);
        assert_eq!(report.failures_by_severity[&Severity::High], 1);
        assert_eq!(report.entry("b").unwrap().result.severity, Severity::Medium);

        assert_eq!(report.exit_code(Severity::High), 1);
        assert_eq!(report.exit_code(Severity::Critical), 0);
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let report = report(vec![outcome(
            ValidationResult::pass("a", Severity::Low, "ok"),
            ResultSource::Fresh,
        )]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["entries"][0]["duration_ms"], 1.0);
        assert_eq!(json["entries"][0]["source"], "fresh");
        assert!(json["run_id"].is_string());
    }
}
