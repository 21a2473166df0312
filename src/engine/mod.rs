//! Execution Engine
//!
//! Runs one rule at a time with a timeout, either on a dedicated thread or
//! in a worker process. Whatever happens to the predicate (timeout, panic,
//! error, dead worker) the caller gets exactly one [`ValidationResult`] back;
//! failures become CRITICAL results and are counted in [`EngineStats`].
//!
//! Process isolation degrades to threads for the rest of the engine's life
//! the first time a worker cannot be spawned or answers in a form the
//! parent does not understand.

pub mod process;
pub mod transport;

use crossbeam::channel::{RecvTimeoutError, bounded};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::rules::{Rule, RuleContext, RuleRegistry, ValidationResult};

pub use process::WorkerCommand;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Thread,
    Process,
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Isolation::Thread => f.write_str("thread"),
            Isolation::Process => f.write_str("process"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Crashed,
    Errored,
}

impl ExecutionStatus {
    /// Only completed executions may be cached
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionStatus::Completed)
    }
}

/// One fresh execution
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: ValidationResult,
    pub status: ExecutionStatus,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Timeouts plus crashed predicates or workers
    pub crashes: usize,
    pub timeouts: usize,
    /// Predicates that returned an error
    pub errors: usize,
    /// Why process isolation was abandoned, if it was
    pub isolation_fallback: Option<String>,
}

enum Outcome {
    Completed(ValidationResult),
    TimedOut,
    Crashed(String),
    Errored(String),
}

pub struct ExecutionEngine {
    registry: Arc<RuleRegistry>,
    context: RuleContext,
    timeout: Duration,
    isolation: Isolation,
    worker: Option<WorkerCommand>,
    fallback: Mutex<Option<String>>,
    crashes: AtomicUsize,
    timeouts: AtomicUsize,
    errors: AtomicUsize,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<RuleRegistry>, context: RuleContext, timeout: Duration) -> Self {
        Self {
            registry,
            context,
            timeout,
            isolation: Isolation::Thread,
            worker: None,
            fallback: Mutex::new(None),
            crashes: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    /// Run rules in worker processes launched through `worker`
    pub fn with_process_isolation(mut self, worker: WorkerCommand) -> Self {
        self.isolation = Isolation::Process;
        self.worker = Some(worker);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Isolation currently in effect
    pub fn isolation(&self) -> Isolation {
        if self.isolation == Isolation::Process && self.fallback_reason().is_none() {
            Isolation::Process
        } else {
            Isolation::Thread
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            crashes: self.crashes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            isolation_fallback: self.fallback_reason(),
        }
    }

    fn fallback_reason(&self) -> Option<String> {
        self.fallback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn degrade(&self, reason: String) {
        let mut fallback = self.fallback.lock().unwrap_or_else(|p| p.into_inner());
        if fallback.is_none() {
            tracing::warn!("Process isolation unavailable ({}); using threads for the rest of the run", reason);
            *fallback = Some(reason);
        }
    }

    /// Execute one rule and account for how it ended
    pub fn execute(&self, rule_id: &str) -> Execution {
        let started = Instant::now();
        let outcome = match self.registry.get(rule_id) {
            Some(rule) => self.run(rule),
            None => Outcome::Errored(format!("rule '{rule_id}' is not registered")),
        };
        let duration = started.elapsed();

        let (status, result) = match outcome {
            Outcome::Completed(mut result) => {
                if result.rule_id != rule_id {
                    tracing::debug!("{} reported itself as {}", rule_id, result.rule_id);
                    result.rule_id = rule_id.to_string();
                }
                (ExecutionStatus::Completed, result)
            }
            Outcome::TimedOut => {
                self.crashes.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{} timed out after {:?}", rule_id, self.timeout);
                let result = ValidationResult::critical(
                    rule_id,
                    format!("rule timed out after {}s", self.timeout.as_secs_f64()),
                )
                .with_evidence("timeout", true)
                .with_evidence("timeout_secs", self.timeout.as_secs_f64());
                (ExecutionStatus::TimedOut, result)
            }
            Outcome::Crashed(reason) => {
                self.crashes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{} crashed: {}", rule_id, reason);
                let result = ValidationResult::critical(rule_id, format!("rule crashed: {reason}"))
                    .with_evidence("crashed", true);
                (ExecutionStatus::Crashed, result)
            }
            Outcome::Errored(message) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{} failed to evaluate: {}", rule_id, message);
                let result = ValidationResult::critical(rule_id, format!("rule failed: {message}"))
                    .with_evidence("error", message);
                (ExecutionStatus::Errored, result)
            }
        };

        Execution {
            result,
            status,
            duration,
        }
    }

    fn run(&self, rule: &Arc<Rule>) -> Outcome {
        if let (Isolation::Process, Some(worker)) = (self.isolation(), &self.worker) {
            if let Some(outcome) = self.run_in_process(rule, worker) {
                return outcome;
            }
        }
        self.run_in_thread(rule.clone())
    }

    fn run_in_thread(&self, rule: Arc<Rule>) -> Outcome {
        let (tx, rx) = bounded(1);
        let context = self.context.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("rule-{}", rule.id))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(&context)));
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return Outcome::Errored(format!("cannot spawn rule thread: {e}"));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(Ok(result))) => Outcome::Completed(result),
            Ok(Ok(Err(e))) => Outcome::Errored(format!("{e:#}")),
            Ok(Err(payload)) => Outcome::Crashed(panic_message(payload.as_ref())),
            // The thread is abandoned; it can only ever send into a closed channel
            Err(RecvTimeoutError::Timeout) => Outcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                Outcome::Crashed("rule thread exited without a result".to_string())
            }
        }
    }

    /// `None` when the process path is unusable and the caller should fall back
    fn run_in_process(&self, rule: &Rule, worker: &WorkerCommand) -> Option<Outcome> {
        let outcome = match process::run_child(worker, &rule.id, self.timeout) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.degrade(format!("{e:#}"));
                return None;
            }
        };

        match outcome {
            process::ChildOutcome::TimedOut => Some(Outcome::TimedOut),
            process::ChildOutcome::Finished { status, stderr, .. } if !status.success() => {
                let tail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
                Some(Outcome::Crashed(format!("worker exited with {status} {tail}").trim_end().to_string()))
            }
            process::ChildOutcome::Finished { stdout, .. } => {
                match transport::decode(&stdout, &rule.id) {
                    Ok(transport::Payload::Result(result)) => Some(Outcome::Completed(result)),
                    Ok(transport::Payload::Error(message)) => Some(Outcome::Errored(message)),
                    Err(e) => {
                        self.degrade(format!("{e:#}"));
                        None
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Severity;
    use crate::snapshot::WalkSnapshot;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, timeout: Duration) -> ExecutionEngine {
        let mut registry = RuleRegistry::default();
        registry
            .register(Rule::new("ok", Severity::Low, |_| {
                Ok(ValidationResult::pass("ok", Severity::Low, "fine"))
            }))
            .unwrap();
        registry
            .register(Rule::new("slow", Severity::Low, |_| {
                std::thread::sleep(Duration::from_secs(3));
                Ok(ValidationResult::pass("slow", Severity::Low, "late"))
            }))
            .unwrap();
        registry
            .register(Rule::new("panics", Severity::Low, |_| panic!("predicate exploded")))
            .unwrap();
        registry
            .register(Rule::new("errors", Severity::Low, |_| Err(anyhow::anyhow!("no access"))))
            .unwrap();
        registry
            .register(Rule::new("misnamed", Severity::Low, |_| {
                Ok(ValidationResult::pass("something-else", Severity::Low, "fine"))
            }))
            .unwrap();

        let context = RuleContext::new(Arc::new(WalkSnapshot::new(dir.path())));
        ExecutionEngine::new(Arc::new(registry), context, timeout)
    }

    #[test]
    fn test_completed_execution() {
        let dir = TempDir::new().unwrap();
        let execution = engine(&dir, Duration::from_secs(5)).execute("ok");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.result.passed);
    }

    #[test]
    fn test_timeout_is_one_critical_result() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Duration::from_millis(100));
        let execution = engine.execute("slow");

        assert_eq!(execution.status, ExecutionStatus::TimedOut);
        assert_eq!(execution.result.severity, Severity::Critical);
        assert!(!execution.result.passed);
        assert_eq!(execution.result.evidence["timeout"].to_json(), true);
        assert!(execution.duration < Duration::from_secs(2));

        let stats = engine.stats();
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    fn test_panic_and_error_are_contained() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Duration::from_secs(5));

        let crashed = engine.execute("panics");
        assert_eq!(crashed.status, ExecutionStatus::Crashed);
        assert!(crashed.result.message.contains("predicate exploded"));

        let errored = engine.execute("errors");
        assert_eq!(errored.status, ExecutionStatus::Errored);
        assert_eq!(errored.result.severity, Severity::Critical);

        let stats = engine.stats();
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_result_id_is_normalized() {
        let dir = TempDir::new().unwrap();
        let execution = engine(&dir, Duration::from_secs(5)).execute("misnamed");
        assert_eq!(execution.result.rule_id, "misnamed");
    }

    #[test]
    fn test_spawn_failure_degrades_to_threads() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Duration::from_secs(5))
            .with_process_isolation(WorkerCommand::new("/nonexistent/ruleguard-worker"));

        let execution = engine.execute("ok");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(engine.isolation(), Isolation::Thread);
        assert!(engine.stats().isolation_fallback.is_some());
    }

    #[cfg(unix)]
    mod unix_workers {
        use super::*;

        fn script(body: &str) -> WorkerCommand {
            // Appended `worker --rule <id>` arrive as $1 $2 $3
            WorkerCommand::new("/bin/sh").arg("-c").arg(body).arg("sh")
        }

        #[test]
        fn test_worker_envelope_is_used() {
            let dir = TempDir::new().unwrap();
            let envelope = transport::encode_result(ValidationResult::fail("ok", Severity::High, "from worker"))
                .unwrap();
            let engine = engine(&dir, Duration::from_secs(5))
                .with_process_isolation(script(&format!("echo '{envelope}'")));

            let execution = engine.execute("ok");
            assert_eq!(execution.status, ExecutionStatus::Completed);
            assert_eq!(execution.result.message, "from worker");
            assert_eq!(engine.isolation(), Isolation::Process);
        }

        #[test]
        fn test_worker_exit_is_a_crash() {
            let dir = TempDir::new().unwrap();
            let engine = engine(&dir, Duration::from_secs(5))
                .with_process_isolation(script("echo dying >&2; exit 3"));

            let execution = engine.execute("ok");
            assert_eq!(execution.status, ExecutionStatus::Crashed);
            assert!(execution.result.message.contains("dying"));
            assert_eq!(engine.stats().crashes, 1);
            assert_eq!(engine.isolation(), Isolation::Process);
        }

        #[test]
        fn test_worker_timeout_is_killed() {
            let dir = TempDir::new().unwrap();
            let engine = engine(&dir, Duration::from_millis(200))
                .with_process_isolation(script("sleep 5"));

            let started = Instant::now();
            let execution = engine.execute("ok");
            assert_eq!(execution.status, ExecutionStatus::TimedOut);
            assert!(started.elapsed() < Duration::from_secs(4));
            assert_eq!(engine.stats().timeouts, 1);
        }

        #[test]
        fn test_unbounded_timeout_waits_for_worker() {
            let dir = TempDir::new().unwrap();
            let engine = engine(&dir, Duration::MAX).with_process_isolation(script("exit 4"));

            let execution = engine.execute("ok");
            assert_eq!(execution.status, ExecutionStatus::Crashed);
            assert_eq!(engine.stats().timeouts, 0);
        }

        #[test]
        fn test_unknown_schema_falls_back() {
            let dir = TempDir::new().unwrap();
            let engine = engine(&dir, Duration::from_secs(5))
                .with_process_isolation(script("echo '{\"schema\":\"pickle/0\",\"rule_id\":\"ok\"}'"));

            let execution = engine.execute("ok");
            assert_eq!(execution.status, ExecutionStatus::Completed);
            assert_eq!(execution.result.message, "fine");
            let stats = engine.stats();
            assert!(stats.isolation_fallback.unwrap().contains("schema"));
        }
    }
}
