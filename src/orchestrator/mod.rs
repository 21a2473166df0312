//! Validation Orchestrator
//!
//! Drives one run end to end:
//!
//! 1. validate the whole catalog (cycles are fatal before anything runs)
//! 2. resolve the target rules, narrowed by change detection for incremental runs
//! 3. plan the targets into dependency batches
//! 4. run each batch on a work-stealing pool, serving cache hits and executing misses
//! 5. fold every outcome into one [`Report`]
//!
//! The orchestrator is the only writer of the result cache and the profile store.

pub mod report;

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::{
    CacheLookup, InputHasher, InputKey, ResultCache, file_key, glob_key, hash_file, hash_listing,
    rule_key,
};
use crate::config::IncrementalConfig;
use crate::engine::{ExecutionEngine, WorkerCommand};
use crate::incremental::{ChangeBase, ChangeDetector, ChangeSet, DependencyMap, VersionControl};
use crate::parallel::{WorkItem, WorkStealingScheduler, default_max_workers, workers};
use crate::plan::BatchPlanner;
use crate::profile::ProfileStore;
use crate::rules::{RuleContext, RuleRegistry, ValidationResult};
use crate::shared::glob::is_glob_pattern;
use crate::shared::{sha256_hex, unix_millis};
use crate::snapshot::{FilesystemSnapshot, RepoTree};

pub use report::{BatchTiming, Report, ResultSource, RuleOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Incremental(ChangeBase),
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Incremental(_) => "incremental",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: RunMode,
    /// 0 uses the CPU count
    pub max_workers: usize,
    pub use_cache: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            mode: RunMode::Full,
            max_workers: 0,
            use_cache: true,
        }
    }
}

/// Resolved target set for one run
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub rules: BTreeSet<String>,
    /// Rules that must run fresh regardless of the cache
    pub forced: BTreeSet<String>,
    pub changes: Option<ChangeSet>,
}

/// Current values of cache input keys for one run. File hashes are
/// memoized so rules sharing a read-set hash each file once.
struct RunInputs<'a> {
    root: PathBuf,
    tree: Arc<RepoTree>,
    upstream: &'a Mutex<HashMap<String, String>>,
    files: Mutex<HashMap<String, String>>,
}

impl InputHasher for RunInputs<'_> {
    fn hash_input(&self, key: &str) -> String {
        match InputKey::parse(key) {
            InputKey::File(path) => {
                if let Some(hash) = lock(&self.files).get(path) {
                    return hash.clone();
                }
                let hash = hash_file(&self.root.join(path));
                lock(&self.files).insert(path.to_string(), hash.clone());
                hash
            }
            InputKey::Glob(pattern) => match self.tree.matching_pattern(pattern) {
                Ok(paths) => hash_listing(paths.iter().map(String::as_str)),
                Err(_) => format!("invalid:{pattern}"),
            },
            InputKey::Rule(id) => lock(self.upstream)
                .get(id)
                .cloned()
                .unwrap_or_else(|| "pending".to_string()),
            InputKey::Unknown(key) => format!("unknown:{key}"),
        }
    }
}

/// Everything a worker needs to settle one rule
struct RunScope<'a> {
    targets: &'a Targets,
    use_cache: bool,
    engine: &'a ExecutionEngine,
    inputs: &'a RunInputs<'a>,
    tree: &'a RepoTree,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Orchestrator {
    registry: Arc<RuleRegistry>,
    snapshot: Arc<dyn FilesystemSnapshot>,
    cache: Arc<ResultCache>,
    profiles: Arc<ProfileStore>,
    planner: BatchPlanner,
    vcs: Option<Arc<dyn VersionControl>>,
    incremental: IncrementalConfig,
    timeout: Duration,
    worker: Option<WorkerCommand>,
    state_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<RuleRegistry>,
        snapshot: Arc<dyn FilesystemSnapshot>,
        cache: Arc<ResultCache>,
        profiles: Arc<ProfileStore>,
    ) -> Self {
        Self {
            registry,
            snapshot,
            cache,
            profiles,
            planner: BatchPlanner::new(),
            vcs: None,
            incremental: IncrementalConfig::default(),
            timeout: Duration::from_secs(60),
            worker: None,
            state_dir: None,
        }
    }

    pub fn with_version_control(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_incremental(mut self, config: IncrementalConfig) -> Self {
        self.incremental = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory holding the cache and profile documents; changes under it are ignored
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Run rules in worker processes launched through `worker`
    pub fn with_process_isolation(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn planner(&self) -> &BatchPlanner {
        &self.planner
    }

    /// Map a change base to affected rules without running anything
    pub fn detect_changes(&self, base: &ChangeBase) -> Result<ChangeSet> {
        let map = DependencyMap::from_registry(&self.registry, &self.incremental)?;
        let Some(vcs) = &self.vcs else {
            return Ok(ChangeSet::full("no version control available", Vec::new()));
        };
        let mut detector = ChangeDetector::new(
            vcs.clone(),
            self.snapshot.root(),
            self.incremental.vcs_timeout(),
        );
        if let Some(dir) = &self.state_dir {
            detector = detector.exclude_dir(dir);
        }
        Ok(detector.detect(base, &map))
    }

    /// Rules a run in `mode` has to produce results for
    pub fn resolve_targets(&self, mode: &RunMode) -> Result<Targets> {
        let all: BTreeSet<String> = self.registry.ids().into_iter().collect();
        let RunMode::Incremental(base) = mode else {
            return Ok(Targets {
                rules: all,
                ..Targets::default()
            });
        };

        let changes = self.detect_changes(base)?;
        if changes.is_full() {
            return Ok(Targets {
                rules: all,
                forced: BTreeSet::new(),
                changes: Some(changes),
            });
        }

        // Upstream rules feed the cache keys of affected rules, so they are
        // targeted too, but only the affected set bypasses the cache
        let rules = self.registry.with_prerequisites(&changes.closed);
        Ok(Targets {
            rules,
            forced: changes.closed.clone(),
            changes: Some(changes),
        })
    }

    /// Cache input keys of a rule: its read-set plus upstream results
    fn input_keys(&self, rule_id: &str, tree: &RepoTree) -> Vec<String> {
        let mut keys = BTreeSet::new();
        for read in self.registry.read_set(rule_id) {
            if is_glob_pattern(read) {
                keys.insert(glob_key(read));
                if let Ok(paths) = tree.matching_pattern(read) {
                    keys.extend(paths.iter().map(|p| file_key(p)));
                }
            } else {
                keys.insert(file_key(read));
            }
        }
        if let Some(rule) = self.registry.get(rule_id) {
            keys.extend(rule.depends_on.iter().map(|d| rule_key(d)));
        }
        keys.into_iter().collect()
    }

    /// Identity of a rule's definition for cache validation
    fn signature(&self, rule_id: &str) -> String {
        let Some(rule) = self.registry.get(rule_id) else {
            return String::new();
        };
        let material = serde_json::json!({
            "signature": rule.signature,
            "severity": rule.severity,
            "depends_on": rule.depends_on,
            "reads": self.registry.read_set(rule_id),
        });
        sha256_hex(material.to_string().as_bytes())
    }

    fn build_engine(&self) -> ExecutionEngine {
        let context = RuleContext::new(self.snapshot.clone());
        let engine = ExecutionEngine::new(self.registry.clone(), context, self.timeout);
        match &self.worker {
            Some(worker) => engine.with_process_isolation(worker.clone()),
            None => engine,
        }
    }

    pub fn run(&self, request: &RunRequest) -> Result<Report> {
        let started = Instant::now();
        let started_at = unix_millis();

        let edges = self.registry.edges();
        self.planner.plan(&self.registry.ids(), &edges)?;

        let targets = self.resolve_targets(&request.mode)?;
        let target_ids: Vec<String> = targets.rules.iter().cloned().collect();
        let plan = self.planner.plan(&target_ids, &edges)?;

        let max_workers = default_max_workers(request.max_workers);
        tracing::info!(
            "Validating {} of {} rules in {} batches (max {} workers)",
            plan.rule_count(),
            self.registry.len(),
            plan.batches.len(),
            max_workers
        );

        let engine = self.build_engine();
        let tree = self.snapshot.structure();
        let upstream = Mutex::new(HashMap::new());
        let inputs = RunInputs {
            root: self.snapshot.root().to_path_buf(),
            tree: tree.clone(),
            upstream: &upstream,
            files: Mutex::new(HashMap::new()),
        };

        let scope = RunScope {
            targets: &targets,
            use_cache: request.use_cache,
            engine: &engine,
            inputs: &inputs,
            tree: &tree,
        };

        let mut entries = Vec::with_capacity(plan.rule_count());
        let mut batches = Vec::with_capacity(plan.batches.len());

        for batch in &plan.batches {
            let batch_started = Instant::now();
            let pool = workers(batch.len(), max_workers);
            let items = batch
                .rule_ids
                .iter()
                .map(|id| WorkItem::new(id.clone(), self.profiles.estimate(id)))
                .collect();

            tracing::debug!("Batch {}: {} rules on {} workers", batch.layer, batch.len(), pool);
            let outcome = WorkStealingScheduler::new(pool).run(items, |item, worker| {
                self.process_rule(&scope, &item.rule_id, batch.layer, worker)
            })?;

            {
                let mut upstream = lock(&upstream);
                for entry in &outcome.results {
                    upstream.insert(entry.result.rule_id.clone(), entry.result.digest());
                }
            }
            entries.extend(outcome.results);
            batches.push(BatchTiming {
                layer: batch.layer,
                rules: batch.len(),
                workers: outcome.workers.len(),
                elapsed: batch_started.elapsed(),
                worker_stats: outcome.workers,
            });
        }

        // Every targeted rule gets exactly one entry
        let reported: BTreeSet<&str> = entries.iter().map(|e| e.result.rule_id.as_str()).collect();
        let missing: Vec<String> = targets
            .rules
            .iter()
            .filter(|id| !reported.contains(id.as_str()))
            .cloned()
            .collect();
        for id in missing {
            tracing::error!("{} was targeted but never dispatched", id);
            entries.push(RuleOutcome {
                result: ValidationResult::critical(&id, "rule was not dispatched"),
                source: ResultSource::Fresh,
                status: None,
                duration: Duration::ZERO,
                batch: 0,
                worker: 0,
            });
        }

        if let Err(e) = self.cache.save() {
            tracing::warn!("Failed to save result cache: {:#}", e);
        }
        if let Err(e) = self.profiles.save() {
            tracing::warn!("Failed to save execution profiles: {:#}", e);
        }

        let stats = engine.stats();
        let changes = targets.changes.unwrap_or_default();
        let mut report = Report {
            run_id: uuid::Uuid::new_v4(),
            mode: request.mode.name().to_string(),
            started_at,
            elapsed: started.elapsed(),
            entries,
            passed: 0,
            failed: 0,
            failures_by_severity: Default::default(),
            cache_hits: 0,
            fresh_executions: 0,
            batches,
            crashes: stats.crashes,
            timeouts: stats.timeouts,
            errors: stats.errors,
            isolation: engine.isolation(),
            isolation_fallback: stats.isolation_fallback,
            incremental_fallback: changes.full,
            changed_files: changes.changed.len(),
        };
        report.tally();

        tracing::info!(
            "Run {} finished in {:?}: {} passed, {} failed, {} cached, {} fresh",
            report.run_id,
            report.elapsed,
            report.passed,
            report.failed,
            report.cache_hits,
            report.fresh_executions
        );
        Ok(report)
    }

    fn process_rule(&self, scope: &RunScope<'_>, rule_id: &str, batch: usize, worker: usize) -> RuleOutcome {
        let started = Instant::now();
        let keys = self.input_keys(rule_id, scope.tree);
        let signature = self.signature(rule_id);

        if scope.use_cache && !scope.targets.forced.contains(rule_id) {
            if let CacheLookup::Hit(result) = self.cache.lookup(rule_id, &signature, scope.inputs) {
                return RuleOutcome {
                    result,
                    source: ResultSource::Cached,
                    status: None,
                    duration: started.elapsed(),
                    batch,
                    worker,
                };
            }
        }

        let execution = scope.engine.execute(rule_id);
        self.profiles.update(rule_id, execution.duration);
        if execution.status.is_completed() {
            self.cache.store(&execution.result, &signature, &keys, scope.inputs);
        }

        RuleOutcome {
            result: execution.result,
            source: ResultSource::Fresh,
            status: Some(execution.status),
            duration: execution.duration,
            batch,
            worker,
        }
    }
}
