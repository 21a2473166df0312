//! Change Detector and Incremental Dependency Map
//!
//! Narrows a run to the rules a change set can affect. Changed paths come
//! from a [`VersionControl`] collaborator; they are mapped to rules through a
//! glob table built from every rule's read-set (plus configured extras), and
//! the result is closed under "pulls in dependents".
//!
//! Every uncertain situation widens instead of narrowing: a failing or slow
//! VCS query, an unnormalizable path, a closure that does not settle within
//! the iteration cap, or a closure covering too much of the catalog all turn
//! the run into a full one. The result cache still validates every hit on
//! its own, so narrowing only ever saves work.

use anyhow::{Context, Result, anyhow, bail};
use crossbeam::channel::{RecvTimeoutError, bounded};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::IncrementalConfig;
use crate::rules::RuleRegistry;
use crate::shared::glob::path_key;

/// What to compare against when asking for changed paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeBase {
    /// Staged, unstaged and untracked changes against HEAD
    WorkingTree,
    /// Index against HEAD only
    Staged,
    /// `base..target`, or `base` against the working tree when `target` is unset
    Range { base: String, target: Option<String> },
}

impl std::fmt::Display for ChangeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeBase::WorkingTree => f.write_str("working tree"),
            ChangeBase::Staged => f.write_str("staged changes"),
            ChangeBase::Range { base, target: Some(target) } => write!(f, "{base}..{target}"),
            ChangeBase::Range { base, target: None } => write!(f, "{base}..working tree"),
        }
    }
}

/// Source of changed paths. Paths may be absolute or relative to the
/// validated root.
pub trait VersionControl: Send + Sync {
    fn changed_paths(&self, base: &ChangeBase) -> Result<Vec<PathBuf>>;
}

/// Outcome of change detection for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Changed paths, repository-relative and sorted
    pub changed: Vec<String>,
    /// Rules matched directly by the changed paths
    pub direct: BTreeSet<String>,
    /// `direct` closed under the dependents relation
    pub closed: BTreeSet<String>,
    /// Set when the run must fall back to the full catalog
    pub full: Option<String>,
}

impl ChangeSet {
    pub fn full(reason: impl Into<String>, changed: Vec<String>) -> Self {
        Self {
            changed,
            full: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_full(&self) -> bool {
        self.full.is_some()
    }
}

/// Why narrowing gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Widening {
    IterationCap(usize),
    TooBroad { affected: usize, catalog: usize },
}

impl std::fmt::Display for Widening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Widening::IterationCap(cap) => {
                write!(f, "dependency expansion did not settle within {cap} iterations")
            }
            Widening::TooBroad { affected, catalog } => {
                write!(f, "{affected} of {catalog} rules affected")
            }
        }
    }
}

/// Static glob -> rules table plus the rule -> dependents relation
#[derive(Debug, Clone)]
pub struct DependencyMap {
    globs: GlobSet,
    /// Rule sets, parallel to the globs in `globs`
    targets: Vec<BTreeSet<String>>,
    patterns: Vec<String>,
    always_run: BTreeSet<String>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    catalog_size: usize,
    max_iterations: usize,
    max_fraction: f64,
}

impl DependencyMap {
    pub fn from_registry(registry: &RuleRegistry, config: &IncrementalConfig) -> Result<Self> {
        let mut table: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for rule in registry.iter() {
            for glob in registry.read_set(&rule.id) {
                table.entry(glob.clone()).or_default().insert(rule.id.clone());
            }
        }
        for (glob, ids) in &config.patterns {
            let known = ids.iter().filter(|id| {
                let found = registry.contains(id);
                if !found {
                    tracing::warn!("incremental.patterns '{}' names unknown rule '{}'", glob, id);
                }
                found
            });
            table.entry(glob.clone()).or_default().extend(known.cloned());
        }

        let mut dependents = registry.dependents();
        for (upstream, downstream) in &config.links {
            if !registry.contains(upstream) {
                tracing::warn!("incremental.links names unknown rule '{}'", upstream);
                continue;
            }
            dependents
                .entry(upstream.clone())
                .or_default()
                .extend(downstream.iter().filter(|id| registry.contains(id)).cloned());
        }

        let always_run = config
            .always_run
            .iter()
            .filter(|id| registry.contains(id))
            .cloned()
            .collect();

        let mut builder = GlobSetBuilder::new();
        let mut targets = Vec::with_capacity(table.len());
        let mut patterns = Vec::with_capacity(table.len());
        for (glob, ids) in table {
            builder.add(
                Glob::new(&glob).with_context(|| format!("Invalid read-set glob: {glob}"))?,
            );
            patterns.push(glob);
            targets.push(ids);
        }

        Ok(Self {
            globs: builder.build()?,
            targets,
            patterns,
            always_run,
            dependents,
            catalog_size: registry.len(),
            max_iterations: config.max_iterations.max(1),
            max_fraction: config.max_fraction,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn always_run(&self) -> &BTreeSet<String> {
        &self.always_run
    }

    /// Rules whose read-set matches any changed path. Paths no glob knows
    /// about pull in the always-run set.
    pub fn direct(&self, changed: &[String]) -> BTreeSet<String> {
        let mut direct = BTreeSet::new();
        for path in changed {
            let hits = self.globs.matches(path);
            if hits.is_empty() {
                tracing::debug!("{} matches no read-set, using always-run rules", path);
                direct.extend(self.always_run.iter().cloned());
            }
            for i in hits {
                direct.extend(self.targets[i].iter().cloned());
            }
        }
        direct
    }

    /// Fixed-point expansion over the dependents relation
    pub fn close(&self, direct: &BTreeSet<String>) -> std::result::Result<BTreeSet<String>, Widening> {
        let mut closed = direct.clone();
        let mut frontier: Vec<String> = direct.iter().cloned().collect();
        let mut rounds = 0;

        loop {
            let mut next = Vec::new();
            for id in &frontier {
                if let Some(downstream) = self.dependents.get(id) {
                    for dep in downstream {
                        if closed.insert(dep.clone()) {
                            next.push(dep.clone());
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            rounds += 1;
            if rounds > self.max_iterations {
                return Err(Widening::IterationCap(self.max_iterations));
            }
            frontier = next;
        }

        if self.catalog_size > 0
            && closed.len() as f64 > self.max_fraction * self.catalog_size as f64
        {
            return Err(Widening::TooBroad {
                affected: closed.len(),
                catalog: self.catalog_size,
            });
        }
        Ok(closed)
    }

    /// Map a normalized change set to the rules it affects
    pub fn affected(&self, changed: Vec<String>) -> ChangeSet {
        let direct = self.direct(&changed);
        match self.close(&direct) {
            Ok(closed) => ChangeSet {
                changed,
                direct,
                closed,
                full: None,
            },
            Err(widening) => {
                tracing::info!("Falling back to a full run: {}", widening);
                ChangeSet {
                    direct,
                    ..ChangeSet::full(widening.to_string(), changed)
                }
            }
        }
    }
}

/// Asks version control for changes with a timeout and normalizes the answer
pub struct ChangeDetector {
    vcs: Arc<dyn VersionControl>,
    root: PathBuf,
    timeout: Duration,
    /// Root-relative directory keys whose contents never count as changes
    excluded: Vec<String>,
}

impl ChangeDetector {
    pub fn new(vcs: Arc<dyn VersionControl>, root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            vcs,
            root: root.into(),
            timeout,
            excluded: Vec::new(),
        }
    }

    /// Drop changes under `dir`, either root-relative or absolute inside the root
    pub fn exclude_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let relative = if dir.is_absolute() {
            match dir.strip_prefix(&self.root) {
                Ok(relative) => relative,
                Err(_) => return self,
            }
        } else {
            dir
        };
        let key = path_key(
            &relative
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect::<PathBuf>(),
        );
        if !key.is_empty() {
            self.excluded.push(key);
        }
        self
    }

    fn is_excluded(&self, key: &str) -> bool {
        self.excluded.iter().any(|dir| {
            key.strip_prefix(dir.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    /// Changed paths relative to the root, sorted and deduplicated
    pub fn changed_files(&self, base: &ChangeBase) -> Result<Vec<String>> {
        let (tx, rx) = bounded(1);
        let vcs = self.vcs.clone();
        let query = base.clone();
        std::thread::Builder::new()
            .name("ruleguard-vcs".to_string())
            .spawn(move || {
                let _ = tx.send(vcs.changed_paths(&query));
            })
            .context("Failed to spawn version control query")?;

        let paths = match rx.recv_timeout(self.timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                bail!("version control query timed out after {:?}", self.timeout)
            }
            Err(RecvTimeoutError::Disconnected) => bail!("version control query panicked"),
        };

        let canonical_root = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let mut changed = BTreeSet::new();
        for path in paths {
            match self.normalize(&path, &canonical_root)? {
                Some(key) if self.is_excluded(&key) => {
                    tracing::trace!("Ignoring change in excluded directory: {}", key);
                }
                Some(key) => {
                    changed.insert(key);
                }
                None => {}
            }
        }
        Ok(changed.into_iter().collect())
    }

    /// `None` for paths outside the root; an error for paths that cannot be
    /// placed unambiguously.
    fn normalize(&self, path: &Path, canonical_root: &Path) -> Result<Option<String>> {
        let relative = if path.is_absolute() {
            match path
                .strip_prefix(&self.root)
                .or_else(|_| path.strip_prefix(canonical_root))
            {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => {
                    tracing::debug!("Ignoring change outside {}: {}", self.root.display(), path.display());
                    return Ok(None);
                }
            }
        } else {
            path.to_path_buf()
        };

        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(anyhow!("ambiguous changed path: {}", path.display()));
        }
        let key = path_key(
            &relative
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect::<PathBuf>(),
        );
        Ok((!key.is_empty()).then_some(key))
    }

    /// Changed paths mapped through `map`. Never fails: any problem with the
    /// collaborator yields a full-run change set.
    pub fn detect(&self, base: &ChangeBase, map: &DependencyMap) -> ChangeSet {
        match self.changed_files(base) {
            Ok(changed) => {
                tracing::info!("{} changed files since {}", changed.len(), base);
                map.affected(changed)
            }
            Err(e) => {
                tracing::warn!("Change detection failed ({:#}); validating everything", e);
                ChangeSet::full(format!("change detection failed: {e:#}"), Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, Severity, ValidationResult};

    struct FakeVcs(std::result::Result<Vec<PathBuf>, String>);

    impl VersionControl for FakeVcs {
        fn changed_paths(&self, _base: &ChangeBase) -> Result<Vec<PathBuf>> {
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    struct SlowVcs;

    impl VersionControl for SlowVcs {
        fn changed_paths(&self, _base: &ChangeBase) -> Result<Vec<PathBuf>> {
            std::thread::sleep(Duration::from_secs(5));
            Ok(Vec::new())
        }
    }

    fn rule(id: &'static str) -> Rule {
        Rule::new(id, Severity::Low, move |_| Ok(ValidationResult::pass(id, Severity::Low, "ok")))
    }

    fn registry() -> RuleRegistry {
        let mut registry = RuleRegistry::new(vec!["**/*".to_string()]);
        registry.register(rule("readme").reads(["README.md"])).unwrap();
        registry.register(rule("lockfile").reads(["Cargo.lock"])).unwrap();
        registry.register(rule("sources").reads(["src/**/*.rs"])).unwrap();
        registry
            .register(rule("summary").reads(["docs/**"]).depends_on(["readme", "sources"]))
            .unwrap();
        registry.register(rule("layout").reads([".layout"])).unwrap();
        registry
    }

    fn config() -> IncrementalConfig {
        IncrementalConfig {
            always_run: vec!["layout".to_string()],
            max_fraction: 1.0,
            ..IncrementalConfig::default()
        }
    }

    #[test]
    fn test_direct_matches_and_closure() {
        let map = DependencyMap::from_registry(&registry(), &config()).unwrap();
        let set = map.affected(vec!["src/main.rs".to_string()]);

        assert!(!set.is_full());
        assert_eq!(set.direct, BTreeSet::from(["sources".to_string()]));
        assert_eq!(
            set.closed,
            BTreeSet::from(["sources".to_string(), "summary".to_string()])
        );
    }

    #[test]
    fn test_unknown_path_pulls_always_run() {
        let map = DependencyMap::from_registry(&registry(), &config()).unwrap();
        let set = map.affected(vec!["assets/logo.png".to_string()]);
        assert_eq!(set.closed, BTreeSet::from(["layout".to_string()]));
    }

    #[test]
    fn test_links_extend_dependents() {
        let mut config = config();
        config
            .links
            .insert("lockfile".to_string(), vec!["sources".to_string()]);
        let map = DependencyMap::from_registry(&registry(), &config).unwrap();
        let set = map.affected(vec!["Cargo.lock".to_string()]);
        assert!(set.closed.contains("summary"));
    }

    #[test]
    fn test_iteration_cap_widens() {
        let mut config = config();
        config.max_iterations = 1;
        let map = DependencyMap::from_registry(&registry(), &config).unwrap();
        // lockfile -> sources -> summary needs two expansion rounds
        config
            .links
            .insert("lockfile".to_string(), vec!["sources".to_string()]);
        let map_linked = DependencyMap::from_registry(&registry(), &config).unwrap();

        assert!(!map.affected(vec!["src/a.rs".to_string()]).is_full());
        assert!(map_linked.affected(vec!["Cargo.lock".to_string()]).is_full());
    }

    #[test]
    fn test_fraction_threshold_widens() {
        let mut config = config();
        config.max_fraction = 0.2;
        let map = DependencyMap::from_registry(&registry(), &config).unwrap();
        let set = map.affected(vec!["src/a.rs".to_string()]);
        assert!(set.is_full());
        assert!(set.full.unwrap().contains("2 of 5"));
    }

    #[test]
    fn test_detector_normalizes_paths() {
        let root = PathBuf::from("/repo");
        let vcs = FakeVcs(Ok(vec![
            PathBuf::from("/repo/src/lib.rs"),
            PathBuf::from("./README.md"),
            PathBuf::from("/elsewhere/file"),
            PathBuf::from("README.md"),
        ]));
        let detector = ChangeDetector::new(Arc::new(vcs), root, Duration::from_secs(1));
        let changed = detector.changed_files(&ChangeBase::WorkingTree).unwrap();
        assert_eq!(changed, vec!["README.md".to_string(), "src/lib.rs".to_string()]);
    }

    #[test]
    fn test_detector_skips_excluded_dirs() {
        let vcs = FakeVcs(Ok(vec![
            PathBuf::from(".ruleguard/cache.json"),
            PathBuf::from("/repo/.ruleguard/profiles.json"),
            PathBuf::from(".ruleguard-notes.md"),
            PathBuf::from("build/out/a.o"),
            PathBuf::from("src/lib.rs"),
        ]));
        let detector = ChangeDetector::new(Arc::new(vcs), "/repo", Duration::from_secs(1))
            .exclude_dir(".ruleguard")
            .exclude_dir("/repo/build/")
            .exclude_dir("/elsewhere/state");
        let changed = detector.changed_files(&ChangeBase::WorkingTree).unwrap();
        assert_eq!(
            changed,
            vec![".ruleguard-notes.md".to_string(), "src/lib.rs".to_string()]
        );
    }

    #[test]
    fn test_failures_fall_back_to_full() {
        let map = DependencyMap::from_registry(&registry(), &config()).unwrap();

        let failing = ChangeDetector::new(
            Arc::new(FakeVcs(Err("not a repository".to_string()))),
            "/repo",
            Duration::from_secs(1),
        );
        assert!(failing.detect(&ChangeBase::Staged, &map).is_full());

        let escaping = ChangeDetector::new(
            Arc::new(FakeVcs(Ok(vec![PathBuf::from("../outside.rs")]))),
            "/repo",
            Duration::from_secs(1),
        );
        assert!(escaping.detect(&ChangeBase::Staged, &map).is_full());

        let slow = ChangeDetector::new(Arc::new(SlowVcs), "/repo", Duration::from_millis(50));
        let set = slow.detect(&ChangeBase::WorkingTree, &map);
        assert!(set.full.unwrap().contains("timed out"));
    }

    #[test]
    fn test_empty_change_set_is_empty() {
        let map = DependencyMap::from_registry(&registry(), &config()).unwrap();
        let set = map.affected(Vec::new());
        assert!(!set.is_full());
        assert!(set.closed.is_empty());
    }
}
