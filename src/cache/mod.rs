//! Result Cache
//!
//! Persists the last completed result of every rule together with the hashes
//! of the inputs it read. A lookup is a hit only when the entry is within its
//! TTL, was produced by the same rule definition, and *every* tracked input
//! still hashes to the stored value.
//!
//! Tracked inputs are string keys with a kind prefix:
//!
//! - `file:<path>`: SHA-256 of the file content, or `absent`
//! - `glob:<pattern>`: digest of the sorted list of paths the glob matches
//! - `rule:<id>`: digest of an upstream rule's result in the current run
//!
//! The cache does not know how to compute the current value of a key; the
//! caller passes an [`InputHasher`] for that.

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::rules::ValidationResult;
use crate::shared::persist::{read_json_or_default, write_json_atomic};
use crate::shared::{sha256_hex, unix_millis};

const DOCUMENT_VERSION: u32 = 1;

pub const ABSENT: &str = "absent";

pub fn file_key(path: &str) -> String {
    format!("file:{path}")
}

pub fn glob_key(pattern: &str) -> String {
    format!("glob:{pattern}")
}

pub fn rule_key(rule_id: &str) -> String {
    format!("rule:{rule_id}")
}

/// A tracked input key split into its kind and value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKey<'a> {
    File(&'a str),
    Glob(&'a str),
    Rule(&'a str),
    Unknown(&'a str),
}

impl<'a> InputKey<'a> {
    pub fn parse(key: &'a str) -> Self {
        match key.split_once(':') {
            Some(("file", path)) => InputKey::File(path),
            Some(("glob", pattern)) => InputKey::Glob(pattern),
            Some(("rule", id)) => InputKey::Rule(id),
            _ => InputKey::Unknown(key),
        }
    }
}

/// SHA-256 of a file's content; `absent` when it does not exist
pub fn hash_file(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => ABSENT.to_string(),
        // Never equal to a content hash, so the entry is simply missed
        Err(e) => format!("unreadable:{:?}", e.kind()),
    }
}

/// Digest of a sorted path listing
pub fn hash_listing<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut material = String::new();
    for path in paths {
        material.push_str(path);
        material.push('\n');
    }
    sha256_hex(material.as_bytes())
}

/// Computes the current value of a tracked input key
pub trait InputHasher: Send + Sync {
    fn hash_input(&self, key: &str) -> String;
}

/// Hashes `file:` keys relative to a root directory. Other kinds never match.
#[derive(Debug, Clone)]
pub struct FileHasher {
    root: PathBuf,
}

impl FileHasher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl InputHasher for FileHasher {
    fn hash_input(&self, key: &str) -> String {
        match InputKey::parse(key) {
            InputKey::File(path) => hash_file(&self.root.join(path)),
            _ => format!("unsupported:{key}"),
        }
    }
}

/// One cached rule outcome
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheEntry {
    pub rule_id: String,
    pub result: ValidationResult,
    /// Tracked input key -> hash at store time
    pub file_hashes: BTreeMap<String, String>,
    /// Definition signature of the rule that produced the result
    pub signature: String,
    /// Unix milliseconds
    pub created_at: u64,
    pub ttl_secs: u64,
    /// Logical clock value when the entry was stored; unique per store
    pub generation: u64,
    /// Logical LRU clock value of the last store or hit
    pub last_access: u64,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) >= self.ttl_secs.saturating_mul(1000)
    }
}

/// Why a lookup did not hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Expired,
    DefinitionChanged,
    InputChanged(String),
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissReason::Absent => f.write_str("no entry"),
            MissReason::Expired => f.write_str("ttl expired"),
            MissReason::DefinitionChanged => f.write_str("rule definition changed"),
            MissReason::InputChanged(key) => write!(f, "{key} changed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(ValidationResult),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    /// Upper bound on the summed entry sizes; 0 means unbounded
    pub max_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CacheDocument {
    version: u32,
    clock: u64,
    entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
struct CacheState {
    clock: u64,
    entries: BTreeMap<String, CacheEntry>,
    stats: CacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    fn remove(&mut self, rule_id: &str) -> bool {
        let removed = self.entries.remove(rule_id).is_some();
        if removed {
            self.stats.invalidations += 1;
        }
        removed
    }

    /// Drop least recently used entries until the bound holds again
    fn evict(&mut self, max_bytes: u64, keep: &str) {
        if max_bytes == 0 {
            return;
        }
        let mut total = self.bytes();
        while total > max_bytes {
            let victim = self
                .entries
                .values()
                .filter(|e| e.rule_id != keep)
                .min_by_key(|e| e.last_access)
                .or_else(|| self.entries.get(keep))
                .map(|e| (e.rule_id.clone(), e.size_bytes));
            let Some((rule_id, size)) = victim else {
                break;
            };
            tracing::debug!("Evicting cached result of {} ({} bytes)", rule_id, size);
            self.entries.remove(&rule_id);
            self.stats.evictions += 1;
            total = total.saturating_sub(size);
        }
    }
}

/// File-hash validated store of prior rule outcomes
#[derive(Debug)]
pub struct ResultCache {
    path: Option<PathBuf>,
    settings: CacheSettings,
    state: Mutex<CacheState>,
}

impl ResultCache {
    pub fn in_memory(settings: CacheSettings) -> Self {
        Self {
            path: None,
            settings,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Load the document at `path`; missing or corrupt documents give an empty cache
    pub fn open(path: impl Into<PathBuf>, settings: CacheSettings) -> Self {
        let path = path.into();
        let doc: CacheDocument = read_json_or_default(&path, "result cache");
        tracing::debug!("Loaded {} cached results", doc.entries.len());

        // Entries written without a key (older layouts) are keyed by their map key
        let entries = doc
            .entries
            .into_iter()
            .map(|(id, mut entry)| {
                if entry.rule_id.is_empty() {
                    entry.rule_id = id.clone();
                }
                (id, entry)
            })
            .collect();

        Self {
            path: Some(path),
            settings,
            state: Mutex::new(CacheState {
                clock: doc.clock,
                entries,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn miss(&self, rule_id: &str, reason: MissReason) -> CacheLookup {
        tracing::debug!("Cache miss for {}: {}", rule_id, reason);
        self.lock().stats.misses += 1;
        CacheLookup::Miss(reason)
    }

    /// Look up `rule_id`, validating TTL, definition signature and every
    /// tracked input. Stale entries are invalidated on the way.
    pub fn lookup(&self, rule_id: &str, signature: &str, hasher: &dyn InputHasher) -> CacheLookup {
        let entry = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get(rule_id) else {
                drop(state);
                return self.miss(rule_id, MissReason::Absent);
            };
            if entry.is_expired(unix_millis()) {
                state.remove(rule_id);
                drop(state);
                return self.miss(rule_id, MissReason::Expired);
            }
            if entry.signature != signature {
                state.remove(rule_id);
                drop(state);
                return self.miss(rule_id, MissReason::DefinitionChanged);
            }
            entry.clone()
        };

        // Hash outside the lock; other workers keep using the cache meanwhile
        let changed = entry
            .file_hashes
            .par_iter()
            .find_any(|(key, stored)| hasher.hash_input(key) != **stored)
            .map(|(key, _)| key.clone());

        let mut state = self.lock();
        if let Some(key) = changed {
            // Only drop the entry we validated, not one stored concurrently
            if state
                .entries
                .get(rule_id)
                .is_some_and(|e| e.generation == entry.generation)
            {
                state.remove(rule_id);
            }
            drop(state);
            return self.miss(rule_id, MissReason::InputChanged(key));
        }

        let now = state.tick();
        if let Some(live) = state.entries.get_mut(rule_id) {
            live.last_access = now;
        }
        state.stats.hits += 1;
        tracing::trace!("Cache hit for {}", rule_id);
        CacheLookup::Hit(entry.result)
    }

    /// Hash `inputs` and replace any prior entry for the result's rule
    pub fn store(
        &self,
        result: &ValidationResult,
        signature: &str,
        inputs: &[String],
        hasher: &dyn InputHasher,
    ) {
        let file_hashes: BTreeMap<String, String> = inputs
            .par_iter()
            .map(|key| (key.clone(), hasher.hash_input(key)))
            .collect();

        let mut entry = CacheEntry {
            rule_id: result.rule_id.clone(),
            result: result.clone(),
            file_hashes,
            signature: signature.to_string(),
            created_at: unix_millis(),
            ttl_secs: self.settings.ttl.as_secs(),
            generation: 0,
            last_access: 0,
            size_bytes: 0,
        };
        entry.size_bytes = serde_json::to_vec(&entry).map_or(0, |v| v.len() as u64);

        let mut state = self.lock();
        entry.generation = state.tick();
        entry.last_access = entry.generation;
        state.entries.insert(entry.rule_id.clone(), entry);
        state.evict(self.settings.max_bytes, &result.rule_id);
    }

    pub fn get(&self, rule_id: &str) -> Option<CacheEntry> {
        self.lock().entries.get(rule_id).cloned()
    }

    /// Every stored entry, ordered by rule id
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn invalidate(&self, rule_id: &str) -> bool {
        self.lock().remove(rule_id)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.stats.invalidations += removed as u64;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes(),
            ..state.stats
        }
    }

    /// Atomically replace the backing document (no-op for in-memory caches)
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = {
            let state = self.lock();
            CacheDocument {
                version: DOCUMENT_VERSION,
                clock: state.clock,
                entries: state.entries.clone(),
            }
        };
        write_json_atomic(path, &doc)?;
        tracing::debug!("Saved {} cached results to {}", doc.entries.len(), path.display());
        Ok(())
    }
}
