//! Execution Profile Store
//!
//! Keeps per-rule timing statistics across runs. Each fresh execution feeds
//! one sample through Welford's online update, so the store never keeps raw
//! samples and the running variance stays stable after thousands of updates.
//! The scheduler only uses [`ProfileStore::estimate`]; everything else exists
//! for persistence and the `profile` subcommand.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::shared::persist::{read_json_or_default, write_json_atomic};
use crate::shared::unix_millis;

const DOCUMENT_VERSION: u32 = 1;

/// Cold-start estimate for rules that have never run
pub const DEFAULT_ESTIMATE: Duration = Duration::from_millis(10);

/// Running timing statistics for one rule
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionProfile {
    pub rule_id: String,
    pub mean_ms: f64,
    /// Sum of squared deviations from the mean (Welford's M2)
    pub m2: f64,
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Unix milliseconds of the last update
    pub updated_at: u64,
}

impl ExecutionProfile {
    fn new(rule_id: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            ..Self::default()
        }
    }

    /// Welford update with one sample, in milliseconds
    pub fn record(&mut self, sample_ms: f64) {
        self.count += 1;
        let delta = sample_ms - self.mean_ms;
        self.mean_ms += delta / self.count as f64;
        self.m2 += delta * (sample_ms - self.mean_ms);

        if self.count == 1 {
            self.min_ms = sample_ms;
            self.max_ms = sample_ms;
        } else {
            self.min_ms = self.min_ms.min(sample_ms);
            self.max_ms = self.max_ms.max(sample_ms);
        }
        self.updated_at = unix_millis();
    }

    /// Sample variance; 0 with fewer than two samples
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Mean as a duration; `None` when the stored mean is not representable
    pub fn mean(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.mean_ms.max(0.0) / 1000.0).ok()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProfileDocument {
    version: u32,
    profiles: BTreeMap<String, ExecutionProfile>,
}

/// Rule id -> [`ExecutionProfile`], optionally backed by a JSON document
#[derive(Debug)]
pub struct ProfileStore {
    path: Option<PathBuf>,
    default_estimate: Duration,
    profiles: Mutex<BTreeMap<String, ExecutionProfile>>,
}

impl ProfileStore {
    /// Store that lives only for this process
    pub fn in_memory(default_estimate: Duration) -> Self {
        Self {
            path: None,
            default_estimate,
            profiles: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the document at `path`. Missing or corrupt documents give an empty store.
    pub fn open(path: impl Into<PathBuf>, default_estimate: Duration) -> Self {
        let path = path.into();
        let doc: ProfileDocument = read_json_or_default(&path, "profile store");
        if doc.version > DOCUMENT_VERSION {
            tracing::warn!(
                "Profile store {} has newer version {}, reading known fields only",
                path.display(),
                doc.version
            );
        }
        tracing::debug!("Loaded {} execution profiles", doc.profiles.len());

        Self {
            path: Some(path),
            default_estimate,
            profiles: Mutex::new(doc.profiles),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ExecutionProfile>> {
        self.profiles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold one observed duration into the rule's profile
    pub fn update(&self, rule_id: &str, duration: Duration) {
        let sample_ms = duration.as_secs_f64() * 1000.0;
        let mut profiles = self.lock();
        profiles
            .entry(rule_id.to_string())
            .or_insert_with(|| ExecutionProfile::new(rule_id))
            .record(sample_ms);
    }

    /// Running mean, or the cold-start default
    pub fn estimate(&self, rule_id: &str) -> Duration {
        match self.lock().get(rule_id) {
            Some(profile) if profile.count > 0 => profile.mean().unwrap_or(self.default_estimate),
            _ => self.default_estimate,
        }
    }

    pub fn get(&self, rule_id: &str) -> Option<ExecutionProfile> {
        self.lock().get(rule_id).cloned()
    }

    /// All profiles, sorted by rule id
    pub fn profiles(&self) -> Vec<ExecutionProfile> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop one profile, or all of them. Returns how many were removed.
    pub fn reset(&self, rule_id: Option<&str>) -> usize {
        let mut profiles = self.lock();
        match rule_id {
            Some(id) => usize::from(profiles.remove(id).is_some()),
            None => {
                let removed = profiles.len();
                profiles.clear();
                removed
            }
        }
    }

    /// Atomically replace the backing document (no-op for in-memory stores)
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = ProfileDocument {
            version: DOCUMENT_VERSION,
            profiles: self.lock().clone(),
        };
        write_json_atomic(path, &doc)?;
        tracing::debug!("Saved {} execution profiles to {}", doc.profiles.len(), path.display());
        Ok(())
    }
}
