//! Configuration management for ruleguard
//!
//! Configuration is layered with figment (see [`core::RuleguardConfig`]) and
//! then extracted into the typed sections below. Every field has a serde
//! default, so partial or older configuration files keep working.

pub mod core;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheSettings;
use crate::engine::Isolation;
use crate::rules::Severity;

pub use core::{ConfigFormat, RuleguardConfig};

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on workers per batch; 0 uses the CPU count
    pub max_workers: usize,
    pub use_cache: bool,
    /// Where the cache and profile documents live, relative to the repository root
    pub state_dir: PathBuf,
    /// Lowest failing severity that makes the run exit non-zero
    pub fail_on: Severity,
    pub execution: ExecutionConfig,
    pub cache: CacheConfig,
    pub profile: ProfileConfig,
    pub incremental: IncrementalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            use_cache: true,
            state_dir: PathBuf::from(".ruleguard"),
            fail_on: Severity::High,
            execution: ExecutionConfig::default(),
            cache: CacheConfig::default(),
            profile: ProfileConfig::default(),
            incremental: IncrementalConfig::default(),
        }
    }
}

/// `[engine.execution]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub isolation: Isolation,
    pub timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::Thread,
            timeout_secs: 60,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[engine.cache]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// 0 disables the size bound
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let defaults = CacheSettings::default();
        Self {
            ttl_secs: defaults.ttl.as_secs(),
            max_bytes: defaults.max_bytes,
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(self.ttl_secs),
            max_bytes: self.max_bytes,
        }
    }
}

/// `[engine.profile]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub default_estimate_ms: u64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            default_estimate_ms: 10,
        }
    }
}

impl ProfileConfig {
    pub fn default_estimate(&self) -> Duration {
        Duration::from_millis(self.default_estimate_ms)
    }
}

/// `[engine.incremental]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    /// Expansion rounds allowed before falling back to a full run
    pub max_iterations: usize,
    /// Largest share of the catalog an incremental run may cover
    pub max_fraction: f64,
    pub vcs_timeout_secs: u64,
    /// Rules run for changes that match no read-set
    pub always_run: Vec<String>,
    /// Extra glob -> rule ids entries for the change table
    pub patterns: BTreeMap<String, Vec<String>>,
    /// Extra rule -> dependent rule ids edges for expansion
    pub links: BTreeMap<String, Vec<String>>,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_fraction: 0.75,
            vcs_timeout_secs: 10,
            always_run: Vec::new(),
            patterns: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }
}

impl IncrementalConfig {
    pub fn vcs_timeout(&self) -> Duration {
        Duration::from_secs(self.vcs_timeout_secs)
    }
}

/// `[catalog]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Read-set of rules that do not declare one
    pub default_reads: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_reads: vec!["**/*".to_string()],
        }
    }
}
