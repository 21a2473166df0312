//! Subcommand implementations
//!
//! Every command starts from a [`Workspace`]: the configuration layered for
//! the current directory plus the on-disk state under `engine.state_dir`.

pub mod affected;
pub mod cache;
pub mod config;
pub mod plan;
pub mod profile;
pub mod rules;
pub mod run;
pub mod version;
pub mod worker;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::ResultCache;
use crate::cli::Globals;
use crate::config::{EngineConfig, RuleguardConfig};
use crate::git::GitRepo;
use crate::incremental::ChangeBase;
use crate::orchestrator::Orchestrator;
use crate::profile::ProfileStore;
use crate::rules::RuleRegistry;
use crate::rules::catalog::build_registry;
use crate::snapshot::{FilesystemSnapshot, WalkSnapshot};

pub const CACHE_FILE: &str = "cache.json";
pub const PROFILE_FILE: &str = "profiles.json";

pub struct Workspace {
    pub root: PathBuf,
    pub config: RuleguardConfig,
    pub engine: EngineConfig,
}

impl Workspace {
    pub fn load(globals: &Globals) -> Result<Self> {
        let root = std::env::current_dir().context("Cannot determine current directory")?;
        let config = RuleguardConfig::load(&root, globals.config.as_deref())?;
        let engine = config.engine()?;
        Ok(Self { root, config, engine })
    }

    pub fn state_dir(&self) -> PathBuf {
        if self.engine.state_dir.is_absolute() {
            self.engine.state_dir.clone()
        } else {
            self.root.join(&self.engine.state_dir)
        }
    }

    pub fn registry(&self) -> Result<Arc<RuleRegistry>> {
        let catalog = self.config.catalog()?;
        let specs = self.config.rules()?;
        let registry = build_registry(&specs, catalog.default_reads)?;
        tracing::debug!("Loaded {} rules", registry.len());
        Ok(Arc::new(registry))
    }

    pub fn snapshot(&self) -> Arc<dyn FilesystemSnapshot> {
        let mut snapshot = WalkSnapshot::new(&self.root);
        if let Some(name) = self.engine.state_dir.file_name() {
            snapshot = snapshot.exclude_dir(name.to_string_lossy().into_owned());
        }
        Arc::new(snapshot)
    }

    pub fn cache(&self) -> Arc<ResultCache> {
        Arc::new(ResultCache::open(
            self.state_dir().join(CACHE_FILE),
            self.engine.cache.settings(),
        ))
    }

    pub fn profiles(&self) -> Arc<ProfileStore> {
        Arc::new(ProfileStore::open(
            self.state_dir().join(PROFILE_FILE),
            self.engine.profile.default_estimate(),
        ))
    }

    /// Orchestrator wired to the on-disk stores and, when the directory is
    /// inside a git repository, to git for change detection
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let orchestrator = Orchestrator::new(self.registry()?, self.snapshot(), self.cache(), self.profiles())
            .with_incremental(self.engine.incremental.clone())
            .with_timeout(self.engine.execution.timeout())
            .with_state_dir(self.state_dir());

        match GitRepo::discover(&self.root) {
            Ok(repo) => Ok(orchestrator.with_version_control(Arc::new(repo))),
            Err(e) => {
                tracing::debug!("No git repository at {}: {:#}", self.root.display(), e);
                Ok(orchestrator)
            }
        }
    }
}

/// `--staged` wins over `--base`; neither means the whole working tree
pub fn change_base(base: Option<String>, target: Option<String>, staged: bool) -> ChangeBase {
    match (staged, base) {
        (true, _) => ChangeBase::Staged,
        (false, Some(base)) => ChangeBase::Range { base, target },
        (false, None) => ChangeBase::WorkingTree,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_base_selection() {
        assert_eq!(change_base(None, None, false), ChangeBase::WorkingTree);
        assert_eq!(change_base(Some("main".into()), None, true), ChangeBase::Staged);
        assert_eq!(
            change_base(Some("main".into()), Some("HEAD".into()), false),
            ChangeBase::Range {
                base: "main".into(),
                target: Some("HEAD".into())
            }
        );
    }
}
