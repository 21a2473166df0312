//! Git integration
//!
//! Backs incremental runs with git2. The repository is reopened for each
//! query so a [`GitRepo`] can be shared with the detector's query thread.

mod operations;

use anyhow::{Context, Result};
use git2::Repository;
use std::path::{Path, PathBuf};

use crate::incremental::{ChangeBase, VersionControl};

/// Handle on the repository containing a directory
#[derive(Debug, Clone)]
pub struct GitRepo {
    workdir: PathBuf,
}

impl GitRepo {
    /// Discover the repository containing `path`
    pub fn discover(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::discover(path.as_ref()).with_context(|| {
            format!("No Git repository found at {}", path.as_ref().display())
        })?;
        let workdir = repo
            .workdir()
            .context("Repository has no working directory")?
            .to_path_buf();
        Ok(Self { workdir })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.workdir).context("Failed to open Git repository")
    }
}

impl VersionControl for GitRepo {
    fn changed_paths(&self, base: &ChangeBase) -> Result<Vec<PathBuf>> {
        let repo = self.open()?;
        let relative = match base {
            ChangeBase::WorkingTree => operations::uncommitted_files(&repo)?,
            ChangeBase::Staged => operations::staged_files(&repo)?,
            ChangeBase::Range { base, target } => {
                operations::diff_files(&repo, base, target.as_deref())?
            }
        };
        Ok(relative.into_iter().map(|p| self.workdir.join(p)).collect())
    }
}
