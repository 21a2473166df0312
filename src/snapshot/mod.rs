//! Read-only directory snapshot shared by every rule in a run
//!
//! Walking the repository is done once, lazily, with `ignore::WalkBuilder`
//! (gitignore aware). Rules and the result cache read the resulting
//! [`RepoTree`] instead of walking the tree again.

use anyhow::Result;
use globset::GlobSet;
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::shared::glob::{build_globset, path_key};

/// Source of the repository structure
pub trait FilesystemSnapshot: Send + Sync {
    fn root(&self) -> &Path;
    fn structure(&self) -> Arc<RepoTree>;
}

/// Immutable view of the files and directories under a repository root.
/// Paths are repository-relative with `/` separators.
#[derive(Debug, Clone, Default)]
pub struct RepoTree {
    files: BTreeSet<String>,
    dirs: BTreeSet<String>,
    walk_errors: usize,
}

impl RepoTree {
    pub fn from_paths<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files: BTreeSet<String> = files.into_iter().map(Into::into).collect();
        let mut dirs = BTreeSet::new();
        for file in &files {
            let mut current = file.as_str();
            while let Some((parent, _)) = current.rsplit_once('/') {
                dirs.insert(parent.to_string());
                current = parent;
            }
        }
        Self {
            files,
            dirs,
            walk_errors: 0,
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn walk_errors(&self) -> usize {
        self.walk_errors
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    pub fn contains_dir(&self, path: &str) -> bool {
        self.dirs.contains(path.trim_end_matches('/'))
    }

    /// Files matched by any glob in `set`, sorted
    pub fn matching<'a>(&'a self, set: &'a GlobSet) -> impl Iterator<Item = &'a str> + 'a {
        self.files().filter(move |f| set.is_match(f))
    }

    /// Files matched by a single glob pattern, sorted
    pub fn matching_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let set = build_globset(&[pattern.to_string()])?;
        Ok(self.matching(&set).map(str::to_string).collect())
    }
}

/// Snapshot backed by a single lazy walk of the working tree
pub struct WalkSnapshot {
    root: PathBuf,
    excluded_dirs: Vec<String>,
    follow_links: bool,
    tree: OnceLock<Arc<RepoTree>>,
}

impl WalkSnapshot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded_dirs: vec![".git".to_string()],
            follow_links: false,
            tree: OnceLock::new(),
        }
    }

    /// Skip a directory name anywhere in the tree (e.g. the engine state dir)
    pub fn exclude_dir(mut self, name: impl Into<String>) -> Self {
        self.excluded_dirs.push(name.into());
        self
    }

    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    fn walk(&self) -> RepoTree {
        let start = std::time::Instant::now();
        let excluded = self.excluded_dirs.clone();
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .require_git(false)
            .follow_links(self.follow_links)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
                !(is_dir && excluded.iter().any(|name| entry.file_name() == name.as_str()))
            })
            .build();

        let mut tree = RepoTree::default();
        for entry in walker {
            match entry {
                Ok(entry) => {
                    let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                        continue;
                    };
                    if relative.as_os_str().is_empty() {
                        continue;
                    }
                    let key = path_key(relative);
                    match entry.file_type() {
                        Some(ft) if ft.is_dir() => {
                            tree.dirs.insert(key);
                        }
                        Some(_) => {
                            tree.files.insert(key);
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    tracing::debug!("Walk error: {}", e);
                    tree.walk_errors += 1;
                }
            }
        }

        tracing::debug!(
            "Snapshot of {} built in {:?} ({} files, {} dirs)",
            self.root.display(),
            start.elapsed(),
            tree.files.len(),
            tree.dirs.len()
        );
        tree
    }
}

impl FilesystemSnapshot for WalkSnapshot {
    fn root(&self) -> &Path {
        &self.root
    }

    fn structure(&self) -> Arc<RepoTree> {
        self.tree.get_or_init(|| Arc::new(self.walk())).clone()
    }
}
