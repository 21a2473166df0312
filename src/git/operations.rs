use anyhow::{Context, Result};
use git2::{Diff, DiffOptions, Repository, Status, StatusOptions};
use std::collections::BTreeSet;
use std::path::PathBuf;

const STAGED: Status = Status::INDEX_NEW
    .union(Status::INDEX_MODIFIED)
    .union(Status::INDEX_DELETED)
    .union(Status::INDEX_RENAMED)
    .union(Status::INDEX_TYPECHANGE);

const UNSTAGED: Status = Status::WT_NEW
    .union(Status::WT_MODIFIED)
    .union(Status::WT_DELETED)
    .union(Status::WT_RENAMED)
    .union(Status::WT_TYPECHANGE);

fn status_files(repo: &Repository, mask: Status, include_untracked: bool) -> Result<Vec<PathBuf>> {
    let mut status_opts = StatusOptions::new();
    status_opts.include_ignored(false);
    status_opts.include_untracked(include_untracked);
    status_opts.recurse_untracked_dirs(include_untracked);
    status_opts.renames_head_to_index(true);

    let statuses = repo
        .statuses(Some(&mut status_opts))
        .context("Failed to get repository status")?;

    let mut files = BTreeSet::new();
    for entry in statuses.iter() {
        if !entry.status().intersects(mask) {
            continue;
        }
        if let Some(path) = entry.path() {
            files.insert(PathBuf::from(path));
        }
        // A rename touches both the old and the new path
        if let Some(old) = entry.head_to_index().and_then(|d| d.old_file().path()) {
            files.insert(old.to_path_buf());
        }
    }
    Ok(files.into_iter().collect())
}

/// Files staged for commit
pub(super) fn staged_files(repo: &Repository) -> Result<Vec<PathBuf>> {
    status_files(repo, STAGED, false)
}

/// Staged, unstaged and untracked files
pub(super) fn uncommitted_files(repo: &Repository) -> Result<Vec<PathBuf>> {
    status_files(repo, STAGED | UNSTAGED, true)
}

/// Files changed between two revisions, or between a revision and the
/// working tree (index included) when `target` is `None`
pub(super) fn diff_files(repo: &Repository, base: &str, target: Option<&str>) -> Result<Vec<PathBuf>> {
    let base_tree = repo
        .revparse_single(base)
        .and_then(|obj| obj.peel_to_tree())
        .with_context(|| format!("Cannot resolve base revision '{base}'"))?;

    let mut diff_opts = DiffOptions::new();
    diff_opts.context_lines(0);
    diff_opts.include_untracked(true);
    diff_opts.recurse_untracked_dirs(true);

    let diff = match target {
        Some(target) => {
            let target_tree = repo
                .revparse_single(target)
                .and_then(|obj| obj.peel_to_tree())
                .with_context(|| format!("Cannot resolve target revision '{target}'"))?;
            repo.diff_tree_to_tree(Some(&base_tree), Some(&target_tree), Some(&mut diff_opts))?
        }
        None => repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut diff_opts))?,
    };

    delta_paths(&diff)
}

fn delta_paths(diff: &Diff<'_>) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();
    for delta in diff.deltas() {
        for path in [delta.old_file().path(), delta.new_file().path()]
            .into_iter()
            .flatten()
        {
            files.insert(path.to_path_buf());
        }
    }
    Ok(files.into_iter().collect())
}
