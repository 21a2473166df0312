//! Integration tests for the ruleguard CLI

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const CATALOG_SIZE: usize = 6;

/// Command isolated from the developer's environment and user config
fn ruleguard(repo: &Path, home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ruleguard").unwrap();
    cmd.current_dir(repo)
        .env("HOME", home)
        .env_remove("RUST_LOG")
        .env_remove("RULEGUARD_ENGINE__MAX_WORKERS");
    cmd
}

fn scratch_repo() -> (TempDir, TempDir) {
    let repo = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    fs::write(repo.path().join("README.md"), "# Scratch\n\nHello.\n").unwrap();
    fs::create_dir_all(repo.path().join("src")).unwrap();
    fs::write(repo.path().join("src/lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();
    (repo, home)
}

fn run_json(repo: &Path, home: &Path, args: &[&str]) -> Value {
    let output = ruleguard(repo, home)
        .arg("run")
        .args(args)
        .args(["--format", "json"])
        .output()
        .unwrap();
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "run did not print a JSON report ({e}): {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn commit_all(repo: &git2::Repository, message: &str) {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let signature = git2::Signature::now("Test", "test@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .unwrap();
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("ruleguard").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("rule validation"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("worker").not());
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("ruleguard").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ruleguard"));
}

#[test]
fn test_invalid_subcommand() {
    let mut cmd = Command::cargo_bin("ruleguard").unwrap();
    cmd.arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_full_run_then_cached_run() {
    let (repo, home) = scratch_repo();

    let first = run_json(repo.path(), home.path(), &[]);
    assert_eq!(first["mode"], "full");
    assert_eq!(first["entries"].as_array().unwrap().len(), CATALOG_SIZE);
    assert_eq!(first["failed"], 0);
    assert_eq!(first["cache_hits"], 0);
    assert!(repo.path().join(".ruleguard/cache.json").exists());
    assert!(repo.path().join(".ruleguard/profiles.json").exists());

    let second = run_json(repo.path(), home.path(), &[]);
    assert_eq!(second["cache_hits"], CATALOG_SIZE);
    assert_eq!(second["fresh_executions"], 0);

    let fresh = run_json(repo.path(), home.path(), &["--no-cache"]);
    assert_eq!(fresh["cache_hits"], 0);
}

#[test]
fn test_editing_a_file_invalidates_its_readers() {
    let (repo, home) = scratch_repo();
    run_json(repo.path(), home.path(), &[]);

    fs::write(repo.path().join("README.md"), "no heading any more\n").unwrap();
    let report = run_json(repo.path(), home.path(), &[]);

    let entries = report["entries"].as_array().unwrap();
    let source = |id: &str| {
        entries
            .iter()
            .find(|e| e["result"]["rule_id"] == id)
            .map(|e| e["source"].as_str().unwrap().to_string())
            .unwrap()
    };
    assert_eq!(source("readme-has-title"), "fresh");
    assert_eq!(source("no-env-files"), "cached");
    assert_eq!(report["failed"], 1);
}

#[test]
fn test_exit_code_follows_fail_on() {
    let (repo, home) = scratch_repo();
    fs::remove_file(repo.path().join("README.md")).unwrap();

    // Missing README fails at medium; the default threshold is high
    ruleguard(repo.path(), home.path()).arg("run").assert().success();
    ruleguard(repo.path(), home.path())
        .args(["run", "--fail-on", "medium"])
        .assert()
        .code(1);

    fs::write(repo.path().join(".env"), "SECRET=1\n").unwrap();
    ruleguard(repo.path(), home.path())
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed at or above high"));
}

#[test]
fn test_cycle_aborts_before_running() {
    let (repo, home) = scratch_repo();
    fs::write(
        repo.path().join("ruleguard.toml"),
        r#"
[[rules]]
id = "a"
kind = "file_exists"
path = "README.md"
depends_on = ["b"]

[[rules]]
id = "b"
kind = "file_exists"
path = "README.md"
depends_on = ["a"]
"#,
    )
    .unwrap();

    ruleguard(repo.path(), home.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
    assert!(!repo.path().join(".ruleguard/cache.json").exists());
}

#[test]
fn test_plan_and_rules_listing() {
    let (repo, home) = scratch_repo();

    let output = ruleguard(repo.path(), home.path())
        .args(["plan", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let plan: Value = serde_json::from_slice(&output.stdout).unwrap();
    let batches = plan["batches"].as_array().unwrap();
    assert_eq!(batches.len(), 2);
    assert!(
        batches[1]["rule_ids"]
            .as_array()
            .unwrap()
            .contains(&Value::from("readme-has-title"))
    );

    let output = ruleguard(repo.path(), home.path())
        .args(["rules", "--format", "json"])
        .output()
        .unwrap();
    let rules: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rules.as_array().unwrap().len(), CATALOG_SIZE);

    ruleguard(repo.path(), home.path())
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("Batch 1"));
}

#[test]
fn test_cache_commands() {
    let (repo, home) = scratch_repo();
    run_json(repo.path(), home.path(), &[]);

    ruleguard(repo.path(), home.path())
        .args(["cache", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries"));

    ruleguard(repo.path(), home.path())
        .args(["cache", "invalidate", "readme-present"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Invalidated"));

    ruleguard(repo.path(), home.path())
        .args(["cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Removed {}", CATALOG_SIZE - 1)));

    ruleguard(repo.path(), home.path())
        .args(["profile", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("readme-present"));
}

#[test]
fn test_worker_prints_one_envelope() {
    let (repo, home) = scratch_repo();

    let output = ruleguard(repo.path(), home.path())
        .args(["worker", "--rule", "readme-present"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let envelope: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(envelope["schema"], "ruleguard.result/v1");
    assert_eq!(envelope["rule_id"], "readme-present");
    assert_eq!(envelope["result"]["passed"], true);

    let output = ruleguard(repo.path(), home.path())
        .args(["worker", "--rule", "missing"])
        .output()
        .unwrap();
    let envelope: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(envelope["error"].as_str().unwrap().contains("not registered"));
}

#[test]
fn test_process_isolation_run() {
    let (repo, home) = scratch_repo();

    let report = run_json(repo.path(), home.path(), &["--isolation", "process", "--no-cache"]);
    assert_eq!(report["isolation"], "process");
    assert!(report["isolation_fallback"].is_null());
    assert_eq!(report["entries"].as_array().unwrap().len(), CATALOG_SIZE);
    assert_eq!(report["crashes"], 0);
}

#[test]
fn test_incremental_runs_in_git_repository() {
    let (repo, home) = scratch_repo();
    let git = git2::Repository::init(repo.path()).unwrap();
    commit_all(&git, "initial");

    // Nothing staged: nothing to do
    let report = run_json(repo.path(), home.path(), &["--staged"]);
    assert_eq!(report["mode"], "incremental");
    assert_eq!(report["entries"].as_array().unwrap().len(), 0);

    fs::write(repo.path().join(".env"), "SECRET=1\n").unwrap();
    let report = run_json(repo.path(), home.path(), &["--incremental"]);
    assert_eq!(report["changed_files"], 1);
    assert!(report["incremental_fallback"].is_null());
    let ids: Vec<&str> = report["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["result"]["rule_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["no-env-files", "no-private-keys"]);

    ruleguard(repo.path(), home.path())
        .args(["affected", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no-env-files"));
}

#[test]
fn test_state_files_are_not_changes() {
    let (repo, home) = scratch_repo();
    let git = git2::Repository::init(repo.path()).unwrap();
    commit_all(&git, "initial");

    let full = run_json(repo.path(), home.path(), &[]);
    assert_eq!(full["entries"].as_array().unwrap().len(), CATALOG_SIZE);
    assert!(repo.path().join(".ruleguard/cache.json").exists());

    // The state directory is untracked and not ignored
    let report = run_json(repo.path(), home.path(), &["--incremental"]);
    assert_eq!(report["changed_files"], 0);
    assert!(report["incremental_fallback"].is_null());
    assert_eq!(report["entries"].as_array().unwrap().len(), 0);
}

#[test]
fn test_config_show_and_validate() {
    let (repo, home) = scratch_repo();

    ruleguard(repo.path(), home.path())
        .args(["config", "show", "--section", "engine.execution"])
        .assert()
        .success()
        .stdout(predicate::str::contains("timeout_secs = 60"));

    ruleguard(repo.path(), home.path())
        .args(["config", "show", "--format", "json"])
        .env("RULEGUARD_ENGINE__MAX_WORKERS", "3")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_workers\": 3"));

    ruleguard(repo.path(), home.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("6 rules in 2 batches"));
}
