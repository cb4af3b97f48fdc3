#![allow(deprecated)]
use assert_cmd::Command;
use harvest_core::config::Config;
use predicates::prelude::*;
use tempfile::TempDir;

fn harvest(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("harvest").unwrap();
    cmd.current_dir(dir.path())
        .env("HARVEST_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    harvest(dir).arg("init").assert().success();
}

fn edit_config(dir: &TempDir, f: impl FnOnce(&mut Config)) {
    let mut cfg = Config::load(dir.path()).unwrap();
    f(&mut cfg);
    cfg.save(dir.path()).unwrap();
}

// ---------------------------------------------------------------------------
// harvest init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_config() {
    let dir = TempDir::new().unwrap();
    harvest(&dir)
        .args(["init", "--script", "arXiv/process.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .harvest/config.yaml"));

    assert!(dir.path().join(".harvest/runs").is_dir());
    assert!(dir.path().join(".harvest/locks").is_dir());
    let cfg = Config::load(dir.path()).unwrap();
    assert_eq!(cfg.script.path, "arXiv/process.py");
    assert_eq!(cfg.triggers.schedule.as_deref(), Some("0 0 * * *"));
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    harvest(&dir).arg("init").assert().success();
    edit_config(&dir, |c| c.repository.branch = "data".into());
    harvest(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .harvest/config.yaml"));

    // An existing config is never overwritten.
    assert_eq!(Config::load(dir.path()).unwrap().repository.branch, "data");
}

#[test]
fn init_excludes_state_dir_in_git_repo() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".git/info")).unwrap();
    init_project(&dir);
    harvest(&dir).arg("init").assert().success();

    let exclude = std::fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
    assert_eq!(exclude.matches("/.harvest/").count(), 1);
}

// ---------------------------------------------------------------------------
// harvest config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_passes_on_scaffold() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    harvest(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_rejects_bad_schedule() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    edit_config(&dir, |c| c.triggers.schedule = Some("every midnight".into()));
    harvest(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_show_json() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let out = harvest(&dir)
        .args(["--json", "config", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value["publish"]["token_env"], "GITHUB_TOKEN");
    assert_eq!(value["concurrency"]["wait_seconds"], 600);
}

// ---------------------------------------------------------------------------
// harvest next
// ---------------------------------------------------------------------------

#[test]
fn next_lists_occurrences() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    edit_config(&dir, |c| c.timezone = Some("Asia/Shanghai".into()));
    let out = harvest(&dir)
        .args(["--json", "next", "--count", "3"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let occurrences = value["occurrences"].as_array().unwrap();
    assert_eq!(occurrences.len(), 3);
    for o in occurrences {
        assert!(o["local"].as_str().unwrap().ends_with("00:00:00"));
        assert!(o["utc"].as_str().unwrap().contains("T16:00:00"));
    }
}

#[test]
fn next_without_schedule_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    edit_config(&dir, |c| c.triggers.schedule = None);
    harvest(&dir)
        .arg("next")
        .assert()
        .failure()
        .stderr(predicate::str::contains("triggers.schedule is not set"));
}

// ---------------------------------------------------------------------------
// harvest run / history / show
// ---------------------------------------------------------------------------

#[test]
fn run_without_init_fails() {
    let dir = TempDir::new().unwrap();
    harvest(&dir)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn push_to_other_branch_is_skipped() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    harvest(&dir)
        .args(["run", "--trigger", "push", "--ref", "refs/heads/dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped"));

    harvest(&dir)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("push").and(predicate::str::contains("skipped")));
}

#[test]
fn push_trigger_requires_ref() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    harvest(&dir)
        .args(["run", "--trigger", "push"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--ref is required"));
}

#[test]
fn failed_checkout_exits_nonzero_and_is_recorded() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    harvest(&dir)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed at checkout (environment_setup)"));

    let out = harvest(&dir)
        .args(["--json", "history"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let runs: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["status"], "failed");
    assert_eq!(runs[0]["failure"]["class"], "environment_setup");

    let id = runs[0]["id"].as_str().unwrap();
    harvest(&dir)
        .args(["show", &id[..8]])
        .assert()
        .success()
        .stdout(predicate::str::contains(id).and(predicate::str::contains("not reached")));
}

#[test]
fn history_empty() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    harvest(&dir)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded."));
}

#[test]
fn show_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    harvest(&dir)
        .args(["show", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no run matching 'does-not-exist'"));
}

#[test]
fn watch_without_schedule_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    edit_config(&dir, |c| c.triggers.schedule = None);
    harvest(&dir)
        .args(["watch", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to watch"));
}
