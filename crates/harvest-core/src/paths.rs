use crate::error::{HarvestError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const HARVEST_DIR: &str = ".harvest";
pub const RUNS_DIR: &str = ".harvest/runs";
pub const LOCKS_DIR: &str = ".harvest/locks";

pub const CONFIG_FILE: &str = ".harvest/config.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn runs_dir(root: &Path) -> PathBuf {
    root.join(RUNS_DIR)
}

pub fn run_record_path(root: &Path, run_id: &str) -> PathBuf {
    runs_dir(root).join(format!("{run_id}.yaml"))
}

pub fn run_log_path(root: &Path, run_id: &str) -> PathBuf {
    runs_dir(root).join(format!("{run_id}.log"))
}

pub fn locks_dir(root: &Path) -> PathBuf {
    root.join(LOCKS_DIR)
}

/// Lock file for the concurrency group of `branch`. `%` and `/` are
/// percent-encoded so every branch maps to its own flat file name.
pub fn lock_path(root: &Path, branch: &str) -> PathBuf {
    let name = branch.replace('%', "%25").replace('/', "%2F");
    locks_dir(root).join(format!("{name}.lock"))
}

/// Resolve a configured path against the project root. Absolute paths pass
/// through untouched.
pub fn resolve(root: &Path, configured: &str) -> PathBuf {
    let p = Path::new(configured);
    if p.is_absolute() {
        p.to_path_buf()
    } else if configured == "." || configured.is_empty() {
        root.to_path_buf()
    } else {
        root.join(p)
    }
}

// ---------------------------------------------------------------------------
// Branch validation
// ---------------------------------------------------------------------------

static BRANCH_RE: OnceLock<Regex> = OnceLock::new();

fn branch_re() -> &'static Regex {
    BRANCH_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._][A-Za-z0-9._\-/]*$").expect("branch regex is valid")
    })
}

/// Reject names git would refuse as a branch, plus anything that could be
/// read as an option by a git subcommand.
pub fn validate_branch(branch: &str) -> Result<()> {
    let bad = branch.is_empty()
        || branch.len() > 200
        || !branch_re().is_match(branch)
        || branch.contains("..")
        || branch.contains("//")
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.ends_with('.');
    if bad {
        return Err(HarvestError::InvalidBranch(branch.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
