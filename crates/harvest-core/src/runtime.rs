//! Interpreter discovery and version pinning for the crawl script.
//!
//! The runtime step resolves the configured program on `PATH`, asks it for
//! its version (`<program> --version`, reading both streams since some
//! interpreters print the banner on stderr), and compares the reported
//! version against the pinned prefix component by component, so `3.1` pins
//! `3.1.x` but not `3.10.x`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{HarvestError, Result};
use crate::process::{run_checked, CommandSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub program: String,
    pub path: PathBuf,
    pub version: String,
}

/// Locate `program` on `PATH`.
pub fn locate(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|_| HarvestError::RuntimeNotFound(program.to_string()))
}

/// Resolve the interpreter and enforce the pinned version.
pub async fn provision(
    cfg: &RuntimeConfig,
    cwd: &Path,
    env: &[(String, String)],
) -> Result<RuntimeInfo> {
    let path = locate(&cfg.program)?;
    let spec = CommandSpec::new(
        vec![path.to_string_lossy().into_owned(), "--version".to_string()],
        cwd,
    )
    .env(env);
    let out = run_checked(&spec).await?;
    let banner = format!("{}\n{}", out.stdout, out.stderr);
    let version = extract_version(&banner).ok_or_else(|| HarvestError::RuntimeVersionMismatch {
        expected: cfg.version.clone().unwrap_or_else(|| "any".to_string()),
        found: banner.trim().to_string(),
    })?;

    if let Some(pinned) = &cfg.version {
        if !version_matches(pinned, &version) {
            return Err(HarvestError::RuntimeVersionMismatch {
                expected: pinned.clone(),
                found: version,
            });
        }
    }

    info!(program = %cfg.program, path = %path.display(), %version, "runtime ready");
    Ok(RuntimeInfo {
        program: cfg.program.clone(),
        path,
        version,
    })
}

static VERSION_RE: OnceLock<Regex> = OnceLock::new();

fn version_re() -> &'static Regex {
    VERSION_RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)+)").expect("version regex is valid"))
}

/// First dotted version number in an interpreter banner.
pub fn extract_version(banner: &str) -> Option<String> {
    version_re()
        .captures(banner)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether every component of `pinned` equals the matching leading component
/// of `found`.
pub fn version_matches(pinned: &str, found: &str) -> bool {
    let pinned: Vec<&str> = pinned.trim().trim_start_matches('v').split('.').collect();
    let found: Vec<&str> = found.split('.').collect();
    if pinned.len() > found.len() {
        return false;
    }
    pinned.iter().zip(found.iter()).all(|(p, f)| p == f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn extracts_python_banner() {
        assert_eq!(extract_version("Python 3.10.12").as_deref(), Some("3.10.12"));
        assert_eq!(
            extract_version("node v20.11.1\n").as_deref(),
            Some("20.11.1")
        );
        assert_eq!(extract_version("no digits here"), None);
    }

    #[test]
    fn pin_matches_by_component() {
        assert!(version_matches("3.10", "3.10.12"));
        assert!(version_matches("3", "3.12.1"));
        assert!(version_matches("3.10.12", "3.10.12"));
        assert!(!version_matches("3.1", "3.10.12"));
        assert!(!version_matches("3.11", "3.10.12"));
        assert!(!version_matches("3.10.12.1", "3.10.12"));
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cfg = RuntimeConfig {
            program: "__harvest_missing_interpreter__".into(),
            version: Some("3.10".into()),
        };
        assert!(matches!(
            provision(&cfg, dir.path(), &[]).await,
            Err(HarvestError::RuntimeNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pinned_version_is_enforced() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("fakepy");
        std::fs::write(&bin, "#!/bin/sh\necho 'Python 3.9.18' >&2\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let program = bin.to_string_lossy().into_owned();

        let ok = RuntimeConfig {
            program: program.clone(),
            version: Some("3.9".into()),
        };
        let info = provision(&ok, dir.path(), &[]).await.unwrap();
        assert_eq!(info.version, "3.9.18");

        let pinned = RuntimeConfig {
            program,
            version: Some("3.10".into()),
        };
        assert!(matches!(
            provision(&pinned, dir.path(), &[]).await,
            Err(HarvestError::RuntimeVersionMismatch { .. })
        ));
    }
}
