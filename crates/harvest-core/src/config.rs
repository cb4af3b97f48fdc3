use crate::error::{HarvestError, Result};
use crate::paths;
use crate::retry::RetryPolicy;
use crate::schedule::{parse_timezone, Schedule};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// RepositoryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Working tree the pipeline operates on, relative to the project root.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Clone URL used when `workdir` is not yet a git repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Reset and clean the tree before the crawl so only fresh output is published.
    #[serde(default = "default_true")]
    pub clean: bool,
}

fn default_workdir() -> String {
    ".".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            url: None,
            remote: default_remote(),
            branch: default_branch(),
            clean: true,
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default = "default_push_branches")]
    pub push_branches: Vec<String>,
}

fn default_push_branches() -> Vec<String> {
    vec![default_branch()]
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            schedule: None,
            push_branches: default_push_branches(),
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig / DependencyConfig / ScriptConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub program: String,
    /// Version prefix the interpreter must report, e.g. `3.10`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub manifest: String,
    /// Explicit install argv. Empty means `<runtime> -m pip install -r <manifest>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

// ---------------------------------------------------------------------------
// PublishConfig
// ---------------------------------------------------------------------------

pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    #[serde(default = "default_message")]
    pub message: String,
    /// Environment variable holding the push token. Unset means ambient git
    /// credentials are used.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_author_name() -> String {
    "github-actions[bot]".to_string()
}

fn default_author_email() -> String {
    "github-actions[bot]@users.noreply.github.com".to_string()
}

fn default_message() -> String {
    format!("Automated update: {TIMESTAMP_PLACEHOLDER}")
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
            message: default_message(),
            token_env: default_token_env(),
        }
    }
}

impl PublishConfig {
    pub fn render_message(&self, timestamp: &str) -> String {
        self.message.replace(TIMESTAMP_PLACEHOLDER, timestamp)
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
}

fn default_wait_seconds() -> u64 {
    600
}

fn default_stale_after() -> u64 {
    7200
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            wait_seconds: default_wait_seconds(),
            stale_after_seconds: default_stale_after(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    /// IANA zone used for schedules and timestamps; exported as `TZ`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyConfig>,
    pub script: ScriptConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            repository: RepositoryConfig::default(),
            triggers: TriggerConfig::default(),
            timezone: None,
            env: BTreeMap::new(),
            runtime: None,
            dependencies: None,
            script: ScriptConfig {
                path: String::new(),
                interpreter: None,
                args: Vec::new(),
                timeout_seconds: None,
            },
            publish: PublishConfig::default(),
            retry: RetryPolicy::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }

    /// Starter config for a Python crawler: daily at midnight, pinned
    /// interpreter, pip manifest.
    pub fn scaffold(project_name: impl Into<String>, script_path: &str) -> Self {
        let mut cfg = Self::new(project_name);
        cfg.triggers.schedule = Some("0 0 * * *".to_string());
        cfg.runtime = Some(RuntimeConfig {
            program: "python".to_string(),
            version: Some("3.10".to_string()),
        });
        cfg.dependencies = Some(DependencyConfig {
            manifest: "requirements.txt".to_string(),
            command: Vec::new(),
        });
        cfg.script.path = script_path.to_string();
        cfg
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(HarvestError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn schedule(&self) -> Result<Option<Schedule>> {
        self.triggers
            .schedule
            .as_deref()
            .map(|expr| Schedule::parse(expr, self.timezone.as_deref()))
            .transpose()
    }

    /// Variables exported to every step. `timezone` wins over an explicit
    /// `TZ` entry in `env`.
    pub fn step_env(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .env
            .iter()
            .filter(|(k, _)| !(self.timezone.is_some() && k.as_str() == "TZ"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(tz) = &self.timezone {
            vars.push(("TZ".to_string(), tz.clone()));
        }
        vars
    }

    /// Full argv of the dependency install step, if one is configured.
    pub fn install_argv(&self) -> Option<Vec<String>> {
        let deps = self.dependencies.as_ref()?;
        if !deps.command.is_empty() {
            return Some(deps.command.clone());
        }
        let program = self
            .runtime
            .as_ref()
            .map(|r| r.program.clone())
            .unwrap_or_else(|| "python".to_string());
        Some(vec![
            program,
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "-r".to_string(),
            deps.manifest.clone(),
        ])
    }

    /// Full argv of the crawl step.
    pub fn script_argv(&self) -> Vec<String> {
        let interpreter = self
            .script
            .interpreter
            .clone()
            .or_else(|| self.runtime.as_ref().map(|r| r.program.clone()));
        let mut argv = Vec::with_capacity(self.script.args.len() + 2);
        if let Some(i) = interpreter {
            argv.push(i);
        }
        argv.push(self.script.path.clone());
        argv.extend(self.script.args.iter().cloned());
        argv
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        // Schedule and timezone must parse.
        if let Err(e) = parse_timezone(self.timezone.as_deref()) {
            push(WarnLevel::Error, e.to_string());
        } else if let Some(expr) = &self.triggers.schedule {
            if let Err(e) = Schedule::parse(expr, self.timezone.as_deref()) {
                push(WarnLevel::Error, e.to_string());
            }
        }

        if self.triggers.schedule.is_none() && self.triggers.push_branches.is_empty() {
            push(
                WarnLevel::Warning,
                "no schedule and no push branches: only manual runs will start".to_string(),
            );
        }

        if let Err(e) = paths::validate_branch(&self.repository.branch) {
            push(WarnLevel::Error, format!("repository.branch: {e}"));
        }
        for b in &self.triggers.push_branches {
            if let Err(e) = paths::validate_branch(b) {
                push(WarnLevel::Error, format!("triggers.push_branches: {e}"));
            }
        }
        if !self.triggers.push_branches.is_empty()
            && !self
                .triggers
                .push_branches
                .contains(&self.repository.branch)
        {
            push(
                WarnLevel::Warning,
                format!(
                    "push triggers do not include '{}', the branch results are published to",
                    self.repository.branch
                ),
            );
        }

        if self.script.path.trim().is_empty() {
            push(WarnLevel::Error, "script.path is empty".to_string());
        }
        if self.script.timeout_seconds == Some(0) {
            push(
                WarnLevel::Error,
                "script.timeout_seconds must be greater than 0".to_string(),
            );
        }

        if let Some(rt) = &self.runtime {
            if rt.program.trim().is_empty() {
                push(WarnLevel::Error, "runtime.program is empty".to_string());
            }
        }
        if let Some(deps) = &self.dependencies {
            if deps.manifest.trim().is_empty() {
                push(WarnLevel::Error, "dependencies.manifest is empty".to_string());
            }
        }

        if !self.publish.message.contains(TIMESTAMP_PLACEHOLDER) {
            push(
                WarnLevel::Warning,
                format!(
                    "publish.message has no {TIMESTAMP_PLACEHOLDER} placeholder; commits will be indistinguishable"
                ),
            );
        }
        if !email_re().is_match(&self.publish.author_email) {
            push(
                WarnLevel::Warning,
                format!(
                    "publish.author_email '{}' does not look like an email address",
                    self.publish.author_email
                ),
            );
        }

        if self.retry.max_attempts == 0 {
            push(
                WarnLevel::Error,
                "retry.max_attempts must be at least 1".to_string(),
            );
        } else if self.retry.max_attempts > 10 {
            push(
                WarnLevel::Warning,
                format!(
                    "retry.max_attempts={} (>10 is unusual)",
                    self.retry.max_attempts
                ),
            );
        }

        if self.timezone.is_some() && self.env.contains_key("TZ") {
            push(
                WarnLevel::Warning,
                "env.TZ is overridden by timezone".to_string(),
            );
        }

        if self.concurrency.stale_after_seconds == 0 {
            push(
                WarnLevel::Warning,
                "concurrency.stale_after_seconds=0 breaks every held lock immediately".to_string(),
            );
        }

        warnings
    }
}

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();

fn email_re() -> &'static Regex {
    EMAIL_RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("email regex is valid"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scaffold_roundtrip() {
        let cfg = Config::scaffold("papers", "arXiv/process.py");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.project.name, "papers");
        assert_eq!(parsed.script.path, "arXiv/process.py");
        assert_eq!(parsed.triggers.schedule.as_deref(), Some("0 0 * * *"));
        assert_eq!(parsed.runtime, cfg.runtime);
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let yaml = "project:\n  name: papers\nscript:\n  path: crawl.py\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.repository.branch, "main");
        assert_eq!(cfg.repository.remote, "origin");
        assert!(cfg.repository.clean);
        assert_eq!(cfg.triggers.push_branches, vec!["main".to_string()]);
        assert_eq!(cfg.publish.token_env, "GITHUB_TOKEN");
        assert_eq!(cfg.concurrency.wait_seconds, 600);
        assert!(cfg.runtime.is_none());

        let out = serde_yaml::to_string(&cfg).unwrap();
        assert!(!out.contains("runtime"));
        assert!(!out.contains("dependencies"));
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(HarvestError::NotInitialized)
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        cfg.timezone = Some("Asia/Shanghai".into());
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.timezone.as_deref(), Some("Asia/Shanghai"));
    }

    #[test]
    fn install_argv_defaults_to_pip() {
        let cfg = Config::scaffold("papers", "arXiv/process.py");
        assert_eq!(
            cfg.install_argv().unwrap(),
            vec!["python", "-m", "pip", "install", "-r", "requirements.txt"]
        );
    }

    #[test]
    fn install_argv_override() {
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        if let Some(d) = cfg.dependencies.as_mut() {
            d.command = vec!["uv".into(), "pip".into(), "sync".into()];
        }
        assert_eq!(cfg.install_argv().unwrap(), vec!["uv", "pip", "sync"]);
    }

    #[test]
    fn script_argv_uses_runtime_program() {
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        assert_eq!(cfg.script_argv(), vec!["python", "arXiv/process.py"]);

        cfg.script.interpreter = Some("sh".into());
        cfg.script.args = vec!["--fast".into()];
        assert_eq!(cfg.script_argv(), vec!["sh", "arXiv/process.py", "--fast"]);

        cfg.script.interpreter = None;
        cfg.runtime = None;
        assert_eq!(cfg.script_argv(), vec!["arXiv/process.py", "--fast"]);
    }

    #[test]
    fn step_env_exports_timezone() {
        let mut cfg = Config::new("papers");
        cfg.env.insert("TZ".into(), "UTC".into());
        cfg.env.insert("LANG".into(), "C.UTF-8".into());
        cfg.timezone = Some("Asia/Shanghai".into());
        let env = cfg.step_env();
        assert!(env.contains(&("TZ".to_string(), "Asia/Shanghai".to_string())));
        assert!(!env.contains(&("TZ".to_string(), "UTC".to_string())));
        assert!(env.contains(&("LANG".to_string(), "C.UTF-8".to_string())));
    }

    #[test]
    fn render_message_substitutes_timestamp() {
        let p = PublishConfig::default();
        assert_eq!(
            p.render_message("2024-01-02 03:04:05"),
            "Automated update: 2024-01-02 03:04:05"
        );
    }

    #[test]
    fn validate_scaffold_is_clean() {
        let cfg = Config::scaffold("papers", "arXiv/process.py");
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
    }

    #[test]
    fn validate_bad_schedule_is_error() {
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        cfg.triggers.schedule = Some("daily".into());
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("invalid schedule")));
    }

    #[test]
    fn validate_unknown_timezone_is_error() {
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        cfg.timezone = Some("Nowhere/City".into());
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("unknown timezone")));
    }

    #[test]
    fn validate_empty_script_is_error() {
        let cfg = Config::new("papers");
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("script.path")));
    }

    #[test]
    fn validate_message_without_timestamp_warns() {
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        cfg.publish.message = "update".into();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("{timestamp}")));
    }

    #[test]
    fn validate_retry_bounds() {
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        cfg.retry.max_attempts = 0;
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("max_attempts")));
        cfg.retry.max_attempts = 15;
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("max_attempts=15") && w.message.contains(">10 is unusual")));
    }

    #[test]
    fn validate_push_branch_mismatch_warns() {
        let mut cfg = Config::scaffold("papers", "arXiv/process.py");
        cfg.triggers.push_branches = vec!["dev".into()];
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("push triggers")));
    }

    #[test]
    fn validate_no_triggers_warns() {
        let mut cfg = Config::new("papers");
        cfg.script.path = "crawl.py".into();
        cfg.triggers.push_branches.clear();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("only manual runs")));
    }
}
