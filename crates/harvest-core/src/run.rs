use crate::error::{HarvestError, Result};
use crate::paths;
use crate::trigger::Trigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Checkout,
    Runtime,
    Install,
    Crawl,
    DetectChanges,
    Publish,
}

impl StepKind {
    pub fn all() -> &'static [StepKind] {
        &[
            StepKind::Checkout,
            StepKind::Runtime,
            StepKind::Install,
            StepKind::Crawl,
            StepKind::DetectChanges,
            StepKind::Publish,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Checkout => "checkout",
            StepKind::Runtime => "runtime",
            StepKind::Install => "install",
            StepKind::Crawl => "crawl",
            StepKind::DetectChanges => "detect_changes",
            StepKind::Publish => "publish",
        }
    }

    /// Error class a failure of this step belongs to.
    pub fn failure_class(self) -> FailureClass {
        match self {
            StepKind::Checkout | StepKind::Runtime | StepKind::Install => {
                FailureClass::EnvironmentSetup
            }
            StepKind::Crawl => FailureClass::ScriptExecution,
            StepKind::DetectChanges | StepKind::Publish => FailureClass::Publish,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Skipped,
    Failed,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Changes were committed and pushed.
    Succeeded,
    /// The crawl produced nothing new; no commit was made.
    NoChanges,
    Failed,
    /// The trigger did not qualify; no step ran.
    Skipped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::NoChanges => "no_changes",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn is_failure(self) -> bool {
        self == RunStatus::Failed
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Configuration,
    Concurrency,
    EnvironmentSetup,
    ScriptExecution,
    Publish,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Configuration => "configuration",
            FailureClass::Concurrency => "concurrency",
            FailureClass::EnvironmentSetup => "environment_setup",
            FailureClass::ScriptExecution => "script_execution",
            FailureClass::Publish => "publish",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: StepKind,
    pub outcome: StepOutcome,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub class: FailureClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepKind>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub trigger: Trigger,
    pub branch: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes_detected: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Why a non-qualifying trigger was turned away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl RunRecord {
    pub fn start(trigger: Trigger, branch: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trigger,
            branch: branch.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            changes_detected: None,
            changed_paths: Vec::new(),
            commit: None,
            failure: None,
            skip_reason: None,
        }
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    pub fn record_step(
        &mut self,
        step: StepKind,
        outcome: StepOutcome,
        attempts: u32,
        duration_ms: u64,
        detail: Option<String>,
    ) {
        self.steps.push(StepRecord {
            step,
            outcome,
            attempts,
            duration_ms,
            detail,
        });
    }

    pub fn step(&self, kind: StepKind) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step == kind)
    }

    pub fn fail(&mut self, class: FailureClass, step: Option<StepKind>, message: impl Into<String>) {
        self.failure = Some(RunFailure {
            class,
            step,
            message: message.into(),
        });
        self.finish(RunStatus::Failed);
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skip_reason = Some(reason.into());
        self.finish(RunStatus::Skipped);
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::run_record_path(root, &self.id);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn load(root: &Path, id: &str) -> Result<Self> {
        let path = paths::run_record_path(root, id);
        if !path.exists() {
            return Err(HarvestError::RunNotFound(id.to_string()));
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// All recorded runs, newest first. Unreadable records are skipped.
    pub fn list(root: &Path) -> Result<Vec<Self>> {
        let dir = paths::runs_dir(root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_yaml::from_str::<RunRecord>(&data) {
                Ok(r) => runs.push(r),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Resolve a full id or a unique id prefix.
    pub fn find(root: &Path, id_or_prefix: &str) -> Result<Self> {
        if paths::run_record_path(root, id_or_prefix).exists() {
            return Self::load(root, id_or_prefix);
        }
        let mut matches: Vec<RunRecord> = Self::list(root)?
            .into_iter()
            .filter(|r| r.id.starts_with(id_or_prefix))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            _ => Err(HarvestError::RunNotFound(id_or_prefix.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
