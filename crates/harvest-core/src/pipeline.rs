//! The run pipeline: admit the trigger, take the branch lock, then
//! checkout → runtime → install → crawl → detect changes → publish.
//!
//! Every step is fail-fast once its retry budget is spent. A run never
//! returns `Err` for a step failure; the failure is written into the
//! [`RunRecord`] so callers always get a persisted record back. `Err` is
//! reserved for the record itself being unwritable.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Config, WarnLevel};
use crate::error::{HarvestError, Result};
use crate::git::GitRepo;
use crate::lock::RunLock;
use crate::paths;
use crate::process::{self, CommandSpec, Completion};
use crate::retry::RetryPolicy;
use crate::run::{FailureClass, RunRecord, RunStatus, StepKind, StepOutcome};
use crate::runtime;
use crate::schedule::format_local;
use crate::trigger::{Admission, Trigger};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Echo subprocess output at `info` instead of `debug`.
    pub echo_output: bool,
    /// Push credential. `None` reads `publish.token_env` from the environment.
    pub token: Option<String>,
}

pub struct Runner {
    root: PathBuf,
    config: Config,
    options: RunOptions,
}

/// A failed step: which one, how many attempts it used, and why.
struct StepFailure {
    step: StepKind,
    attempts: u32,
    error: HarvestError,
}

impl StepFailure {
    fn once(step: StepKind, error: HarvestError) -> Self {
        Self {
            step,
            attempts: 1,
            error,
        }
    }
}

impl Runner {
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            root: root.into(),
            config,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn workdir(&self) -> PathBuf {
        paths::resolve(&self.root, &self.config.repository.workdir)
    }

    /// Execute one run for `trigger` and persist its record.
    pub async fn execute(&self, trigger: Trigger) -> Result<RunRecord> {
        let mut rec = RunRecord::start(trigger, self.config.repository.branch.clone());
        let span = info_span!("run", id = %rec.short_id(), trigger = %rec.trigger);
        self.execute_inner(&mut rec).instrument(span).await;
        rec.save(&self.root)?;
        Ok(rec)
    }

    async fn execute_inner(&self, rec: &mut RunRecord) {
        match rec.trigger.admit(&self.config) {
            Ok(Admission::Accepted) => {}
            Ok(Admission::Rejected(reason)) => {
                info!(%reason, "trigger does not qualify; skipping");
                rec.skip(reason);
                return;
            }
            Err(e) => {
                error!(error = %e, "cannot evaluate trigger");
                rec.fail(FailureClass::Configuration, None, e.to_string());
                return;
            }
        }

        let errors: Vec<String> = self
            .config
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            error!(errors = ?errors, "config has errors; refusing to run");
            rec.fail(FailureClass::Configuration, None, errors.join("; "));
            return;
        }

        let lock = match RunLock::acquire(
            &self.root,
            &self.config.repository.branch,
            &rec.id,
            Duration::from_secs(self.config.concurrency.wait_seconds),
            Duration::from_secs(self.config.concurrency.stale_after_seconds),
        )
        .await
        {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "could not take run lock");
                rec.fail(FailureClass::Concurrency, None, e.to_string());
                return;
            }
        };
        // Record the running state so `harvest history` shows in-flight runs.
        if let Err(e) = rec.save(&self.root) {
            warn!(error = %e, "failed to write in-progress run record");
        }

        info!("run started");
        if let Err(f) = self.run_steps(rec).await {
            error!(step = %f.step, attempts = f.attempts, error = %f.error, "step failed; aborting run");
            let message = f.error.to_string();
            if let Some(last) = rec.steps.last_mut().filter(|s| s.step == f.step) {
                last.outcome = StepOutcome::Failed;
                last.attempts = f.attempts;
                last.detail = Some(message.clone());
            } else {
                rec.record_step(f.step, StepOutcome::Failed, f.attempts, 0, Some(message.clone()));
            }
            rec.fail(f.step.failure_class(), Some(f.step), message);
        }

        if let Err(e) = lock.release() {
            warn!(error = %e, "failed to release run lock");
        }
        info!(status = %rec.status, "run finished");
    }

    async fn run_steps(&self, rec: &mut RunRecord) -> std::result::Result<(), StepFailure> {
        let env = self.config.step_env();
        let policy = &self.config.retry;

        // -- checkout ---------------------------------------------------------
        let started = Instant::now();
        let (repo, attempts) = self.checkout(policy).await?;
        let head = repo.head_sha().await.ok();
        rec.record_step(StepKind::Checkout, StepOutcome::Succeeded, attempts, elapsed(started), head);
        let workdir = repo.dir().to_path_buf();

        // -- runtime ----------------------------------------------------------
        let started = Instant::now();
        match &self.config.runtime {
            Some(rt) => {
                let info = runtime::provision(rt, &workdir, &env)
                    .await
                    .map_err(|e| StepFailure::once(StepKind::Runtime, e))?;
                rec.record_step(
                    StepKind::Runtime,
                    StepOutcome::Succeeded,
                    1,
                    elapsed(started),
                    Some(format!("{} {}", info.program, info.version)),
                );
            }
            None => rec.record_step(StepKind::Runtime, StepOutcome::Skipped, 0, 0, None),
        }

        // -- install ----------------------------------------------------------
        let started = Instant::now();
        match (&self.config.dependencies, self.config.install_argv()) {
            (Some(deps), Some(argv)) => {
                if !workdir.join(&deps.manifest).is_file() {
                    return Err(StepFailure::once(
                        StepKind::Install,
                        HarvestError::ManifestMissing(deps.manifest.clone()),
                    ));
                }
                let spec = CommandSpec::new(argv, &workdir)
                    .env(&env)
                    .echo(self.options.echo_output);
                let (res, attempts) = policy
                    .run("install", |_| process::run_checked(&spec))
                    .await;
                res.map_err(|error| StepFailure {
                    step: StepKind::Install,
                    attempts,
                    error,
                })?;
                rec.record_step(
                    StepKind::Install,
                    StepOutcome::Succeeded,
                    attempts,
                    elapsed(started),
                    Some(deps.manifest.clone()),
                );
            }
            _ => rec.record_step(StepKind::Install, StepOutcome::Skipped, 0, 0, None),
        }

        // -- crawl ------------------------------------------------------------
        let started = Instant::now();
        let detail = self
            .crawl(&workdir, &env, &rec.id)
            .await
            .map_err(|e| StepFailure::once(StepKind::Crawl, e))?;
        rec.record_step(StepKind::Crawl, StepOutcome::Succeeded, 1, elapsed(started), Some(detail));

        // -- detect changes ---------------------------------------------------
        let started = Instant::now();
        let changed = repo
            .changed_paths()
            .await
            .map_err(|e| StepFailure::once(StepKind::DetectChanges, e))?;
        let changes_detected = !changed.is_empty();
        info!(changes_detected, files = changed.len(), "working tree inspected");
        rec.changes_detected = Some(changes_detected);
        rec.changed_paths = changed;
        rec.record_step(
            StepKind::DetectChanges,
            StepOutcome::Succeeded,
            1,
            elapsed(started),
            Some(format!("changes_detected={changes_detected}")),
        );

        // -- publish ----------------------------------------------------------
        if !changes_detected {
            rec.record_step(StepKind::Publish, StepOutcome::Skipped, 0, 0, None);
            rec.finish(RunStatus::NoChanges);
            return Ok(());
        }
        let started = Instant::now();
        let (sha, attempts) = self.publish(&repo, policy).await?;
        rec.commit = Some(sha.clone());
        rec.record_step(StepKind::Publish, StepOutcome::Succeeded, attempts, elapsed(started), Some(sha));
        rec.finish(RunStatus::Succeeded);
        Ok(())
    }

    async fn checkout(&self, policy: &RetryPolicy) -> std::result::Result<(GitRepo, u32), StepFailure> {
        let repo_cfg = &self.config.repository;
        let workdir = self.workdir();
        let mut attempts = 0;
        runtime::locate("git").map_err(|e| StepFailure::once(StepKind::Checkout, e))?;

        if !GitRepo::is_repo(&workdir) {
            let Some(url) = repo_cfg.url.as_deref() else {
                return Err(StepFailure::once(
                    StepKind::Checkout,
                    HarvestError::InvalidConfig(format!(
                        "{} is not a git repository and repository.url is not set",
                        workdir.display()
                    )),
                ));
            };
            if workdir.exists() {
                // `git clone` refuses a non-empty destination such as the root.
                GitRepo::init(&workdir, &repo_cfg.remote, url)
                    .await
                    .map_err(|e| StepFailure::once(StepKind::Checkout, e))?;
            } else {
                let (res, used) = policy
                    .run("clone", |_| {
                        GitRepo::clone(url, &repo_cfg.remote, &repo_cfg.branch, &workdir)
                    })
                    .await;
                attempts += used;
                res.map_err(|error| StepFailure {
                    step: StepKind::Checkout,
                    attempts,
                    error,
                })?;
            }
        }

        let repo = GitRepo::open(&workdir);
        if let Some(entry) = exclude_entry(&workdir, &self.root) {
            repo.exclude(&entry)
                .map_err(|e| StepFailure::once(StepKind::Checkout, e))?;
        }

        let (res, used) = policy
            .run("fetch", |_| repo.fetch(&repo_cfg.remote, &repo_cfg.branch))
            .await;
        attempts += used;
        res.map_err(|error| StepFailure {
            step: StepKind::Checkout,
            attempts,
            error,
        })?;

        repo.checkout_tip(&repo_cfg.remote, &repo_cfg.branch, repo_cfg.clean)
            .await
            .map_err(|error| StepFailure {
                step: StepKind::Checkout,
                attempts,
                error,
            })?;
        info!(workdir = %workdir.display(), branch = %repo_cfg.branch, "checked out");
        Ok((repo, attempts))
    }

    async fn crawl(&self, workdir: &Path, env: &[(String, String)], run_id: &str) -> Result<String> {
        let script = &self.config.script;
        let spec = CommandSpec::new(self.config.script_argv(), workdir)
            .env(env)
            .timeout(script.timeout_seconds.map(Duration::from_secs))
            .log_to(Some(paths::run_log_path(&self.root, run_id)))
            .echo(self.options.echo_output);
        info!(command = %spec.display(), "running crawl script");
        match process::run(&spec).await? {
            Completion::Exited(out) if out.success() => {
                Ok(format!("exited 0 in {}ms", out.duration_ms))
            }
            Completion::Exited(out) => Err(HarvestError::ScriptFailed {
                status: out.status.to_string(),
            }),
            Completion::TimedOut { after } => Err(HarvestError::ScriptTimedOut(after.as_secs())),
        }
    }

    async fn publish(
        &self,
        repo: &GitRepo,
        policy: &RetryPolicy,
    ) -> std::result::Result<(String, u32), StepFailure> {
        let publish = &self.config.publish;
        let fail = |error| StepFailure::once(StepKind::Publish, error);

        repo.configure_identity(&publish.author_name, &publish.author_email)
            .await
            .map_err(fail)?;
        repo.add_all().await.map_err(fail)?;
        let stamp = format_local(Utc::now(), self.config.timezone.as_deref()).map_err(fail)?;
        let message = publish.render_message(&stamp);
        let sha = repo.commit(&message).await.map_err(fail)?;
        info!(commit = %sha, %message, "committed crawl output");

        let token = self.token();
        if token.is_none() {
            info!(token_env = %publish.token_env, "no push token set; using ambient git credentials");
        }
        let branch = &self.config.repository.branch;
        let remote = &self.config.repository.remote;
        let (res, attempts) = policy
            .run("push", |_| repo.push(remote, branch, token.as_deref()))
            .await;
        if let Err(HarvestError::PushRejected(_)) = &res {
            if let Ok(Some(tip)) = repo.remote_sha(remote, branch).await {
                warn!(remote_tip = %tip, "remote branch moved during the run; publish abandoned");
            }
        }
        res.map_err(|error| StepFailure {
            step: StepKind::Publish,
            attempts,
            error,
        })?;
        Ok((sha, attempts))
    }

    fn token(&self) -> Option<String> {
        self.options
            .token
            .clone()
            .or_else(|| std::env::var(&self.config.publish.token_env).ok())
            .filter(|t| !t.trim().is_empty())
    }
}

/// Exclude pattern that hides the runner's state directory when it lives
/// inside the working tree.
fn exclude_entry(workdir: &Path, root: &Path) -> Option<String> {
    let workdir = std::fs::canonicalize(workdir).unwrap_or_else(|_| workdir.to_path_buf());
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let rel = root.strip_prefix(&workdir).ok()?;
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() {
        Some(format!("/{}/", paths::HARVEST_DIR))
    } else {
        Some(format!("/{rel}/{}/", paths::HARVEST_DIR))
    }
}

fn elapsed(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
