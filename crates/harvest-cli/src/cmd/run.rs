use crate::output::{format_duration, print_json};
use anyhow::Context;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use clap::ValueEnum;
use harvest_core::{
    config::Config,
    pipeline::{RunOptions, Runner},
    run::{RunRecord, RunStatus},
    trigger::Trigger,
};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TriggerArg {
    Manual,
    Schedule,
    Push,
}

pub fn run(
    root: &Path,
    trigger: TriggerArg,
    git_ref: Option<String>,
    at: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    // An invalid schedule surfaces as a recorded configuration failure.
    let resolution = match config.schedule() {
        Ok(Some(schedule)) => schedule.resolution(),
        _ => TimeDelta::minutes(1),
    };
    let trigger = build_trigger(trigger, git_ref, at, resolution)?;
    let runner = Runner::new(root, config).with_options(RunOptions {
        echo_output: true,
        token: None,
    });

    let rt = tokio::runtime::Runtime::new()?;
    let rec = rt
        .block_on(runner.execute(trigger))
        .context("failed to record run")?;
    report(&rec, json)
}

fn build_trigger(
    kind: TriggerArg,
    git_ref: Option<String>,
    at: Option<&str>,
    resolution: TimeDelta,
) -> anyhow::Result<Trigger> {
    match kind {
        TriggerArg::Manual => Ok(Trigger::Manual),
        TriggerArg::Push => {
            let git_ref = git_ref.context("--ref is required with --trigger push")?;
            Ok(Trigger::Push { git_ref })
        }
        TriggerArg::Schedule => {
            let scheduled_for = match at {
                Some(s) => DateTime::parse_from_rfc3339(s)
                    .with_context(|| format!("invalid --at '{s}', expected RFC 3339"))?
                    .with_timezone(&Utc),
                None => Utc::now().duration_trunc(resolution)?,
            };
            Ok(Trigger::Schedule { scheduled_for })
        }
    }
}

/// Print the outcome of a finished run. A failed run is an error so the
/// process exits non-zero.
pub fn report(rec: &RunRecord, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(rec)?;
    } else {
        println!("run {} ({})", rec.short_id(), rec.trigger);
        match rec.status {
            RunStatus::Succeeded => println!(
                "  published {} changed file(s) as {}",
                rec.changed_paths.len(),
                rec.commit.as_deref().unwrap_or("-")
            ),
            RunStatus::NoChanges => println!("  crawl produced no changes; nothing published"),
            RunStatus::Skipped => println!(
                "  skipped: {}",
                rec.skip_reason.as_deref().unwrap_or("trigger did not qualify")
            ),
            RunStatus::Failed | RunStatus::Running => {}
        }
        println!("  status: {} in {}", rec.status, format_duration(rec.duration_ms()));
    }

    if !rec.status.is_failure() {
        return Ok(());
    }
    match &rec.failure {
        Some(f) => match f.step {
            Some(step) => anyhow::bail!(
                "run {} failed at {step} ({}): {}",
                rec.short_id(),
                f.class,
                f.message
            ),
            None => anyhow::bail!("run {} failed ({}): {}", rec.short_id(), f.class, f.message),
        },
        None => anyhow::bail!("run {} failed", rec.short_id()),
    }
}
