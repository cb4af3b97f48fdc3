use crate::cmd::run::report;
use anyhow::Context;
use chrono::Utc;
use harvest_core::{
    config::Config,
    pipeline::{RunOptions, Runner},
    schedule::{format_local, Schedule},
    trigger::Trigger,
};
use std::path::Path;
use tokio::sync::watch;
use tracing::{error, info};

pub fn run(root: &Path, once: bool, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let schedule = config
        .schedule()
        .context("invalid triggers.schedule")?
        .context("triggers.schedule is not set; nothing to watch")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(watch_loop(root, config, schedule, once, json))
}

async fn watch_loop(
    root: &Path,
    config: Config,
    schedule: Schedule,
    once: bool,
    json: bool,
) -> anyhow::Result<()> {
    let timezone = config.timezone.clone();
    let runner = Runner::new(root, config).with_options(RunOptions {
        echo_output: true,
        token: None,
    });

    // Ctrl-C stops the loop between runs; an in-flight run is allowed to finish.
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after the current run");
            let _ = stop_tx.send(true);
        }
    });

    info!(schedule = %schedule.expr(), tz = %schedule.timezone(), "watching");
    loop {
        let now = Utc::now();
        let next = schedule
            .next_after(now)
            .context("schedule has no future occurrences")?;
        let local = format_local(next, timezone.as_deref())?;
        info!(next = %next.to_rfc3339(), %local, "sleeping until next occurrence");

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop_rx.changed() => {
                info!("stopped");
                return Ok(());
            }
        }

        let outcome = runner
            .execute(Trigger::Schedule {
                scheduled_for: next,
            })
            .await;
        match outcome {
            Ok(rec) => {
                let reported = report(&rec, json);
                if once {
                    return reported;
                }
                if let Err(e) = reported {
                    error!(error = %format!("{e:#}"), "run failed; waiting for next occurrence");
                }
            }
            Err(e) if once => return Err(e).context("failed to record run"),
            Err(e) => error!(error = %e, "failed to record run"),
        }

        if *stop_rx.borrow() {
            info!("stopped");
            return Ok(());
        }
    }
}
