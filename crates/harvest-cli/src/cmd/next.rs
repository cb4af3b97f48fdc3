use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use harvest_core::{config::Config, schedule::format_local};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct Occurrence {
    utc: String,
    local: String,
}

pub fn run(root: &Path, count: usize, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let schedule = config
        .schedule()
        .context("invalid triggers.schedule")?
        .context("triggers.schedule is not set")?;
    let tz = config.timezone.as_deref();

    let occurrences = schedule
        .upcoming(Utc::now(), count)
        .into_iter()
        .map(|t| {
            Ok(Occurrence {
                utc: t.to_rfc3339(),
                local: format_local(t, tz)?,
            })
        })
        .collect::<harvest_core::Result<Vec<_>>>()?;

    if json {
        let value = serde_json::json!({
            "schedule": schedule.expr(),
            "timezone": schedule.timezone().name(),
            "occurrences": occurrences,
        });
        return print_json(&value);
    }

    println!("{} ({})", schedule.expr(), schedule.timezone().name());
    let rows = occurrences
        .into_iter()
        .map(|o| vec![o.local, o.utc])
        .collect();
    print_table(&["LOCAL", "UTC"], rows);
    Ok(())
}
