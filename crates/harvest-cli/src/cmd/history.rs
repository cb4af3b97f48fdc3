use crate::output::{format_duration, print_json, print_table};
use anyhow::Context;
use harvest_core::run::RunRecord;
use std::path::Path;

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let mut runs = RunRecord::list(root).context("failed to read run history")?;
    runs.truncate(limit);

    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    let rows = runs
        .iter()
        .map(|r| {
            vec![
                r.short_id().to_string(),
                r.trigger.kind().to_string(),
                r.status.to_string(),
                r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                format_duration(r.duration_ms()),
                match r.changes_detected {
                    Some(true) => r.changed_paths.len().to_string(),
                    Some(false) => "0".to_string(),
                    None => "-".to_string(),
                },
                r.commit
                    .as_deref()
                    .map(|c| c.get(..8).unwrap_or(c).to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(
        &["ID", "TRIGGER", "STATUS", "STARTED (UTC)", "DURATION", "CHANGES", "COMMIT"],
        rows,
    );
    Ok(())
}
