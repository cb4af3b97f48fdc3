use crate::output::{format_duration, print_json, print_table};
use anyhow::Context;
use harvest_core::{paths, run::RunRecord, run::StepKind};
use std::path::Path;

pub fn run(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let rec = RunRecord::find(root, id).with_context(|| format!("no run matching '{id}'"))?;

    if json {
        return print_json(&rec);
    }

    println!("Run:      {}", rec.id);
    println!("Trigger:  {}", rec.trigger);
    println!("Branch:   {}", rec.branch);
    println!("Status:   {}", rec.status);
    println!("Started:  {}", rec.started_at.to_rfc3339());
    println!("Duration: {}", format_duration(rec.duration_ms()));
    if let Some(reason) = &rec.skip_reason {
        println!("Skipped:  {reason}");
    }
    if let Some(changes) = rec.changes_detected {
        println!("Changes:  {changes}");
    }
    if let Some(commit) = &rec.commit {
        println!("Commit:   {commit}");
    }
    if let Some(f) = &rec.failure {
        match f.step {
            Some(step) => println!("Failure:  {} at {step}: {}", f.class, f.message),
            None => println!("Failure:  {}: {}", f.class, f.message),
        }
    }

    if !rec.steps.is_empty() {
        println!();
        let rows = StepKind::all()
            .iter()
            .map(|&kind| match rec.step(kind) {
                Some(s) => vec![
                    kind.to_string(),
                    s.outcome.as_str().to_string(),
                    s.attempts.to_string(),
                    format_duration(Some(s.duration_ms as i64)),
                    s.detail.clone().unwrap_or_default(),
                ],
                None => vec![
                    kind.to_string(),
                    "not reached".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    String::new(),
                ],
            })
            .collect();
        print_table(&["STEP", "OUTCOME", "ATTEMPTS", "DURATION", "DETAIL"], rows);
    }

    if !rec.changed_paths.is_empty() {
        println!("\nChanged paths:");
        for p in &rec.changed_paths {
            println!("  {p}");
        }
    }

    let log = paths::run_log_path(root, &rec.id);
    if log.exists() {
        println!("\nScript log: {}", log.display());
    }
    Ok(())
}
