use anyhow::Context;
use harvest_core::{config::Config, git::GitRepo, io, paths};
use std::path::Path;

pub fn run(root: &Path, script: &str) -> anyhow::Result<()> {
    let project_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    println!("Initializing harvest in: {}", root.display());

    for dir in [paths::HARVEST_DIR, paths::RUNS_DIR, paths::LOCKS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if !config_path.exists() {
        let cfg = Config::scaffold(&project_name, script);
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: .harvest/config.yaml");
    } else {
        println!("  exists:  .harvest/config.yaml");
    }

    if GitRepo::is_repo(root) {
        let entry = format!("/{}/", paths::HARVEST_DIR);
        if GitRepo::open(root)
            .exclude(&entry)
            .context("failed to update .git/info/exclude")?
        {
            println!("  added:   {entry} to .git/info/exclude");
        }
    }

    println!("\nNext: edit .harvest/config.yaml, then `harvest config validate` and `harvest run`.");
    Ok(())
}
