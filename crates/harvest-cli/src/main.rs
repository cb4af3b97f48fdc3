mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, run::TriggerArg};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Run a crawl script on a schedule and publish what it changes to git",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .harvest/ or .git/)
    #[arg(long, global = true, env = "HARVEST_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .harvest/config.yaml with a starter configuration
    Init {
        /// Crawl script, relative to the working tree
        #[arg(long, default_value = "process.py")]
        script: String,
    },

    /// Execute one run now
    Run {
        /// What started this run
        #[arg(long, value_enum, default_value_t = TriggerArg::Manual)]
        trigger: TriggerArg,

        /// Pushed ref for --trigger push (refs/heads/<branch> or a branch name)
        #[arg(long = "ref", value_name = "REF")]
        git_ref: Option<String>,

        /// Scheduled instant for --trigger schedule (RFC 3339; default: now, truncated to the schedule's resolution)
        #[arg(long, value_name = "RFC3339")]
        at: Option<String>,
    },

    /// Stay in the foreground and run at every scheduled occurrence
    Watch {
        /// Run only the next occurrence, then exit
        #[arg(long)]
        once: bool,
    },

    /// List upcoming scheduled occurrences
    Next {
        #[arg(long, default_value_t = 5)]
        count: usize,
    },

    /// List recent runs, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one run record (full id or unique prefix)
    Show { id: String },

    /// Inspect and validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Watch { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { script } => cmd::init::run(&root, &script),
        Commands::Run {
            trigger,
            git_ref,
            at,
        } => cmd::run::run(&root, trigger, git_ref, at.as_deref(), cli.json),
        Commands::Watch { once } => cmd::watch::run(&root, once, cli.json),
        Commands::Next { count } => cmd::next::run(&root, count, cli.json),
        Commands::History { limit } => cmd::history::run(&root, limit, cli.json),
        Commands::Show { id } => cmd::show::run(&root, &id, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
