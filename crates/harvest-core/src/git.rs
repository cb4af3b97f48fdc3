//! Git plumbing for the checkout, change-detection and publish steps.
//!
//! Every operation shells out to the system `git` binary through
//! [`crate::process`]. Prompts are disabled and the locale is pinned to `C`
//! so rejection messages can be recognised. The push credential travels in
//! `GIT_CONFIG_*` environment variables as an HTTP authorization header and
//! never appears in argv or in `.git/config`.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, info, instrument};

use crate::error::{HarvestError, Result};
use crate::process::{run, run_checked, CommandOutput, CommandSpec, Completion};

/// Lines in `git push` stderr that mean the remote refused the update, as
/// opposed to a transport failure.
const REJECTION_MARKERS: &[&str] = &[
    "[rejected]",
    "[remote rejected]",
    "non-fast-forward",
    "fetch first",
    "stale info",
];

#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
    env: Vec<(String, String)>,
}

impl GitRepo {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            env: base_env(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `dir` holds a work tree (a `.git` directory or gitfile).
    pub fn is_repo(dir: &Path) -> bool {
        dir.join(".git").exists()
    }

    /// `git clone --origin <remote> --branch <branch> <url> <dest>`.
    #[instrument(skip_all, fields(%url, %branch, dest = %dest.display()))]
    pub async fn clone(url: &str, remote: &str, branch: &str, dest: &Path) -> Result<Self> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        crate::io::ensure_dir(parent)?;
        let spec = CommandSpec::new(
            vec![
                "git".into(),
                "clone".into(),
                "--origin".into(),
                remote.into(),
                "--branch".into(),
                branch.into(),
                "--".into(),
                url.into(),
                dest.to_string_lossy().into_owned(),
            ],
            parent,
        )
        .env(&base_env());
        run_checked(&spec).await?;
        info!("cloned");
        Ok(Self::open(dest))
    }

    /// Turn an existing directory into a repository tracking `url` as
    /// `remote`. Files already in `dir` are left in place; the first
    /// checkout of the remote tip populates the tree around them.
    #[instrument(skip_all, fields(%url, dir = %dir.display()))]
    pub async fn init(dir: &Path, remote: &str, url: &str) -> Result<Self> {
        let repo = Self::open(dir);
        repo.git(&["init", "--quiet"]).await?;
        repo.git(&["remote", "add", remote, url]).await?;
        info!("initialized in place");
        Ok(repo)
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        run_checked(&self.spec(args)).await
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git".to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        CommandSpec::new(argv, &self.dir).env(&self.env)
    }

    /// Fetch the tip of `branch` into `refs/remotes/<remote>/<branch>`.
    #[instrument(skip(self), fields(repo = %self.dir.display()))]
    pub async fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}");
        self.git(&["fetch", "--prune", remote, &refspec]).await?;
        debug!("fetched");
        Ok(())
    }

    /// Point the local `branch` at the fetched remote tip. With `clean`, local
    /// modifications and untracked files are discarded first.
    #[instrument(skip(self), fields(repo = %self.dir.display()))]
    pub async fn checkout_tip(&self, remote: &str, branch: &str, clean: bool) -> Result<()> {
        let tip = format!("refs/remotes/{remote}/{branch}");
        if clean {
            self.git(&["checkout", "--force", "-B", branch, &tip]).await?;
            self.git(&["reset", "--hard", &tip]).await?;
            self.git(&["clean", "-fd"]).await?;
        } else {
            self.git(&["checkout", "-B", branch, &tip]).await?;
        }
        Ok(())
    }

    /// Paths that differ from `HEAD`, untracked files included.
    pub async fn changed_paths(&self) -> Result<Vec<String>> {
        let out = self
            .git(&["status", "--porcelain=v1", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain(&out.stdout))
    }

    pub async fn configure_identity(&self, name: &str, email: &str) -> Result<()> {
        self.git(&["config", "user.name", name]).await?;
        self.git(&["config", "user.email", email]).await?;
        Ok(())
    }

    pub async fn add_all(&self) -> Result<()> {
        self.git(&["add", "-A"]).await?;
        Ok(())
    }

    /// Create one commit from the index and return its SHA.
    pub async fn commit(&self, message: &str) -> Result<String> {
        self.git(&["commit", "--quiet", "-m", message]).await?;
        self.head_sha().await
    }

    pub async fn head_sha(&self) -> Result<String> {
        let out = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// SHA of `refs/heads/<branch>` on `remote`, if the branch exists there.
    pub async fn remote_sha(&self, remote: &str, branch: &str) -> Result<Option<String>> {
        let refname = format!("refs/heads/{branch}");
        let out = self.git(&["ls-remote", remote, &refname]).await?;
        Ok(out
            .stdout
            .lines()
            .find_map(|l| l.split_whitespace().next().map(str::to_string)))
    }

    /// Push `HEAD` to `refs/heads/<branch>` on `remote`.
    ///
    /// A refusal by the remote is [`HarvestError::PushRejected`]; anything else
    /// is a retryable [`HarvestError::CommandFailed`].
    #[instrument(skip(self, token), fields(repo = %self.dir.display()))]
    pub async fn push(&self, remote: &str, branch: &str, token: Option<&str>) -> Result<()> {
        let dst = format!("HEAD:refs/heads/{branch}");
        let mut spec = self.spec(&["push", "--porcelain", remote, &dst]);
        if let Some(t) = token {
            spec = spec.env(&auth_env(t));
        }
        let out = match run(&spec).await? {
            Completion::Exited(out) => out,
            Completion::TimedOut { after } => {
                return Err(HarvestError::CommandFailed {
                    command: "git push".into(),
                    status: format!("timed out after {}s", after.as_secs()),
                    stderr: String::new(),
                })
            }
        };
        if out.success() {
            info!("pushed");
            return Ok(());
        }
        let combined = format!("{}\n{}", out.stdout, out.stderr);
        if is_rejection(&combined) {
            return Err(HarvestError::PushRejected(out.stderr.trim().to_string()));
        }
        out.check("git push").map(|_| ())
    }

    /// Keep `entry` out of `git status` without touching tracked files.
    pub fn exclude(&self, entry: &str) -> Result<bool> {
        let exclude = self.dir.join(".git").join("info").join("exclude");
        crate::io::ensure_line(&exclude, entry)
    }
}

fn base_env() -> Vec<(String, String)> {
    vec![
        ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ("LC_ALL".to_string(), "C".to_string()),
    ]
}

/// Environment that makes git send `token` as HTTP basic credentials.
pub fn auth_env(token: &str) -> Vec<(String, String)> {
    let basic = STANDARD.encode(format!("x-access-token:{token}"));
    vec![
        ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
        ("GIT_CONFIG_KEY_0".to_string(), "http.extraheader".to_string()),
        (
            "GIT_CONFIG_VALUE_0".to_string(),
            format!("AUTHORIZATION: basic {basic}"),
        ),
    ]
}

fn is_rejection(output: &str) -> bool {
    REJECTION_MARKERS.iter().any(|m| output.contains(m))
}

/// Paths from `git status --porcelain=v1`. Renames report the new path.
fn parse_porcelain(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| {
            let path = &l[3..];
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            path.trim_matches('"').to_string()
        })
        .collect()
}
