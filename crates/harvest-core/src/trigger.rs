use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Config;
use crate::error::Result;
use crate::schedule::Schedule;

/// The event that started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// A timer tick for the given scheduled instant.
    Schedule { scheduled_for: DateTime<Utc> },
    /// A push to `git_ref` (`refs/heads/<branch>` or a bare branch name).
    Push { git_ref: String },
    /// An operator ran `harvest run` by hand.
    Manual,
}

/// Outcome of matching a trigger against the configured filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(String),
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Schedule { .. } => "schedule",
            Trigger::Push { .. } => "push",
            Trigger::Manual => "manual",
        }
    }

    /// Decide whether this trigger should start a run under `config`.
    pub fn admit(&self, config: &Config) -> Result<Admission> {
        match self {
            Trigger::Manual => Ok(Admission::Accepted),
            Trigger::Schedule { scheduled_for } => {
                let Some(expr) = config.triggers.schedule.as_deref() else {
                    return Ok(Admission::Rejected("no schedule configured".into()));
                };
                let schedule = Schedule::parse(expr, config.timezone.as_deref())?;
                if schedule.is_occurrence(*scheduled_for) {
                    Ok(Admission::Accepted)
                } else {
                    Ok(Admission::Rejected(format!(
                        "{} is not an occurrence of '{}'",
                        scheduled_for.to_rfc3339(),
                        expr
                    )))
                }
            }
            Trigger::Push { git_ref } => {
                let branch = branch_of(git_ref);
                match branch {
                    Some(b) if config.triggers.push_branches.iter().any(|p| p == b) => {
                        Ok(Admission::Accepted)
                    }
                    _ => Ok(Admission::Rejected(format!(
                        "ref '{git_ref}' is not a configured push branch"
                    ))),
                }
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Schedule { scheduled_for } => {
                write!(f, "schedule@{}", scheduled_for.to_rfc3339())
            }
            Trigger::Push { git_ref } => write!(f, "push:{git_ref}"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// Branch named by a ref. Tags and other namespaces yield `None`.
fn branch_of(git_ref: &str) -> Option<&str> {
    if let Some(b) = git_ref.strip_prefix("refs/heads/") {
        return Some(b);
    }
    if git_ref.starts_with("refs/") {
        return None;
    }
    Some(git_ref)
}
