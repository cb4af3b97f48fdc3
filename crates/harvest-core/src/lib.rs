pub mod config;
pub mod error;
pub mod git;
pub mod io;
pub mod lock;
pub mod paths;
pub mod pipeline;
pub mod process;
pub mod retry;
pub mod run;
pub mod runtime;
pub mod schedule;
pub mod trigger;

pub use error::{HarvestError, Result};
