pub mod config;
pub mod history;
pub mod init;
pub mod next;
pub mod run;
pub mod show;
pub mod watch;
