//! Library side of the `slink` binary: argument and config handling, outputs,
//! the stream runner and the progress line.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod progress;
pub mod runner;

pub use config::{Action, OutputTarget, Settings};
pub use error::{CliError, Result};
pub use runner::{RunOutcome, StreamRunner};
