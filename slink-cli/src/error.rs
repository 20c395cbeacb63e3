use std::io;
use std::path::PathBuf;

use slink_engine::{BufferError, HttpError};
use slink_plugins::{PluginError, ResolveError};
use thiserror::Error;

pub type Result<T, E = CliError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("The specified stream(s) '{requested}' could not be found, available streams: {available}")]
    StreamNotFound { requested: String, available: String },

    #[error("Could not open stream {stream}: {source}")]
    Open {
        stream: String,
        #[source]
        source: PluginError,
    },

    #[error("Error when reading from stream: {0}")]
    Read(#[from] BufferError),

    #[error("Failed to start player `{command}`: {source}")]
    Player {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("File {} already exists, use --force to overwrite it", .0.display())]
    FileExists(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP session error: {0}")]
    Http(#[from] HttpError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Interrupted")]
    Interrupted,
}

impl CliError {
    /// 1 for resolution problems, 130 for Ctrl-C, 2 for everything that
    /// failed while streaming.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Resolve(_)
            | Self::StreamNotFound { .. }
            | Self::Open { .. }
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::FileExists(_) => 1,
            Self::Interrupted => 130,
            Self::Read(_) | Self::Player { .. } | Self::Http(_) | Self::Io(_) => 2,
        }
    }

    /// The message shown to the user. Validation failures are printed as
    /// their full context tree.
    pub fn render(&self) -> String {
        let plugin_error = match self {
            Self::Resolve(ResolveError::Plugin(e)) => Some(e),
            Self::Open { source, .. } => Some(source),
            _ => None,
        };
        match plugin_error {
            Some(PluginError::Validation(validation)) => {
                format!("Unable to validate response:\n{}", validation.render())
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use slink_plugins::validate::ValidationError;

    use super::*;

    #[test]
    fn maps_the_error_taxonomy_to_exit_codes() {
        let no_plugin = CliError::from(ResolveError::NoPlugin {
            url: "https://x".to_string(),
        });
        assert_eq!(no_plugin.exit_code(), 1);
        assert_eq!(no_plugin.render(), "No plugin can handle URL: https://x");

        let no_streams = CliError::from(ResolveError::NoStreams {
            url: "https://x".to_string(),
        });
        assert_eq!(no_streams.exit_code(), 1);
        assert_eq!(CliError::Interrupted.exit_code(), 130);
        assert_eq!(CliError::from(io::Error::other("disk full")).exit_code(), 2);
        assert_eq!(
            CliError::Read(BufferError::Stream {
                reason: "reload failed".to_string()
            })
            .exit_code(),
            2
        );
    }

    #[test]
    fn renders_validation_trees() {
        let inner = ValidationError::new("type", "Type of 1 should be str, but is int");
        let outer = ValidationError::new("dict", "Unable to validate value of key 'url'").with_context(inner);
        let err = CliError::from(ResolveError::Plugin(PluginError::Validation(outer)));

        let rendered = err.render();
        assert!(rendered.starts_with("Unable to validate response:\nValidationError(dict):"));
        assert!(rendered.contains("Context(type):"));
    }
}
