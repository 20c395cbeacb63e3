use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::error::{CliError, Result};

/// Maps `--loglevel` names onto filter directives.
fn directive(level: &str) -> Result<&'static str> {
    Ok(match level.to_ascii_lowercase().as_str() {
        "none" => "off",
        "error" | "critical" => "error",
        "warn" | "warning" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" | "all" => "trace",
        other => {
            return Err(CliError::InvalidArgument(format!("unknown log level `{other}`")));
        }
    })
}

/// Logs go to stderr so stdout can carry the stream. `RUST_LOG` overrides
/// the level when set.
pub fn init_logging(level: &str, quiet: bool) -> Result<()> {
    let level = if quiet { "error" } else { directive(level)? };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let verbose = matches!(level, "debug" | "trace");

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_level(true),
        )
        .try_init()
        .map_err(|e| CliError::Config(format!("failed to initialise logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_levels_only() {
        assert_eq!(directive("WARNING").unwrap(), "warn");
        assert_eq!(directive("none").unwrap(), "off");
        assert!(directive("loud").is_err());
    }
}
