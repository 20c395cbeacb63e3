use std::process;

use clap::Parser;
use slink::cli::Args;
use slink::config::{Action, AppConfig, Settings};
use slink::error::{CliError, Result};
use slink::{commands, logging};
use tracing::info;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let json = args.json;

    if let Err(e) = run(args).await {
        if json {
            let error_json = serde_json::json!({ "error": e.render() });
            println!("{error_json}");
        } else {
            eprintln!("error: {}", e.render());
        }
        process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref())?;
    let settings = Settings::resolve(args, config)?;
    // JSON output owns stdout; keep logs to errors only.
    let quiet = settings.quiet || settings.action == Action::Json;
    logging::init_logging(&settings.loglevel, quiet)?;

    // Dropping the command future closes the stream and the player.
    tokio::select! {
        result = commands::run(settings) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted! Exiting...");
            Err(CliError::Interrupted)
        }
    }
}
