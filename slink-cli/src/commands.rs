// Commands: resolve the URL, then list, describe or stream according to the
// selected action.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use slink_engine::HttpSession;
use slink_engine::hls::HlsReader;
use slink_plugins::registry::{self, RegistryConfig};
use slink_plugins::{PluginCache, PluginError, PluginRegistry, ResolvedPlugin, Resolver, Stream, StreamSet};
use tracing::{debug, info};

use crate::config::{Action, AppConfig, OutputTarget, Settings};
use crate::error::{CliError, Result};
use crate::output::{FileOutput, HttpServer, Output, PlayerOutput};
use crate::progress::Progress;
use crate::runner::{CHUNK_SIZE, RunOutcome, StreamRunner};

const CACHE_FILE: &str = "plugin-cache.json";

/// Runs the action described by `settings` to completion.
pub async fn run(settings: Settings) -> Result<()> {
    let registry = registry::init(&RegistryConfig {
        sideload_dirs: settings.plugin_dirs.clone(),
    });

    if settings.action == Action::ListPlugins {
        println!("Available plugins: {}", registry.names().join(", "));
        return Ok(());
    }

    let url = settings
        .url
        .clone()
        .ok_or_else(|| CliError::InvalidArgument("the following required arguments were not provided: URL".to_string()))?;
    let resolver = build_resolver(&settings, registry)?;

    let resolved = resolver.resolve(&url).await?;
    info!("Found matching plugin {} for URL {}", resolved.name, url);
    let streams = resolved.streams().await?;

    match &settings.action {
        Action::ListPlugins => Ok(()),
        Action::Json => print_json(&resolved, &streams),
        Action::Describe => {
            println!("Available streams: {}", streams.describe());
            Ok(())
        }
        Action::StreamUrl => {
            let preference = settings.stream.as_deref().unwrap_or("best");
            let (_, stream) = select(&streams, preference)?;
            let url = stream.url().ok_or_else(|| {
                CliError::InvalidArgument("The stream specified cannot be translated to a URL".to_string())
            })?;
            println!("{url}");
            Ok(())
        }
        Action::Stream(target) => {
            info!("Available streams: {}", streams.describe());
            let preference = settings.stream.as_deref().unwrap_or("best");
            let (name, stream) = select(&streams, preference)?;
            let outcome = stream_to(&settings, target, name, stream.as_ref()).await?;
            debug!(?outcome, "Stream finished");
            Ok(())
        }
    }
}

fn build_resolver(settings: &Settings, registry: Arc<PluginRegistry>) -> Result<Resolver> {
    let session = Arc::new(HttpSession::new(settings.http.clone())?);
    for cookie in settings.cookie_records() {
        session.set_cookie(&cookie)?;
    }
    let cache = AppConfig::data_dir()
        .map(|dir| PluginCache::open(dir.join(CACHE_FILE)))
        .unwrap_or_else(PluginCache::in_memory);

    Ok(Resolver::new(registry, session)
        .with_hls_config(settings.hls.clone())
        .with_options(settings.plugin_options.clone())
        .with_cache(cache))
}

fn select<'a>(streams: &'a StreamSet, preference: &str) -> Result<(&'a str, &'a Arc<dyn Stream>)> {
    streams.select(preference).ok_or_else(|| CliError::StreamNotFound {
        requested: preference.to_string(),
        available: streams.describe(),
    })
}

fn print_json(resolved: &ResolvedPlugin, streams: &StreamSet) -> Result<()> {
    let document = json!({
        "plugin": resolved.name,
        "metadata": resolved.metadata(),
        "streams": streams.to_json(),
    });
    let text = serde_json::to_string_pretty(&document)
        .map_err(|e| CliError::Config(format!("cannot serialise streams: {e}")))?;
    println!("{text}");
    Ok(())
}

/// Opens `stream` and copies it into the output chosen by `target`.
pub async fn stream_to(
    settings: &Settings,
    target: &OutputTarget,
    name: &str,
    stream: &dyn Stream,
) -> Result<RunOutcome> {
    // Outputs that can fail on their own are prepared before the stream is
    // opened. The player starts once data is available.
    let early = match target {
        OutputTarget::Player(_) => None,
        other => Some(open_output(other, settings.force).await?),
    };

    info!("Opening stream: {name} ({})", stream.kind());
    let reader = stream.open().await.map_err(|source| CliError::Open {
        stream: name.to_string(),
        source,
    })?;
    let prebuffer = prebuffer(&reader, name).await?;

    let output = match early {
        Some(output) => output,
        None => open_output(target, settings.force).await?,
    };
    let progress = match (&output, settings.progress) {
        (Output::File(file), true) => file.path().map(|path| Progress::start(Some(path))),
        _ => None,
    };

    StreamRunner::new(reader.buffer().clone(), output, progress)
        .run(prebuffer)
        .await
}

async fn open_output(target: &OutputTarget, force: bool) -> Result<Output> {
    Ok(match target {
        OutputTarget::File(path) => Output::File(FileOutput::create(path, force).await?),
        OutputTarget::Stdout => Output::File(FileOutput::stdout()),
        OutputTarget::Player(player) => Output::Player(PlayerOutput::spawn(player)?),
        OutputTarget::Http(port) => {
            let server = HttpServer::bind(*port).await?;
            Output::Http(server.accept().await?)
        }
    })
}

/// Waits for the first bytes so that an unplayable stream fails before any
/// output is started.
async fn prebuffer(reader: &HlsReader, name: &str) -> Result<Bytes> {
    debug!("Pre-buffering {CHUNK_SIZE} bytes");
    let open_error = |reason: String| CliError::Open {
        stream: name.to_string(),
        source: PluginError::Other(reason),
    };
    let data = reader
        .read(CHUNK_SIZE)
        .await
        .map_err(|e| open_error(format!("Failed to read data from stream: {e}")))?;
    if data.is_empty() {
        return Err(open_error("No data returned from stream".to_string()));
    }
    Ok(data)
}
