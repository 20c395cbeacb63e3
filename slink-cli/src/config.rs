// Configuration: an optional TOML file whose keys mirror the long options.
// Command-line values always win over the file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slink_engine::hls::{HlsConfig, ReloadTime, SegmentFilter};
use slink_engine::{CookieRecord, HttpSessionConfig};
use tracing::debug;
use url::Url;

use crate::cli::Args;
use crate::error::{CliError, Result};

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppConfig {
    pub default_stream: Option<String>,
    pub player: Option<String>,
    pub player_args: Option<String>,
    pub player_no_close: bool,
    pub hls_playlist_reload_time: Option<String>,
    pub hls_live_edge: Option<usize>,
    pub hls_segment_threads: Option<usize>,
    pub hls_segment_attempts: Option<u32>,
    pub hls_segment_timeout: Option<f64>,
    pub hls_segment_ignore: Option<String>,
    pub ringbuffer_size: Option<String>,
    pub http_headers: HashMap<String, String>,
    pub http_cookies: HashMap<String, String>,
    pub http_proxy: Option<String>,
    pub http_timeout: Option<f64>,
    pub plugin_options: HashMap<String, String>,
    pub plugin_dirs: Vec<PathBuf>,
    pub no_progress: bool,
    pub loglevel: Option<String>,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("slink").join("config.toml"))
    }

    /// Loads `path`, or the default location when `path` is `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(CliError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        debug!(path = %path.display(), "Loaded configuration file");
        toml::from_str(&text)
            .map_err(|e| CliError::Config(format!("invalid {}: {e}", path.display())))
    }

    /// Directory for data kept between runs, such as the plugin cache.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("slink"))
    }
}

/// Where the stream goes.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputTarget {
    File(PathBuf),
    Stdout,
    Player(PlayerSettings),
    Http(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSettings {
    pub command: String,
    pub args: Option<String>,
    pub title: Option<String>,
    pub no_close: bool,
}

/// What the program does after resolving the streams.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ListPlugins,
    Json,
    StreamUrl,
    Stream(OutputTarget),
    /// No output chosen: print the available streams.
    Describe,
}

/// Arguments and configuration file merged into one validated set.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: Option<String>,
    pub stream: Option<String>,
    pub action: Action,
    pub force: bool,
    pub progress: bool,
    pub hls: HlsConfig,
    pub http: HttpSessionConfig,
    pub cookies: Vec<(String, String)>,
    pub plugin_options: HashMap<String, String>,
    pub plugin_dirs: Vec<PathBuf>,
    pub loglevel: String,
    pub quiet: bool,
}

impl Settings {
    pub fn resolve(args: Args, config: AppConfig) -> Result<Self> {
        let stream = args.stream.clone().or(args.default_stream.clone()).or(config.default_stream.clone());

        let player = args.player.clone().or(config.player.clone());
        let action = if args.plugins {
            Action::ListPlugins
        } else if args.json {
            Action::Json
        } else if args.stream_url {
            Action::StreamUrl
        } else if stream.is_none() {
            Action::Describe
        } else if let Some(port) = args.http_output {
            Action::Stream(OutputTarget::Http(port))
        } else if args.stdout || args.output.as_deref() == Some(Path::new("-")) {
            Action::Stream(OutputTarget::Stdout)
        } else if let Some(path) = &args.output {
            Action::Stream(OutputTarget::File(path.clone()))
        } else if let Some(command) = player {
            Action::Stream(OutputTarget::Player(PlayerSettings {
                command,
                args: args.player_args.clone().or(config.player_args.clone()),
                title: args.title.clone(),
                no_close: args.player_no_close || config.player_no_close,
            }))
        } else {
            return Err(CliError::InvalidArgument(
                "no player specified, use --player, --output or --stdout".to_string(),
            ));
        };

        let hls = hls_config(&args, &config)?;
        let http = http_config(&args, &config)?;

        let mut cookies: Vec<(String, String)> = config.http_cookies.clone().into_iter().collect();
        cookies.sort();
        cookies.extend(parse_pairs(&args.http_cookies, "--http-cookie")?);

        let mut plugin_options = config.plugin_options.clone();
        plugin_options.extend(parse_pairs(&args.plugin_options, "--plugin-option")?);

        let mut plugin_dirs = config.plugin_dirs.clone();
        plugin_dirs.extend(args.plugin_dirs.iter().cloned());
        if let Some(dir) = AppConfig::data_dir() {
            plugin_dirs.insert(0, dir.join("plugins"));
        }

        let progress = matches!(action, Action::Stream(OutputTarget::File(_)))
            && !args.no_progress
            && !config.no_progress
            && !args.quiet;

        Ok(Self {
            url: args.url,
            stream,
            action,
            force: args.force,
            progress,
            hls,
            http,
            cookies,
            plugin_options,
            plugin_dirs,
            loglevel: args
                .loglevel
                .or(config.loglevel)
                .unwrap_or_else(|| "info".to_string()),
            quiet: args.quiet,
        })
    }

    /// `--http-cookie` values as cookies for the input URL's host.
    pub fn cookie_records(&self) -> Vec<CookieRecord> {
        let Some(host) = self
            .url
            .as_deref()
            .map(slink_plugins::resolver::normalize_url)
            .and_then(|url| Url::parse(&url).ok())
            .and_then(|url| url.host_str().map(str::to_string))
        else {
            return Vec::new();
        };
        self.cookies
            .iter()
            .map(|(name, value)| CookieRecord::new(name.clone(), value.clone(), host.clone()))
            .collect()
    }
}

fn hls_config(args: &Args, config: &AppConfig) -> Result<HlsConfig> {
    let mut hls = HlsConfig::default();

    if let Some(raw) = args
        .hls_playlist_reload_time
        .as_ref()
        .or(config.hls_playlist_reload_time.as_ref())
    {
        let reload_time = raw.parse::<ReloadTime>().map_err(CliError::InvalidArgument)?;
        hls = hls.with_reload_time(reload_time);
    }
    if let Some(edge) = args.hls_live_edge.or(config.hls_live_edge) {
        hls = hls.with_live_edge(edge);
    }
    if let Some(threads) = args.hls_segment_threads.or(config.hls_segment_threads) {
        hls = hls.with_segment_threads(threads);
    }
    if let Some(attempts) = args.hls_segment_attempts.or(config.hls_segment_attempts) {
        hls.fetcher.segment_attempts = attempts.max(1);
    }
    if let Some(secs) = args.hls_segment_timeout.or(config.hls_segment_timeout) {
        hls.fetcher.segment_timeout = seconds(secs, "--hls-segment-timeout")?;
    }
    if let Some(needle) = args.hls_segment_ignore.as_ref().or(config.hls_segment_ignore.as_ref()) {
        hls = hls.with_filter(SegmentFilter::uri_contains(needle.clone()));
    }
    if let Some(size) = args.ringbuffer_size.as_ref().or(config.ringbuffer_size.as_ref()) {
        hls = hls.with_buffer_size(parse_size(size)?);
    }
    Ok(hls)
}

fn http_config(args: &Args, config: &AppConfig) -> Result<HttpSessionConfig> {
    let mut http = HttpSessionConfig::default();

    let mut headers: Vec<(String, String)> = config.http_headers.clone().into_iter().collect();
    headers.sort();
    headers.extend(parse_pairs(&args.http_headers, "--http-header")?);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("user-agent") {
            http = http.with_user_agent(value);
        } else {
            http = http.with_header(&name, &value);
        }
    }

    if let Some(proxy) = args.http_proxy.as_ref().or(config.http_proxy.as_ref()) {
        http = http.with_proxy(proxy.clone());
    }
    if let Some(secs) = args.http_timeout.or(config.http_timeout) {
        http = http.with_timeout(seconds(secs, "--http-timeout")?);
    }
    Ok(http)
}

fn seconds(value: f64, option: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| CliError::InvalidArgument(format!("{option} must be a positive number of seconds")))
}

/// Splits `KEY=VALUE` pairs.
pub fn parse_pairs(raw: &[String], option: &str) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.to_string()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| CliError::InvalidArgument(format!("{option} expects KEY=VALUE, got `{pair}`")))
        })
        .collect()
}

/// Parses sizes such as `16M`, `512K`, `1G` or a plain byte count.
pub fn parse_size(raw: &str) -> Result<usize> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: usize = number
        .parse()
        .map_err(|_| CliError::InvalidArgument(format!("invalid size `{raw}`")))?;
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(CliError::InvalidArgument(format!("invalid size unit in `{raw}`"))),
    };
    number
        .checked_mul(multiplier)
        .filter(|size| *size > 0)
        .ok_or_else(|| CliError::InvalidArgument(format!("invalid size `{raw}`")))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("slink").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn command_line_wins_over_the_file() {
        let config: AppConfig = toml::from_str(
            r#"
            player = "vlc"
            default-stream = "best"
            hls-live-edge = 5
            hls-segment-threads = 2
            ringbuffer-size = "8M"

            [http-headers]
            Referer = "https://config.example"

            [plugin-options]
            nicolive-user-session = "from-config"
            "#,
        )
        .unwrap();

        let settings = Settings::resolve(
            args(&[
                "https://example.com/live",
                "--player",
                "mpv",
                "--hls-segment-threads",
                "4",
                "--plugin-option",
                "nicolive-user-session=from-args",
            ]),
            config,
        )
        .unwrap();

        assert_eq!(settings.stream.as_deref(), Some("best"));
        let Action::Stream(OutputTarget::Player(player)) = &settings.action else {
            panic!("expected player output, got {:?}", settings.action);
        };
        assert_eq!(player.command, "mpv");
        assert_eq!(settings.hls.playlist.live_edge, 5);
        assert_eq!(settings.hls.fetcher.segment_threads, 4);
        assert_eq!(settings.hls.output.buffer_size, 8 * 1024 * 1024);
        assert_eq!(settings.http.headers.get("referer").unwrap(), "https://config.example");
        assert_eq!(settings.plugin_options["nicolive-user-session"], "from-args");
        assert!(!settings.progress);
    }

    #[test]
    fn picks_the_action_from_flags() {
        let resolve = |argv: &[&str]| Settings::resolve(args(argv), AppConfig::default());

        assert_eq!(resolve(&["u"]).unwrap().action, Action::Describe);
        assert_eq!(resolve(&["u", "best", "--json"]).unwrap().action, Action::Json);
        assert_eq!(resolve(&["u", "best", "-O"]).unwrap().action, Action::Stream(OutputTarget::Stdout));
        assert_eq!(
            resolve(&["u", "best", "--http-output", "8080"]).unwrap().action,
            Action::Stream(OutputTarget::Http(8080))
        );

        let file = resolve(&["u", "best", "-o", "out.ts"]).unwrap();
        assert_eq!(file.action, Action::Stream(OutputTarget::File(PathBuf::from("out.ts"))));
        assert!(file.progress);
        assert!(!resolve(&["u", "best", "-o", "out.ts", "--no-progress"]).unwrap().progress);

        assert!(matches!(resolve(&["u", "best"]), Err(CliError::InvalidArgument(_))));
        assert!(resolve(&["u", "best", "-O", "--hls-playlist-reload-time", "never"]).is_err());
    }

    #[test]
    fn parses_sizes_and_pairs() {
        assert_eq!(parse_size("16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("0").is_err());
        assert!(parse_size("12X").is_err());

        let pairs = parse_pairs(&["a=1".to_string(), "b=x=y".to_string()], "--http-cookie").unwrap();
        assert_eq!(pairs, vec![("a".into(), "1".into()), ("b".into(), "x=y".into())]);
        assert!(parse_pairs(&["novalue".to_string()], "--http-cookie").is_err());
    }

    #[test]
    fn cookies_are_scoped_to_the_input_host() {
        let settings = Settings::resolve(
            args(&["live.example.com/watch", "--http-cookie", "session=abc"]),
            AppConfig::default(),
        )
        .unwrap();
        let cookies = settings.cookie_records();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].domain, "live.example.com");
        assert_eq!(cookies[0].value, "abc");
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("config.toml");
        fs::write(&path, "player = \"mpv\"\nno-progress = true\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.player.as_deref(), Some("mpv"));
        assert!(config.no_progress);
    }
}
