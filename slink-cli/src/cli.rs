use std::path::PathBuf;

use clap::Parser;

/// Slink - extract streams from websites and pipe them into a video player
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "slink", version, about, long_about = None)]
pub struct Args {
    /// Website URL or playlist URL to open
    #[arg(value_name = "URL", required_unless_present = "plugins")]
    pub url: Option<String>,

    /// Stream to open, or a comma-separated preference list like `720p,480p,best`
    #[arg(value_name = "STREAM")]
    pub stream: Option<String>,

    /// Configuration file (defaults to `<config dir>/slink/config.toml`)
    #[arg(short, long, env = "SLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// List the available plugins and exit
    #[arg(long)]
    pub plugins: bool,

    /// Stream used when no STREAM argument is given
    #[arg(long, value_name = "STREAMS")]
    pub default_stream: Option<String>,

    /// Print the URL of the selected stream instead of playing it
    #[arg(long)]
    pub stream_url: bool,

    /// Print the available streams as JSON instead of playing
    #[arg(short, long)]
    pub json: bool,

    /// Write the stream to a file; `-` writes to stdout
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Write the stream to stdout
    #[arg(short = 'O', long, conflicts_with = "output")]
    pub stdout: bool,

    /// Overwrite an existing output file
    #[arg(short, long)]
    pub force: bool,

    /// Player command line; the stream is passed on stdin
    #[arg(short, long, env = "SLINK_PLAYER")]
    pub player: Option<String>,

    /// Extra player arguments; `{filename}` is replaced by the input argument
    #[arg(short = 'a', long, value_name = "ARGS", allow_hyphen_values = true)]
    pub player_args: Option<String>,

    /// Keep the player running after the stream ends
    #[arg(long)]
    pub player_no_close: bool,

    /// Window title passed to players that support one
    #[arg(long)]
    pub title: Option<String>,

    /// Serve the stream to a single HTTP client on this port instead of a player
    #[arg(long, value_name = "PORT", conflicts_with_all = ["output", "stdout"])]
    pub http_output: Option<u16>,

    /// Playlist reload interval: segment, live-edge, default or seconds
    #[arg(long, value_name = "TIME")]
    pub hls_playlist_reload_time: Option<String>,

    /// Number of segments from the end of a live playlist to start from
    #[arg(long, value_name = "SEGMENTS")]
    pub hls_live_edge: Option<usize>,

    /// Number of parallel segment downloads (1-10)
    #[arg(long, value_name = "THREADS")]
    pub hls_segment_threads: Option<usize>,

    /// Attempts per segment before it is given up on
    #[arg(long, value_name = "ATTEMPTS")]
    pub hls_segment_attempts: Option<u32>,

    /// Timeout for a single segment download, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub hls_segment_timeout: Option<f64>,

    /// Drop segments whose URL contains this text, e.g. `/blank/`
    #[arg(long, value_name = "TEXT")]
    pub hls_segment_ignore: Option<String>,

    /// Ring buffer size, e.g. `16M` or `512K`
    #[arg(long, value_name = "SIZE")]
    pub ringbuffer_size: Option<String>,

    /// Header added to every HTTP request
    #[arg(long = "http-header", value_name = "KEY=VALUE")]
    pub http_headers: Vec<String>,

    /// Cookie added to every HTTP request
    #[arg(long = "http-cookie", value_name = "KEY=VALUE")]
    pub http_cookies: Vec<String>,

    /// Proxy for all HTTP requests
    #[arg(long, value_name = "URL")]
    pub http_proxy: Option<String>,

    /// Timeout for HTTP requests, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub http_timeout: Option<f64>,

    /// Plugin argument, e.g. `nicolive-user-session=VALUE`
    #[arg(long = "plugin-option", value_name = "PLUGIN-ARG=VALUE")]
    pub plugin_options: Vec<String>,

    /// Directory with extra plugin definitions
    #[arg(long = "plugin-dir", value_name = "DIR")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Hide the download progress
    #[arg(long)]
    pub no_progress: bool,

    /// Log level: none, error, warn, info, debug or trace
    #[arg(short, long, value_name = "LEVEL")]
    pub loglevel: Option<String>,

    /// Only log errors
    #[arg(short = 'Q', long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Settings};
    use crate::error::CliError;

    #[test]
    fn parses_a_typical_command_line() {
        let args = Args::try_parse_from([
            "slink",
            "https://live.nicovideo.jp/watch/lv1",
            "720p,best",
            "--player",
            "mpv --no-terminal",
            "--http-header",
            "Referer=https://example.com",
            "--plugin-option",
            "nicolive-user-session=abc",
            "--hls-segment-threads",
            "3",
        ])
        .unwrap();

        assert_eq!(args.url.as_deref(), Some("https://live.nicovideo.jp/watch/lv1"));
        assert_eq!(args.stream.as_deref(), Some("720p,best"));
        assert_eq!(args.player.as_deref(), Some("mpv --no-terminal"));
        assert_eq!(args.http_headers, vec!["Referer=https://example.com"]);
        assert_eq!(args.hls_segment_threads, Some(3));
        assert_eq!(args.plugin_options, vec!["nicolive-user-session=abc"]);
    }

    #[test]
    fn plugin_options_reach_the_settings_by_prefixed_name() {
        let args = Args::try_parse_from([
            "slink",
            "https://live.nicovideo.jp/watch/lv1",
            "--plugin-option",
            "nicolive-user-session=abc=def",
            "--plugin-option",
            "nicolive-timeshift-offset=30",
        ])
        .unwrap();
        let settings = Settings::resolve(args, AppConfig::default()).unwrap();
        assert_eq!(settings.plugin_options["nicolive-user-session"], "abc=def");
        assert_eq!(settings.plugin_options["nicolive-timeshift-offset"], "30");

        let args = Args::try_parse_from(["slink", "https://example.com", "--plugin-option", "nicolive-user-session"])
            .unwrap();
        assert!(matches!(
            Settings::resolve(args, AppConfig::default()),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[test]
    fn url_is_optional_only_when_listing_plugins() {
        assert!(Args::try_parse_from(["slink"]).is_err());
        assert!(Args::try_parse_from(["slink", "--plugins"]).unwrap().plugins);
        assert!(Args::try_parse_from(["slink", "x", "-o", "a.ts", "--http-output", "8080"]).is_err());
    }
}
