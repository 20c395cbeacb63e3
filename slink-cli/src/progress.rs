// Progress: a status line on stderr summarising bytes written, elapsed time
// and recent throughput.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossterm::terminal;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// 20 seconds of history.
pub const HISTORY_SAMPLES: usize = 80;
/// Speed is only shown once 2 seconds of history are available.
pub const SPEED_MIN_SAMPLES: usize = 8;

const PATH_MIN_WIDTH: usize = 15;
const DEFAULT_WIDTH: usize = 80;
const ELLIPSIS: char = '\u{2026}';

const TEMPLATES_WITH_SPEED: &[&str] = &[
    "[download] Written {written} to {path} ({elapsed} @ {speed})",
    "[download] Written {written} ({elapsed} @ {speed})",
    "[download] {written} ({elapsed} @ {speed})",
    "[download] {written} @ {speed}",
];

const TEMPLATES_WITHOUT_SPEED: &[&str] = &[
    "[download] Written {written} to {path} ({elapsed})",
    "[download] Written {written} ({elapsed})",
    "[download] {written} ({elapsed})",
    "[download] {written}",
];

/// Binary units with two decimals. Values under 1 KiB are plain bytes.
pub fn format_filesize(size: f64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if size < 1024.0 {
        return format!("{} bytes", size as u64);
    }
    let mut value = size / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// `1h02m03s`, `2m05s` or `5s`.
pub fn format_time(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m{seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Keeps the root or drive prefix and as much of the tail as fits in `max`
/// characters, joined by an ellipsis.
pub fn shorten_path(path: &Path, max: usize) -> String {
    let full = path.display().to_string();
    let len = full.chars().count();
    if len <= max {
        return full;
    }

    let anchor: String = path
        .components()
        .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let anchor = if anchor.chars().count() + 1 >= max {
        String::new()
    } else {
        anchor
    };

    let keep = max.saturating_sub(anchor.chars().count() + 1);
    let tail: String = full.chars().skip(len - keep).collect();
    format!("{anchor}{ELLIPSIS}{tail}")
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Renders the first template that fits in `width` columns. The result
/// never exceeds `width`.
pub fn render_line(
    written: u64,
    elapsed: Duration,
    speed: Option<f64>,
    path: Option<&Path>,
    width: usize,
) -> String {
    let written = format_filesize(written as f64);
    let elapsed = format_time(elapsed);
    let (templates, speed) = match speed {
        Some(speed) => (TEMPLATES_WITH_SPEED, format!("{}/s", format_filesize(speed))),
        None => (TEMPLATES_WITHOUT_SPEED, String::new()),
    };

    let mut last = String::new();
    for template in templates {
        let line = template
            .replace("{written}", &written)
            .replace("{elapsed}", &elapsed)
            .replace("{speed}", &speed);

        if line.contains("{path}") {
            let Some(path) = path else { continue };
            let fixed = char_len(&line) - char_len("{path}");
            let Some(room) = width.checked_sub(fixed) else {
                continue;
            };
            if room < PATH_MIN_WIDTH {
                continue;
            }
            return line.replace("{path}", &shorten_path(path, room));
        }

        if char_len(&line) <= width {
            return line;
        }
        last = line;
    }
    last.chars().take(width).collect()
}

struct Sample {
    at: Instant,
    bytes: u64,
}

/// Throughput over the recorded history, once enough samples exist.
fn speed(history: &VecDeque<Sample>, now: Instant) -> Option<f64> {
    if history.len() < SPEED_MIN_SAMPLES {
        return None;
    }
    let oldest = history.front()?;
    let span = now.duration_since(oldest.at).as_secs_f64();
    if span <= 0.0 {
        return None;
    }
    let bytes: u64 = history.iter().map(|s| s.bytes).sum();
    Some(bytes as f64 / span)
}

fn terminal_width() -> usize {
    terminal::size()
        .map(|(columns, _)| columns as usize)
        .ok()
        .filter(|&w| w > 0)
        .unwrap_or(DEFAULT_WIDTH)
}

fn status_bar() -> ProgressBar {
    let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
    bar.set_style(ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()));
    bar.enable_steady_tick(TICK_INTERVAL);
    bar
}

/// Background reporter. Writers call [`Progress::add`]; a task samples the
/// counter every tick and hands the rendered line to the status bar.
pub struct Progress {
    written: Arc<AtomicU64>,
    bar: ProgressBar,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Progress {
    pub fn start(path: Option<&Path>) -> Self {
        let written = Arc::new(AtomicU64::new(0));
        let bar = status_bar();
        let stop = CancellationToken::new();
        let task = tokio::spawn(report(
            path.map(Path::to_path_buf),
            written.clone(),
            bar.clone(),
            stop.clone(),
        ));
        Self {
            written,
            bar,
            stop,
            task: Some(task),
        }
    }

    pub fn add(&self, bytes: usize) {
        self.written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Stops the reporter and leaves the final line on screen.
    pub async fn finish(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn report(path: Option<PathBuf>, written: Arc<AtomicU64>, bar: ProgressBar, stop: CancellationToken) {
    let started = Instant::now();
    let mut history: VecDeque<Sample> = VecDeque::with_capacity(HISTORY_SAMPLES);
    let mut last_total = 0u64;
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    loop {
        let stopped = tokio::select! {
            _ = stop.cancelled() => true,
            _ = ticker.tick() => false,
        };

        let now = Instant::now();
        let total = written.load(Ordering::Relaxed);
        if history.len() == HISTORY_SAMPLES {
            history.pop_front();
        }
        history.push_back(Sample {
            at: now,
            bytes: total - last_total,
        });
        last_total = total;

        bar.set_message(render_line(
            total,
            now.duration_since(started),
            speed(&history, now),
            path.as_deref(),
            terminal_width(),
        ));

        if stopped {
            bar.finish();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn formats_sizes_in_binary_units() {
        assert_eq!(format_filesize(512.0), "512 bytes");
        assert_eq!(format_filesize(1024.0), "1.00 KiB");
        assert_eq!(format_filesize(1536.0), "1.50 KiB");
        assert_eq!(format_filesize(5.0 * 1024.0 * 1024.0), "5.00 MiB");
        assert_eq!(format_filesize(3.0 * 1024f64.powi(4)), "3.00 TiB");
        assert_eq!(format_filesize(2048.0 * 1024f64.powi(4)), "2048.00 TiB");
    }

    #[test]
    fn formats_durations_without_leading_zero_groups() {
        assert_eq!(format_time(Duration::from_secs(5)), "5s");
        assert_eq!(format_time(Duration::from_secs(125)), "2m05s");
        assert_eq!(format_time(Duration::from_secs(3723)), "1h02m03s");
    }

    #[cfg(unix)]
    #[test]
    fn shortens_paths_keeping_the_root() {
        let path = Path::new("/home/user/videos/recordings/stream.ts");
        assert_eq!(shorten_path(path, 100), path.display().to_string());

        let short = shorten_path(path, 15);
        assert_eq!(short.chars().count(), 15);
        assert!(short.starts_with("/\u{2026}"));
        assert!(short.ends_with("stream.ts"));
    }

    #[test]
    fn picks_the_widest_template_that_fits() {
        let path = Path::new("out.ts");
        let elapsed = Duration::from_secs(65);

        let wide = render_line(2048, elapsed, Some(1024.0), Some(path), 120);
        assert_eq!(wide, "[download] Written 2.00 KiB to out.ts (1m05s @ 1.00 KiB/s)");

        let medium = render_line(2048, elapsed, Some(1024.0), Some(path), 48);
        assert_eq!(medium, "[download] Written 2.00 KiB (1m05s @ 1.00 KiB/s)");

        let narrow = render_line(2048, elapsed, Some(1024.0), Some(path), 45);
        assert_eq!(narrow, "[download] 2.00 KiB (1m05s @ 1.00 KiB/s)");

        let tiny = render_line(2048, elapsed, Some(1024.0), Some(path), 12);
        assert_eq!(tiny, "[download] 2");
    }

    #[test]
    fn drops_the_speed_field_without_history() {
        let line = render_line(10, Duration::from_secs(1), None, None, 80);
        assert_eq!(line, "[download] Written 10 bytes (1s)");
    }

    #[test]
    fn needs_eight_samples_for_speed() {
        let start = Instant::now();
        let mut history = VecDeque::new();
        for i in 0..SPEED_MIN_SAMPLES as u64 {
            history.push_back(Sample {
                at: start + TICK_INTERVAL * i as u32,
                bytes: 100,
            });
            let now = start + TICK_INTERVAL * (i as u32 + 1);
            assert_eq!(speed(&history, now).is_some(), i + 1 >= SPEED_MIN_SAMPLES as u64);
        }
    }

    #[tokio::test]
    async fn finish_leaves_the_final_totals() {
        let mut progress = Progress::start(None);
        progress.add(10);
        progress.finish().await;
        assert!(progress.bar.is_finished());
        assert!(progress.bar.message().starts_with("[download] Written 10 bytes ("));
    }

    proptest! {
        #[test]
        fn rendered_line_never_exceeds_width(
            written in 0u64..(1 << 50),
            secs in 0u64..400_000,
            speed in proptest::option::of(0f64..1e12),
            width in 0usize..200,
            long_path in any::<bool>(),
        ) {
            let path = if long_path {
                Path::new("/srv/media/archive/2024/some-very-long-directory-name/recording.ts")
            } else {
                Path::new("out.ts")
            };
            let line = render_line(written, Duration::from_secs(secs), speed, Some(path), width);
            prop_assert!(line.chars().count() <= width);
        }
    }
}
