// Player output: a spawned process reading the stream from stdin, plus a
// task that polls for its exit.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PlayerSettings;
use crate::error::{CliError, Result};

pub const PLAYER_POLL_INTERVAL: Duration = Duration::from_millis(500);

const FILENAME_PLACEHOLDER: &str = "{filename}";
const STDIN_ARGUMENT: &str = "-";

/// Splits the player command line with shell rules. The input argument
/// replaces `{filename}`, or is appended when there is none.
pub fn build_command(settings: &PlayerSettings) -> Result<Vec<String>> {
    let split = |raw: &str, what: &str| {
        shlex::split(raw).ok_or_else(|| CliError::InvalidArgument(format!("cannot parse {what} `{raw}`")))
    };

    let mut argv = split(&settings.command, "player command")?;
    if argv.is_empty() {
        return Err(CliError::InvalidArgument("empty player command".to_string()));
    }
    if let Some(args) = &settings.args {
        argv.extend(split(args, "player arguments")?);
    }

    if let Some(title) = &settings.title {
        let program = argv[0].to_ascii_lowercase();
        if program.contains("mpv") {
            argv.insert(1, format!("--force-media-title={title}"));
        } else if program.contains("vlc") {
            argv.insert(1, "--input-title-format".to_string());
            argv.insert(2, title.clone());
        }
    }

    let mut placed = false;
    for arg in argv.iter_mut().skip(1) {
        if arg.contains(FILENAME_PLACEHOLDER) {
            *arg = arg.replace(FILENAME_PLACEHOLDER, STDIN_ARGUMENT);
            placed = true;
        }
    }
    if !placed {
        argv.push(STDIN_ARGUMENT.to_string());
    }
    Ok(argv)
}

/// Signals when the player process has exited.
#[derive(Clone)]
pub struct PlayerMonitor {
    exited: CancellationToken,
}

impl PlayerMonitor {
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }
}

pub struct PlayerOutput {
    command: String,
    stdin: Option<ChildStdin>,
    no_close: bool,
    exited: CancellationToken,
    kill: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PlayerOutput {
    pub fn spawn(settings: &PlayerSettings) -> Result<Self> {
        let argv = build_command(settings)?;
        let command = argv.join(" ");
        debug!(%command, "Starting player");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(!settings.no_close)
            .spawn()
            .map_err(|source| CliError::Player {
                command: command.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        info!("Starting player: {}", settings.command);

        let exited = CancellationToken::new();
        let kill = CancellationToken::new();
        let task = tokio::spawn(poll_player(child, exited.clone(), kill.clone()));

        Ok(Self {
            command,
            stdin,
            no_close: settings.no_close,
            exited,
            kill,
            task: Some(task),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn monitor(&self) -> PlayerMonitor {
        PlayerMonitor {
            exited: self.exited.clone(),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(data).await,
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    /// Closes the player's stdin. The player is killed unless it was started
    /// with `no_close`, in which case this waits for the user to close it.
    pub async fn close(&mut self) -> io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        if !self.no_close {
            self.kill.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Checks the child every [`PLAYER_POLL_INTERVAL`] until it exits or `kill`
/// fires.
async fn poll_player(mut child: Child, exited: CancellationToken, kill: CancellationToken) {
    let mut ticker = tokio::time::interval(PLAYER_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Player already gone");
                }
                break;
            }
            _ = ticker.tick() => match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "Player exited");
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Cannot poll player process");
                    break;
                }
            },
        }
    }
    exited.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(command: &str, args: Option<&str>, title: Option<&str>) -> PlayerSettings {
        PlayerSettings {
            command: command.to_string(),
            args: args.map(str::to_string),
            title: title.map(str::to_string),
            no_close: false,
        }
    }

    #[test]
    fn builds_player_command_lines() {
        assert_eq!(
            build_command(&settings("mpv --cache=yes", None, None)).unwrap(),
            vec!["mpv", "--cache=yes", "-"]
        );
        assert_eq!(
            build_command(&settings("\"/opt/my player/vlc\"", Some("--file-caching 500 {filename}"), None))
                .unwrap(),
            vec!["/opt/my player/vlc", "--file-caching", "500", "-"]
        );
        assert_eq!(
            build_command(&settings("mpv", None, Some("Night show"))).unwrap(),
            vec!["mpv", "--force-media-title=Night show", "-"]
        );
        assert!(build_command(&settings("", None, None)).is_err());
        assert!(build_command(&settings("mpv \"unterminated", None, None)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detects_player_exit() {
        let player = PlayerOutput::spawn(&settings("sh -c", Some("\"exit 0\""), None)).unwrap();
        let monitor = player.monitor();
        tokio::time::timeout(Duration::from_secs(2), monitor.exited())
            .await
            .expect("player exit noticed");
        assert!(monitor.has_exited());
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let err = PlayerOutput::spawn(&settings("/nonexistent/slink-player", None, None))
            .err()
            .unwrap();
        assert!(matches!(err, CliError::Player { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}
