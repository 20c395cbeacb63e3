use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::info;

use crate::error::{CliError, Result};

/// A file on disk, or stdout.
pub struct FileOutput {
    path: Option<PathBuf>,
    writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FileOutput {
    /// Creates `path`, refusing to replace an existing file unless `force`.
    pub async fn create(path: &Path, force: bool) -> Result<Self> {
        if !force && fs::try_exists(path).await.unwrap_or(false) {
            return Err(CliError::FileExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        info!("Writing output to\n{}", path.display());

        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: BufWriter::new(Box::new(file)),
        })
    }

    pub fn stdout() -> Self {
        Self {
            path: None,
            writer: BufWriter::new(Box::new(tokio::io::stdout())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().shutdown().await
    }
}
