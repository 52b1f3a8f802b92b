use std::path::{Component, Path, PathBuf};

use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::fetcher::ByteStream;

/// App-private staging area for downloaded content.
///
/// Each download lands at `{dir}/{file_name}`. Same-named files are
/// overwritten; there is no versioning.
pub struct StagingStorage {
    dir: PathBuf,
}

impl StagingStorage {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        fs::create_dir_all(dir.as_ref()).await?;
        let dir = fs::canonicalize(dir.as_ref()).await?;
        info!("Staging directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path a file with this name is staged at.
    pub fn file_path(&self, file_name: &str) -> Result<PathBuf, StorageError> {
        Ok(self.dir.join(sanitize(file_name)?))
    }

    /// Drain `stream` into the staging file for `file_name` and return its
    /// absolute path once the file is confirmed on disk.
    pub async fn persist(&self, mut stream: ByteStream, file_name: &str) -> Result<PathBuf, StorageError> {
        let path = self.file_path(file_name)?;
        let mut file = fs::File::create(&path).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let data = match chunk {
                Ok(data) => data,
                Err(e) => {
                    drop(file);
                    self.discard(&path).await;
                    return Err(StorageError::Stream(e));
                }
            };
            if let Err(e) = file.write_all(&data).await {
                drop(file);
                self.discard(&path).await;
                return Err(e.into());
            }
            written += data.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            warn!("Staged file vanished after write: {}", path.display());
            return Err(StorageError::Missing(path));
        }

        debug!(bytes = written, "Staged {}", path.display());
        Ok(path)
    }

    /// Best-effort removal of a partially written file.
    async fn discard(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!("Removed partial file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove partial file {}: {}", path.display(), e),
        }
    }
}

/// Keep only the final path component so a descriptor name can never point
/// outside the staging directory.
fn sanitize(file_name: &str) -> Result<&str, StorageError> {
    let invalid = || StorageError::InvalidName(file_name.to_string());
    match Path::new(file_name).components().next_back() {
        Some(Component::Normal(name)) => name.to_str().ok_or_else(invalid),
        _ => Err(invalid()),
    }
}
