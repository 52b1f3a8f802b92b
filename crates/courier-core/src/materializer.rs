use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::MaterializeError;
use crate::host::{CapabilityHandle, HostAction, HostPlatform, HostRequest, LocalHost};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Hands local files to the host: view, share, or move to a host-chosen
/// destination. Never touches download state.
pub struct FileMaterializer<H: HostPlatform = LocalHost> {
    host: Arc<H>,
}

impl<H: HostPlatform> Clone for FileMaterializer<H> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
        }
    }
}

impl<H: HostPlatform> FileMaterializer<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn open_with(&self, path: &Path) -> Result<CapabilityHandle, MaterializeError> {
        self.dispatch(HostAction::View, path)
    }

    pub fn share(&self, path: &Path) -> Result<CapabilityHandle, MaterializeError> {
        self.dispatch(HostAction::Send, path)
    }

    fn dispatch(&self, action: HostAction, path: &Path) -> Result<CapabilityHandle, MaterializeError> {
        let content_type = content_type_for(path);
        let handle = self.host.grant(path)?;
        self.host.launch(HostRequest {
            action,
            handle: handle.clone(),
            content_type,
        })?;
        Ok(handle)
    }

    /// Copy `source` into the destination behind `destination`, then delete
    /// the source. The source is only removed once the copy is complete and
    /// flushed. Returns the number of bytes copied.
    pub async fn move_to(&self, source: &Path, destination: &CapabilityHandle) -> Result<u64, MaterializeError> {
        let copy_failed = |e: std::io::Error| MaterializeError::CopyFailed {
            path: source.to_path_buf(),
            source: e,
        };

        let mut reader = match fs::File::open(source).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MaterializeError::SourceMissing(source.to_path_buf()));
            }
            Err(e) => return Err(copy_failed(e)),
        };
        if self.host.refers_to(destination, source)? {
            warn!("Refusing to move {} onto itself", source.display());
            return Err(MaterializeError::DestinationIsSource(source.to_path_buf()));
        }
        let mut writer = self.host.open_destination(destination).await?;

        let copied = async {
            let n = tokio::io::copy(&mut reader, &mut writer).await?;
            writer.shutdown().await?;
            Ok::<_, std::io::Error>(n)
        }
        .await
        .map_err(|e| {
            warn!("Copy of {} to {} failed, source kept: {}", source.display(), destination, e);
            copy_failed(e)
        })?;
        drop(reader);
        drop(writer);

        fs::remove_file(source)
            .await
            .map_err(|e| MaterializeError::SourceCleanup {
                path: source.to_path_buf(),
                source: e,
            })?;

        info!(bytes = copied, "Moved {} to {}", source.display(), destination);
        Ok(copied)
    }
}

/// Content type from the file extension, `application/octet-stream` when
/// unknown.
pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DestinationWriter;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::AsyncWrite;

    fn local() -> FileMaterializer<LocalHost> {
        FileMaterializer::new(Arc::new(LocalHost::new("courier.files", Duration::from_secs(60))))
    }

    #[test]
    fn content_types_fall_back_to_octet_stream() {
        assert_eq!(content_type_for(Path::new("a.png")), "image/png");
        assert_eq!(content_type_for(Path::new("doc.pdf")), "application/pdf");
        assert_eq!(content_type_for(Path::new("blob.zzqx")), FALLBACK_CONTENT_TYPE);
        assert_eq!(content_type_for(Path::new("noext")), FALLBACK_CONTENT_TYPE);
    }

    #[test]
    fn open_and_share_route_through_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.png");
        std::fs::write(&file, b"png").unwrap();
        let materializer = local();

        let viewed = materializer.open_with(&file).unwrap();
        let shared = materializer.share(&file).unwrap();

        let launched = materializer.host().launched();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[0].action, HostAction::View);
        assert_eq!(launched[0].handle, viewed);
        assert_eq!(launched[0].content_type, "image/png");
        assert_eq!(launched[1].action, HostAction::Send);
        assert_eq!(launched[1].handle, shared);
        assert!(!viewed.as_str().contains(tmp.path().to_str().unwrap()));
    }

    #[test]
    fn open_missing_file_is_reported() {
        let err = local().open_with(Path::new("/no/such/a.png")).unwrap_err();
        assert!(matches!(err, MaterializeError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn move_copies_then_deletes_source() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.png");
        let target = tmp.path().join("saved.png");
        std::fs::write(&source, b"0123456789").unwrap();
        let materializer = local();
        let handle = materializer.host().register_destination(&target);

        let copied = materializer.move_to(&source, &handle).await.unwrap();

        assert_eq!(copied, 10);
        assert!(!source.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn unopenable_destination_keeps_source() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.png");
        std::fs::write(&source, b"data").unwrap();
        let materializer = local();
        let handle = materializer
            .host()
            .register_destination(tmp.path().join("missing-dir").join("a.png"));

        let err = materializer.move_to(&source, &handle).await.unwrap_err();

        assert!(matches!(err, MaterializeError::Host(_)));
        assert_eq!(std::fs::read(&source).unwrap(), b"data");
    }

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::other("disk full")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct BrokenHost;

    impl HostPlatform for BrokenHost {
        fn grant(&self, _: &Path) -> Result<CapabilityHandle, MaterializeError> {
            Ok(CapabilityHandle::from("content://broken/1".to_string()))
        }

        fn launch(&self, _: HostRequest) -> Result<(), MaterializeError> {
            Ok(())
        }

        async fn open_destination(&self, _: &CapabilityHandle) -> Result<DestinationWriter, MaterializeError> {
            Ok(Box::new(BrokenWriter))
        }

        fn refers_to(&self, _: &CapabilityHandle, _: &Path) -> Result<bool, MaterializeError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn failed_copy_keeps_source() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.png");
        std::fs::write(&source, b"data").unwrap();
        let materializer = FileMaterializer::new(Arc::new(BrokenHost));
        let handle = CapabilityHandle::from("content://broken/1".to_string());

        let err = materializer.move_to(&source, &handle).await.unwrap_err();

        assert!(matches!(err, MaterializeError::CopyFailed { .. }));
        assert_eq!(std::fs::read(&source).unwrap(), b"data");
    }

    #[tokio::test]
    async fn saving_onto_itself_keeps_source() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();
        let materializer = local();
        let handle = materializer.host().register_destination(&source);

        let err = materializer.move_to(&source, &handle).await.unwrap_err();

        assert!(matches!(err, MaterializeError::DestinationIsSource(_)));
        assert_eq!(std::fs::read(&source).unwrap(), b"pixels");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saving_through_a_symlink_to_the_source_keeps_source() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.png");
        let link = tmp.path().join("link.png");
        std::fs::write(&source, b"pixels").unwrap();
        std::os::unix::fs::symlink(&source, &link).unwrap();
        let materializer = local();
        let handle = materializer.host().register_destination(&link);

        let err = materializer.move_to(&source, &handle).await.unwrap_err();

        assert!(matches!(err, MaterializeError::DestinationIsSource(_)));
        assert_eq!(std::fs::read(&source).unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn missing_source_is_not_a_copy_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = local();
        let handle = materializer.host().register_destination(tmp.path().join("out"));

        let err = materializer
            .move_to(&tmp.path().join("gone.png"), &handle)
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::SourceMissing(_)));
    }
}
