//! Host platform capabilities.
//!
//! Local paths never cross into the host as-is: the host mints an opaque,
//! time-limited handle for each path it is asked to expose, and every action
//! refers to that handle.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::MaterializeError;

pub type DestinationWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque reference to a host-granted file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityHandle(String);

impl CapabilityHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CapabilityHandle {
    fn from(uri: String) -> Self {
        Self(uri)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    /// Open in an external viewer
    View,
    /// Hand to the host's share sheet
    Send,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequest {
    pub action: HostAction,
    pub handle: CapabilityHandle,
    pub content_type: String,
}

pub trait HostPlatform: Send + Sync + 'static {
    /// Mint a read handle for a local file.
    fn grant(&self, path: &Path) -> Result<CapabilityHandle, MaterializeError>;

    fn launch(&self, request: HostRequest) -> Result<(), MaterializeError>;

    /// Open the writable destination behind a handle the host issued.
    fn open_destination(
        &self,
        handle: &CapabilityHandle,
    ) -> impl Future<Output = Result<DestinationWriter, MaterializeError>> + Send;

    /// Whether the destination behind `handle` is the file at `path`.
    fn refers_to(&self, handle: &CapabilityHandle, path: &Path) -> Result<bool, MaterializeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

#[derive(Debug)]
struct Grant {
    path: PathBuf,
    access: Access,
    expires_at: Instant,
}

/// Host backed by the local filesystem. Grants are `content://` URIs that
/// expire after a fixed time-to-live; launched requests are logged and kept
/// for inspection.
pub struct LocalHost {
    authority: String,
    ttl: Duration,
    grants: DashMap<String, Grant>,
    launched: Mutex<Vec<HostRequest>>,
}

impl LocalHost {
    pub fn new(authority: impl Into<String>, ttl: Duration) -> Self {
        Self {
            authority: authority.into(),
            ttl,
            grants: DashMap::new(),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Accept `path` as a save target and return the handle callers pass to
    /// `move_to`. The file itself is created when the destination is opened.
    pub fn register_destination(&self, path: impl Into<PathBuf>) -> CapabilityHandle {
        self.mint(path.into(), Access::Write)
    }

    /// Path behind a live handle.
    pub fn resolve(&self, handle: &CapabilityHandle) -> Option<PathBuf> {
        self.lookup(handle, None).ok()
    }

    pub fn revoke(&self, handle: &CapabilityHandle) -> bool {
        self.grants.remove(handle.as_str()).is_some()
    }

    /// Drop expired grants; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.grants.len();
        self.grants.retain(|_, grant| grant.expires_at > now);
        let purged = before - self.grants.len();
        if purged > 0 {
            debug!(purged, "Purged expired grants");
        }
        purged
    }

    pub fn launched(&self) -> Vec<HostRequest> {
        self.launched.lock().clone()
    }

    fn mint(&self, path: PathBuf, access: Access) -> CapabilityHandle {
        let uri = format!("content://{}/{}", self.authority, Uuid::new_v4());
        debug!(?access, "Granted {} for {}", uri, path.display());
        self.grants.insert(
            uri.clone(),
            Grant {
                path,
                access,
                expires_at: Instant::now() + self.ttl,
            },
        );
        CapabilityHandle(uri)
    }

    fn lookup(&self, handle: &CapabilityHandle, wanted: Option<Access>) -> Result<PathBuf, MaterializeError> {
        let grant = self
            .grants
            .get(handle.as_str())
            .ok_or_else(|| MaterializeError::Capability(format!("unknown handle {}", handle)))?;

        if grant.expires_at <= Instant::now() {
            return Err(MaterializeError::Capability(format!("handle {} expired", handle)));
        }
        if let Some(access) = wanted {
            if access != grant.access {
                return Err(MaterializeError::Capability(format!(
                    "handle {} does not allow {:?} access",
                    handle, access
                )));
            }
        }
        Ok(grant.path.clone())
    }
}

impl HostPlatform for LocalHost {
    fn grant(&self, path: &Path) -> Result<CapabilityHandle, MaterializeError> {
        if !path.is_file() {
            return Err(MaterializeError::SourceMissing(path.to_path_buf()));
        }
        Ok(self.mint(path.to_path_buf(), Access::Read))
    }

    fn launch(&self, request: HostRequest) -> Result<(), MaterializeError> {
        self.lookup(&request.handle, Some(Access::Read))?;
        info!(
            action = ?request.action,
            content_type = %request.content_type,
            "Launching {}",
            request.handle
        );
        self.launched.lock().push(request);
        Ok(())
    }

    async fn open_destination(&self, handle: &CapabilityHandle) -> Result<DestinationWriter, MaterializeError> {
        let path = self.lookup(handle, Some(Access::Write))?;
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| MaterializeError::Host(format!("cannot open {}: {}", handle, e)))?;
        Ok(Box::new(file))
    }

    fn refers_to(&self, handle: &CapabilityHandle, path: &Path) -> Result<bool, MaterializeError> {
        let target = self.lookup(handle, Some(Access::Write))?;
        match (canonical(&target), canonical(path)) {
            (Some(target), Some(path)) => Ok(target == path),
            _ => Ok(false),
        }
    }
}

/// Absolute form with symlinks resolved. A file that does not exist yet is
/// placed under its canonical parent.
fn canonical(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return Some(resolved);
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Some(std::fs::canonicalize(parent).ok()?.join(path.file_name()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_are_opaque_and_resolvable() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.png");
        std::fs::write(&file, b"x").unwrap();
        let host = LocalHost::new("courier.files", Duration::from_secs(60));

        let handle = host.grant(&file).unwrap();

        assert!(handle.as_str().starts_with("content://courier.files/"));
        assert!(!handle.as_str().contains("a.png"));
        assert_eq!(host.resolve(&handle), Some(file));
        assert!(host.revoke(&handle));
        assert_eq!(host.resolve(&handle), None);
    }

    #[test]
    fn grant_requires_existing_file() {
        let host = LocalHost::new("courier.files", Duration::from_secs(60));
        let err = host.grant(Path::new("/no/such/file.png")).unwrap_err();
        assert!(matches!(err, MaterializeError::SourceMissing(_)));
    }

    #[test]
    fn expired_grants_are_refused_and_purged() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.png");
        std::fs::write(&file, b"x").unwrap();
        let host = LocalHost::new("courier.files", Duration::ZERO);

        let handle = host.grant(&file).unwrap();
        let err = host
            .launch(HostRequest {
                action: HostAction::View,
                handle: handle.clone(),
                content_type: "image/png".into(),
            })
            .unwrap_err();

        assert!(matches!(err, MaterializeError::Capability(_)));
        assert!(host.launched().is_empty());
        assert_eq!(host.purge_expired(), 1);
    }

    #[tokio::test]
    async fn read_handles_cannot_be_written() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.png");
        std::fs::write(&file, b"x").unwrap();
        let host = LocalHost::new("courier.files", Duration::from_secs(60));

        let handle = host.grant(&file).unwrap();
        let err = host.open_destination(&handle).await.err().unwrap();
        assert!(matches!(err, MaterializeError::Capability(_)));
    }

    #[test]
    fn destination_aliases_are_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.png");
        std::fs::write(&file, b"x").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let host = LocalHost::new("courier.files", Duration::from_secs(60));

        let same = host.register_destination(&file);
        let dotted = host.register_destination(tmp.path().join("sub").join("..").join("a.png"));
        let other = host.register_destination(tmp.path().join("b.png"));

        assert!(host.refers_to(&same, &file).unwrap());
        assert!(host.refers_to(&dotted, &file).unwrap());
        assert!(!host.refers_to(&other, &file).unwrap());

        let read = host.grant(&file).unwrap();
        assert!(matches!(host.refers_to(&read, &file), Err(MaterializeError::Capability(_))));
    }
}
