//! Courier core: moves remote message content into local files.
//!
//! - `NetworkFetcher` turns a URL into a byte stream
//! - `StagingStorage` drains that stream into the private staging area
//! - `DownloadCoordinator` runs one transfer at a time and owns the status
//!   transitions
//! - `StateReconciler` folds store snapshots into the observable projection
//! - `FileMaterializer` hands local files to the host through capability
//!   handles

pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod host;
pub mod materializer;
pub mod projection;
pub mod reconciler;
pub mod session;
pub mod storage;

pub use coordinator::{DownloadCoordinator, DownloadOutcome, DownloadTicket};
pub use error::{BeginError, FetchError, MaterializeError, PipelineFault, SessionError, StorageError};
pub use fetcher::{ByteStream, HttpFetcher, NetworkFetcher};
pub use host::{CapabilityHandle, HostAction, HostPlatform, HostRequest, LocalHost};
pub use materializer::{FileMaterializer, content_type_for};
pub use projection::{Projection, ProjectionState, Transient};
pub use reconciler::{StateReconciler, reconcile};
pub use session::ChatSession;
pub use storage::StagingStorage;
