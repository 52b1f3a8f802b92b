use std::path::PathBuf;

use courier_types::{DownloadStatus, MessageId};
use thiserror::Error;

/// Why a fetch did not produce a byte stream.
///
/// The first three are transfer failures the coordinator turns into an ERROR
/// status. `Unclassified` is never absorbed: it surfaces as a [`PipelineFault`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unclassified fetch error: {0}")]
    Unclassified(#[source] anyhow::Error),
}

impl FetchError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Unclassified(_))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name: '{0}'")]
    InvalidName(String),

    #[error("staging I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream interrupted while writing: {0}")]
    Stream(#[source] FetchError),

    #[error("written file missing at {}", .0.display())]
    Missing(PathBuf),
}

/// Rejections of `begin`. Nothing is mutated when one is returned.
#[derive(Debug, Error)]
pub enum BeginError {
    #[error("download already in flight for message {occupant}")]
    Busy { occupant: MessageId },

    #[error("message {0} is not in the projection")]
    UnknownMessage(MessageId),

    #[error("message {0} has no downloadable reference")]
    NotDownloadable(MessageId),

    #[error("message {message_id} cannot start downloading from {status}")]
    InvalidTransition {
        message_id: MessageId,
        status: DownloadStatus,
    },
}

impl BeginError {
    /// Busy is an expected race; the rest are calling-contract violations.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, Self::Busy { .. })
    }
}

/// Errors that must reach the caller instead of being folded into a status.
#[derive(Debug, Error)]
pub enum PipelineFault {
    #[error("fetch failed in an unexpected way: {0}")]
    Fetch(#[source] FetchError),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("message {0} is not the active download")]
    NotInFlight(MessageId),

    #[error("transfer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("source file missing: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("copy from {} failed: {source}", path.display())]
    CopyFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("copied, but removing source {} failed: {source}", path.display())]
    SourceCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("destination is the source file {}", .0.display())]
    DestinationIsSource(PathBuf),

    #[error("capability error: {0}")]
    Capability(String),

    #[error("host rejected request: {0}")]
    Host(String),
}

/// Failures of session-level requests addressed by message id.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chat {0} not found")]
    ChatNotFound(i64),

    #[error("message {0} not found in this chat")]
    MessageNotFound(MessageId),

    #[error("message {0} has no local media")]
    NoLocalMedia(MessageId),

    #[error(transparent)]
    Begin(#[from] BeginError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}
