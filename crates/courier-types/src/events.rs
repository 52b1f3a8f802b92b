use serde::{Deserialize, Serialize};

use crate::models::{FileId, MessageId};

/// Download lifecycle events broadcast by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PipelineEvent {
    /// The gate was taken and the fetch is underway
    DownloadStarted {
        message_id: MessageId,
        file_id: FileId,
        url: String,
    },

    /// Content is local and the message reference has been cleared
    DownloadFinished { message_id: MessageId, path: String },

    /// The transfer failed; the message is retryable
    DownloadFailed { message_id: MessageId, reason: String },

    /// A begin request arrived while another download held the gate
    DownloadRejected {
        message_id: MessageId,
        occupant: MessageId,
    },
}

impl PipelineEvent {
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::DownloadStarted { message_id, .. }
            | Self::DownloadFinished { message_id, .. }
            | Self::DownloadFailed { message_id, .. }
            | Self::DownloadRejected { message_id, .. } => *message_id,
        }
    }

    /// Finished and failed end a transfer; started and rejected do not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DownloadFinished { .. } | Self::DownloadFailed { .. }
        )
    }
}
