use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ChatId = i64;
pub type MessageId = i64;
pub type FileId = i64;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub owner: String,
    pub profile_pic_owner: String,
}

/// A chat together with its most recent message, for chat list rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat: Chat,
    pub last_message: Option<String>,
    pub last_message_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Author {
    User,
    Other,
}

impl Author {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Other => "OTHER",
        }
    }
}

impl FromStr for Author {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "OTHER" => Ok(Self::Other),
            other => Err(ParseEnumError {
                kind: "author",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as persisted.
///
/// `downloadable_id` points at remote content that has not been materialized
/// yet. Once the content is local the reference is cleared and `media_link`
/// holds the local path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub author: Author,
    pub content: String,
    pub media_link: String,
    pub date: DateTime<Utc>,
    pub downloadable_id: Option<FileId>,
}

impl Message {
    /// A message authored locally, not yet persisted (`id == 0`).
    pub fn outgoing(chat_id: ChatId, content: impl Into<String>, media_link: impl Into<String>) -> Self {
        Self {
            id: 0,
            chat_id,
            author: Author::User,
            content: content.into(),
            media_link: media_link.into(),
            date: Utc::now(),
            downloadable_id: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.author == Author::Other
    }

    pub fn has_media(&self) -> bool {
        !self.media_link.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Error,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Downloading => "DOWNLOADING",
            Self::Error => "ERROR",
        }
    }

    /// Whether a download may be started from this status.
    pub fn can_begin(&self) -> bool {
        self.can_transition_to(Self::Downloading)
    }

    /// Transition table. Materialization is not a status: it is represented
    /// by clearing the message's reference, reachable only from `Downloading`.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Downloading)
                | (Self::Error, Self::Downloading)
                | (Self::Downloading, Self::Error)
        )
    }
}

impl FromStr for DownloadStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "DOWNLOADING" => Ok(Self::Downloading),
            "ERROR" => Ok(Self::Error),
            other => Err(ParseEnumError {
                kind: "download status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of remote content referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadableFile {
    pub id: FileId,
    pub name: String,
    pub url: String,
    pub size: u64,
    #[serde(default)]
    pub status: DownloadStatus,
}

impl DownloadableFile {
    pub fn new(name: impl Into<String>, url: impl Into<String>, size: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            url: url.into(),
            size,
            status: DownloadStatus::Pending,
        }
    }
}

/// A message as the UI sees it: the persisted record with its descriptor
/// resolved and any session-local status applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedMessage {
    pub message: Message,
    pub downloadable: Option<DownloadableFile>,
}

impl ProjectedMessage {
    pub fn id(&self) -> MessageId {
        self.message.id
    }

    pub fn status(&self) -> Option<DownloadStatus> {
        self.downloadable.as_ref().map(|d| d.status)
    }

    /// True once the remote content is local and the reference is gone.
    pub fn is_materialized(&self) -> bool {
        self.message.downloadable_id.is_none() && self.message.has_media()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// Request sent, waiting for the response body.
    Fetching,
    /// Byte stream obtained and being written to staging.
    Writing,
}

/// The single in-flight transfer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInDownload {
    pub message_id: MessageId,
    pub file_id: FileId,
    pub url: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub phase: TransferPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_allowed_from_pending_and_error_only() {
        assert!(DownloadStatus::Pending.can_begin());
        assert!(DownloadStatus::Error.can_begin());
        assert!(!DownloadStatus::Downloading.can_begin());
    }

    #[test]
    fn downloading_never_returns_to_pending() {
        assert!(!DownloadStatus::Downloading.can_transition_to(DownloadStatus::Pending));
        assert!(DownloadStatus::Downloading.can_transition_to(DownloadStatus::Error));
        assert!(!DownloadStatus::Pending.can_transition_to(DownloadStatus::Error));
    }

    #[test]
    fn enums_parse_their_own_text() {
        for status in [
            DownloadStatus::Pending,
            DownloadStatus::Downloading,
            DownloadStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
        assert_eq!("OTHER".parse::<Author>().unwrap(), Author::Other);
        assert!("robot".parse::<Author>().is_err());
    }

    #[test]
    fn materialized_means_reference_cleared_and_media_set() {
        let mut message = Message::outgoing(1, "hi", "");
        message.author = Author::Other;
        message.downloadable_id = Some(3);
        let mut projected = ProjectedMessage {
            message,
            downloadable: Some(DownloadableFile::new("a.png", "http://x/a.png", 10)),
        };
        assert!(!projected.is_materialized());

        projected.message.downloadable_id = None;
        projected.message.media_link = "/tmp/a.png".into();
        projected.downloadable = None;
        assert!(projected.is_materialized());
    }
}
