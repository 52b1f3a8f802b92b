//! Database row types, mapped directly from SQLite rows.
//! Conversion into courier-types models happens here so queries stay flat.

use chrono::{DateTime, NaiveDateTime, Utc};
use courier_types::{Author, Chat, DownloadStatus, DownloadableFile, Message};
use tracing::warn;

pub struct ChatRow {
    pub id: i64,
    pub owner: String,
    pub profile_pic_owner: String,
}

pub struct MessageRow {
    pub id: i64,
    pub chat_id: i64,
    pub author: String,
    pub content: String,
    pub media_link: String,
    pub date: String,
    pub downloadable_id: Option<i64>,
}

pub struct DownloadableFileRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub size: i64,
}

impl From<ChatRow> for Chat {
    fn from(row: ChatRow) -> Self {
        Chat {
            id: row.id,
            owner: row.owner,
            profile_pic_owner: row.profile_pic_owner,
        }
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let author = row.author.parse::<Author>().unwrap_or_else(|e| {
            warn!("Corrupt author on message {}: {}", row.id, e);
            Author::User
        });

        Message {
            id: row.id,
            chat_id: row.chat_id,
            author,
            date: parse_date(&row.date, row.id),
            content: row.content,
            media_link: row.media_link,
            downloadable_id: row.downloadable_id,
        }
    }
}

/// Only PENDING is ever persisted; DOWNLOADING and ERROR live in the session.
impl From<DownloadableFileRow> for DownloadableFile {
    fn from(row: DownloadableFileRow) -> Self {
        DownloadableFile {
            id: row.id,
            name: row.name,
            url: row.url,
            size: row.size.max(0) as u64,
            status: DownloadStatus::Pending,
        }
    }
}

pub(crate) fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339()
}

fn parse_date(raw: &str, message_id: i64) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by SQLite's datetime('now') carry no timezone.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt date '{}' on message {}: {}", raw, message_id, e);
            DateTime::default()
        })
}
