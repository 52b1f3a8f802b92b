use crate::models::{ChatRow, DownloadableFileRow, MessageRow, format_date};
use crate::{Database, StoreChange};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use courier_types::{
    Author, Chat, ChatId, ChatSummary, DownloadableFile, FileId, Message, MessageId,
};
use rusqlite::{Connection, Row};

const MESSAGE_COLUMNS: &str =
    "id, chat_id, author, content, media_link, date, downloadable_id";

impl Database {
    // -- Chats --

    /// Upsert by id. An id of 0 inserts a new chat; the stored id is returned.
    pub fn insert_chat(&self, chat: &Chat) -> Result<ChatId> {
        let id = self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chats (id, owner, profile_pic_owner) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    owner = excluded.owner,
                    profile_pic_owner = excluded.profile_pic_owner",
                rusqlite::params![new_or_existing(chat.id), chat.owner, chat.profile_pic_owner],
            )?;
            Ok(assigned_id(conn, chat.id))
        })?;

        self.publish(StoreChange::Chat(id));
        Ok(id)
    }

    pub fn get_chat(&self, id: ChatId) -> Result<Option<Chat>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, owner, profile_pic_owner FROM chats WHERE id = ?1",
                [id],
                |row| {
                    Ok(ChatRow {
                        id: row.get(0)?,
                        owner: row.get(1)?,
                        profile_pic_owner: row.get(2)?,
                    })
                },
            )
            .optional()
            .map(|row| row.map(Chat::from))
        })
    }

    /// Every chat with the content and date of its newest message.
    pub fn list_chat_summaries(&self) -> Result<Vec<ChatSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.owner, c.profile_pic_owner, m.content, m.date
                 FROM chats c
                 LEFT JOIN messages m
                    ON m.id = (SELECT MAX(id) FROM messages WHERE chat_id = c.id)
                 ORDER BY c.id",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    let chat = Chat::from(ChatRow {
                        id: row.get(0)?,
                        owner: row.get(1)?,
                        profile_pic_owner: row.get(2)?,
                    });
                    let last_message: Option<String> = row.get(3)?;
                    let last_date: Option<String> = row.get(4)?;
                    Ok(ChatSummary {
                        chat,
                        last_message,
                        last_message_date: last_date
                            .and_then(|d| d.parse::<DateTime<Utc>>().ok()),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Deletes the chat and, through the foreign key, its messages.
    pub fn delete_chat(&self, id: ChatId) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute("DELETE FROM chats WHERE id = ?1", [id])?;
            Ok(())
        })?;

        self.publish(StoreChange::Messages(id));
        self.publish(StoreChange::Chat(id));
        Ok(())
    }

    // -- Messages --

    /// Idempotent upsert by id. An id of 0 inserts a new message.
    pub fn insert_message(&self, message: &Message) -> Result<MessageId> {
        let id = self.with_conn_mut(|conn| upsert_message(conn, message))?;
        self.publish(StoreChange::Messages(message.chat_id));
        Ok(id)
    }

    /// Stores a descriptor and the OTHER message referencing it in one
    /// transaction. Returns `(message_id, file_id)`.
    pub fn insert_remote_message(
        &self,
        chat_id: ChatId,
        content: &str,
        file: &DownloadableFile,
    ) -> Result<(MessageId, FileId)> {
        let (message_id, file_id) = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let file_id = upsert_downloadable_file(&tx, file)?;
            let message = Message {
                id: 0,
                chat_id,
                author: Author::Other,
                content: content.to_string(),
                media_link: String::new(),
                date: Utc::now(),
                downloadable_id: Some(file_id),
            };
            let message_id = upsert_message(&tx, &message)?;
            tx.commit()?;
            Ok((message_id, file_id))
        })?;

        self.publish(StoreChange::DownloadableFile(file_id));
        self.publish(StoreChange::Messages(chat_id));
        Ok((message_id, file_id))
    }

    /// Messages of a chat in insertion order.
    pub fn get_messages_by_chat(&self, chat_id: ChatId) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 ORDER BY id"
            ))?;

            let rows = stmt
                .query_map([chat_id], read_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                read_message_row,
            )
            .optional()
            .map(|row| row.map(Message::from))
        })
    }

    pub fn delete_message(&self, id: MessageId) -> Result<()> {
        let chat_id = self.with_conn_mut(|conn| {
            let chat_id: Option<ChatId> = conn
                .query_row("SELECT chat_id FROM messages WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(chat_id)
        })?;

        if let Some(chat_id) = chat_id {
            self.publish(StoreChange::Messages(chat_id));
        }
        Ok(())
    }

    // -- Downloadable files --

    /// Upsert by id. An id of 0 inserts a new descriptor.
    pub fn insert_downloadable_file(&self, file: &DownloadableFile) -> Result<FileId> {
        let id = self.with_conn_mut(|conn| upsert_downloadable_file(conn, file))?;
        self.publish(StoreChange::DownloadableFile(id));
        Ok(id)
    }

    pub fn get_downloadable_file(&self, id: FileId) -> Result<Option<DownloadableFile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, url, size FROM downloadable_files WHERE id = ?1",
                [id],
                read_file_row,
            )
            .optional()
            .map(|row| row.map(DownloadableFile::from))
        })
    }

    /// Descriptors no message references any more (their content was
    /// materialized). They are retained; this only reports them.
    pub fn orphaned_downloadable_files(&self) -> Result<Vec<DownloadableFile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.id, d.name, d.url, d.size
                 FROM downloadable_files d
                 WHERE NOT EXISTS (
                    SELECT 1 FROM messages m WHERE m.downloadable_id = d.id
                 )
                 ORDER BY d.id",
            )?;

            let rows = stmt
                .query_map([], read_file_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows.into_iter().map(DownloadableFile::from).collect())
        })
    }
}

fn upsert_message(conn: &Connection, message: &Message) -> Result<MessageId> {
    conn.execute(
        "INSERT INTO messages (id, chat_id, author, content, media_link, date, downloadable_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            chat_id = excluded.chat_id,
            author = excluded.author,
            content = excluded.content,
            media_link = excluded.media_link,
            date = excluded.date,
            downloadable_id = excluded.downloadable_id",
        rusqlite::params![
            new_or_existing(message.id),
            message.chat_id,
            message.author.as_str(),
            message.content,
            message.media_link,
            format_date(&message.date),
            message.downloadable_id,
        ],
    )?;
    Ok(assigned_id(conn, message.id))
}

fn upsert_downloadable_file(conn: &Connection, file: &DownloadableFile) -> Result<FileId> {
    let size = i64::try_from(file.size).map_err(|_| anyhow!("File size out of range: {}", file.size))?;
    conn.execute(
        "INSERT INTO downloadable_files (id, name, url, size) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            url = excluded.url,
            size = excluded.size",
        rusqlite::params![new_or_existing(file.id), file.name, file.url, size],
    )?;
    Ok(assigned_id(conn, file.id))
}

/// `0` is the "not yet stored" id; SQLite assigns a rowid for NULL.
fn new_or_existing(id: i64) -> Option<i64> {
    (id != 0).then_some(id)
}

fn assigned_id(conn: &Connection, requested: i64) -> i64 {
    if requested != 0 { requested } else { conn.last_insert_rowid() }
}

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        author: row.get(2)?,
        content: row.get(3)?,
        media_link: row.get(4)?,
        date: row.get(5)?,
        downloadable_id: row.get(6)?,
    })
}

fn read_file_row(row: &Row<'_>) -> rusqlite::Result<DownloadableFileRow> {
    Ok(DownloadableFileRow {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        size: row.get(3)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
