//! Observe-as-stream views over the store.
//!
//! Each stream yields the current snapshot first, then a fresh snapshot after
//! every relevant write. A lagged receiver re-queries instead of replaying.

use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use courier_types::{ChatId, DownloadableFile, FileId, Message};

use crate::{Database, StoreChange};

impl Database {
    pub fn watch_messages(self: &Arc<Self>, chat_id: ChatId) -> BoxStream<'static, Result<Vec<Message>>> {
        let db = Arc::clone(self);
        // Subscribe before the first snapshot so no write slips between them.
        let mut changes = db.subscribe();

        async_stream::stream! {
            yield snapshot(&db, move |db| db.get_messages_by_chat(chat_id)).await;

            loop {
                match changes.recv().await {
                    Ok(StoreChange::Messages(id)) | Ok(StoreChange::Chat(id)) if id == chat_id => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(chat_id, skipped, "Message watcher lagged, re-querying");
                    }
                    Err(RecvError::Closed) => break,
                }

                yield snapshot(&db, move |db| db.get_messages_by_chat(chat_id)).await;
            }
        }
        .boxed()
    }

    pub fn watch_downloadable_file(
        self: &Arc<Self>,
        id: FileId,
    ) -> BoxStream<'static, Result<Option<DownloadableFile>>> {
        let db = Arc::clone(self);
        let mut changes = db.subscribe();

        async_stream::stream! {
            yield snapshot(&db, move |db| db.get_downloadable_file(id)).await;

            loop {
                match changes.recv().await {
                    Ok(StoreChange::DownloadableFile(changed)) if changed == id => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(file_id = id, skipped, "Descriptor watcher lagged, re-querying");
                    }
                    Err(RecvError::Closed) => break,
                }

                yield snapshot(&db, move |db| db.get_downloadable_file(id)).await;
            }
        }
        .boxed()
    }
}

/// Run a blocking query off the async runtime.
async fn snapshot<T, F>(db: &Arc<Database>, query: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || query(&db)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::Chat;
    use std::time::Duration;

    #[tokio::test]
    async fn message_stream_emits_snapshot_then_updates() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat_id = db
            .insert_chat(&Chat {
                id: 0,
                owner: "Ana".into(),
                profile_pic_owner: String::new(),
            })
            .unwrap();

        let mut stream = db.watch_messages(chat_id);
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.is_empty());

        db.insert_message(&Message::outgoing(chat_id, "hi", "")).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "hi");
    }

    #[tokio::test]
    async fn message_stream_ignores_other_chats() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mine = db
            .insert_chat(&Chat { id: 0, owner: "a".into(), profile_pic_owner: String::new() })
            .unwrap();
        let theirs = db
            .insert_chat(&Chat { id: 0, owner: "b".into(), profile_pic_owner: String::new() })
            .unwrap();

        let mut stream = db.watch_messages(mine);
        stream.next().await.unwrap().unwrap();

        db.insert_message(&Message::outgoing(theirs, "elsewhere", "")).unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn descriptor_stream_follows_upserts() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = db
            .insert_downloadable_file(&DownloadableFile::new("a.png", "http://x/a.png", 1))
            .unwrap();

        let mut stream = db.watch_downloadable_file(id);
        let first = stream.next().await.unwrap().unwrap().unwrap();
        assert_eq!(first.size, 1);

        let mut renamed = first.clone();
        renamed.name = "b.png".into();
        db.insert_downloadable_file(&renamed).unwrap();

        let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.name, "b.png");
    }
}
