use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use courier_db::Database;
use courier_types::{ChatId, DownloadableFile, FileId, Message, ProjectedMessage};

use crate::projection::{Overlay, Projection, Transient};

/// Fold persisted messages, their resolved descriptors and the session
/// overlay into the projected list.
///
/// Remote-origin messages carrying a reference get their descriptor, with the
/// overlay applied on top (the overlay is the later write). Everything else
/// passes through unchanged. Returns the projection in input order together
/// with the overlay entries that are still needed; an entry is dropped once
/// the persisted message no longer carries a reference.
pub fn reconcile(
    messages: Vec<Message>,
    descriptors: &HashMap<FileId, DownloadableFile>,
    overlay: &Overlay,
) -> (Vec<ProjectedMessage>, Overlay) {
    let mut retained = Overlay::new();
    let mut projected = Vec::with_capacity(messages.len());

    for mut message in messages {
        let file_id = match message.downloadable_id {
            Some(file_id) if message.is_remote() => file_id,
            _ => {
                projected.push(ProjectedMessage {
                    message,
                    downloadable: None,
                });
                continue;
            }
        };

        let downloadable = match overlay.get(&message.id) {
            Some(transient @ Transient::Materialized { path }) => {
                message.downloadable_id = None;
                message.media_link = path.clone();
                retained.insert(message.id, transient.clone());
                None
            }
            Some(transient @ Transient::Status(status)) => {
                retained.insert(message.id, transient.clone());
                descriptors.get(&file_id).cloned().map(|mut file| {
                    file.status = *status;
                    file
                })
            }
            None => descriptors.get(&file_id).cloned(),
        };

        if downloadable.is_none() && message.downloadable_id.is_some() {
            warn!(message_id = message.id, file_id, "Referenced descriptor not found");
        }

        projected.push(ProjectedMessage {
            message,
            downloadable,
        });
    }

    (projected, retained)
}

/// Keeps a chat's projection in step with the store.
#[derive(Clone)]
pub struct StateReconciler {
    db: Arc<Database>,
    projection: Projection,
}

impl StateReconciler {
    pub fn new(db: Arc<Database>, projection: Projection) -> Self {
        Self { db, projection }
    }

    /// Resolve descriptors for `messages` and fold them into the projection.
    pub async fn apply(&self, chat_id: ChatId, messages: Vec<Message>) -> anyhow::Result<()> {
        let wanted: Vec<FileId> = messages
            .iter()
            .filter(|m| m.is_remote())
            .filter_map(|m| m.downloadable_id)
            .collect();

        let db = Arc::clone(&self.db);
        let descriptors = tokio::task::spawn_blocking(move || {
            let mut found = HashMap::with_capacity(wanted.len());
            for id in wanted {
                if let Some(file) = db.get_downloadable_file(id)? {
                    found.insert(id, file);
                }
            }
            Ok::<_, anyhow::Error>(found)
        })
        .await??;

        self.projection.apply_store(chat_id, messages, &descriptors);
        Ok(())
    }

    /// One-off fold of the current store contents.
    pub async fn refresh(&self, chat_id: ChatId) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        let messages = tokio::task::spawn_blocking(move || db.get_messages_by_chat(chat_id)).await??;
        self.apply(chat_id, messages).await
    }

    /// Follow the chat's message stream until the task is aborted.
    pub fn spawn(self, chat_id: ChatId) -> JoinHandle<()> {
        let mut updates = self.db.watch_messages(chat_id);
        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                let result = match update {
                    Ok(messages) => self.apply(chat_id, messages).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(chat_id, "Reconcile failed: {}", e);
                }
            }
            debug!(chat_id, "Message stream ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::{Author, DownloadStatus};

    fn remote(id: i64, file_id: i64) -> Message {
        let mut message = Message::outgoing(1, format!("m{id}"), "");
        message.id = id;
        message.author = Author::Other;
        message.downloadable_id = Some(file_id);
        message
    }

    fn descriptor(id: i64) -> DownloadableFile {
        let mut file = DownloadableFile::new(format!("f{id}.png"), format!("http://x/f{id}.png"), 10);
        file.id = id;
        file
    }

    #[test]
    fn resolves_descriptors_for_remote_messages_only() {
        let mut local = Message::outgoing(1, "mine", "/pics/cat.png");
        local.id = 1;
        local.downloadable_id = Some(20);
        let messages = vec![local.clone(), remote(2, 20)];
        let descriptors = HashMap::from([(20, descriptor(20))]);

        let (projected, overlay) = reconcile(messages, &descriptors, &Overlay::new());

        assert_eq!(projected[0].message, local);
        assert!(projected[0].downloadable.is_none());
        assert_eq!(projected[1].status(), Some(DownloadStatus::Pending));
        assert!(overlay.is_empty());
    }

    #[test]
    fn overlay_status_wins_over_persisted_pending() {
        let descriptors = HashMap::from([(20, descriptor(20))]);
        let overlay = Overlay::from([(2, Transient::Status(DownloadStatus::Downloading))]);

        let (projected, retained) = reconcile(vec![remote(2, 20)], &descriptors, &overlay);

        assert_eq!(projected[0].status(), Some(DownloadStatus::Downloading));
        assert_eq!(retained, overlay);
    }

    #[test]
    fn materialized_overlay_hides_stale_reference_until_store_catches_up() {
        let descriptors = HashMap::from([(20, descriptor(20))]);
        let overlay = Overlay::from([(
            2,
            Transient::Materialized {
                path: "/staging/f20.png".into(),
            },
        )]);

        let (projected, retained) = reconcile(vec![remote(2, 20)], &descriptors, &overlay);
        assert!(projected[0].is_materialized());
        assert_eq!(projected[0].message.media_link, "/staging/f20.png");
        assert_eq!(retained.len(), 1);

        let mut persisted = remote(2, 20);
        persisted.downloadable_id = None;
        persisted.media_link = "/staging/f20.png".into();
        let (projected, retained) = reconcile(vec![persisted], &descriptors, &overlay);
        assert!(projected[0].is_materialized());
        assert!(retained.is_empty());
    }

    #[test]
    fn missing_descriptor_passes_message_through() {
        let (projected, _) = reconcile(vec![remote(2, 99)], &HashMap::new(), &Overlay::new());
        assert_eq!(projected[0].message.downloadable_id, Some(99));
        assert!(projected[0].downloadable.is_none());
    }

    #[test]
    fn fold_is_deterministic() {
        let descriptors = HashMap::from([(20, descriptor(20)), (21, descriptor(21))]);
        let overlay = Overlay::from([(3, Transient::Status(DownloadStatus::Error))]);
        let messages = vec![remote(2, 20), remote(3, 21)];

        let first = reconcile(messages.clone(), &descriptors, &overlay);
        let second = reconcile(messages, &descriptors, &overlay);
        assert_eq!(first, second);
    }
}
