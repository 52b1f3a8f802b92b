//! The observable, in-memory view of messages.
//!
//! Persisted records are folded in by the reconciler; the coordinator layers
//! session-local writes on top as an overlay keyed by message id. Both go
//! through `watch::Sender::send_if_modified`, so their read-modify-write
//! cycles never interleave.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;

use courier_types::{ChatId, DownloadStatus, DownloadableFile, FileId, Message, MessageId, ProjectedMessage};

use crate::reconciler::reconcile;

/// A coordinator write not (yet) reflected by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transient {
    /// DOWNLOADING or ERROR; never persisted.
    Status(DownloadStatus),
    /// Content is local; kept until the store shows the cleared reference.
    Materialized { path: String },
}

pub type Overlay = HashMap<MessageId, Transient>;

#[derive(Debug, Clone, Default)]
pub struct ProjectionState {
    chats: HashMap<ChatId, Vec<ProjectedMessage>>,
    overlay: Overlay,
}

impl ProjectionState {
    pub fn messages(&self, chat_id: ChatId) -> &[ProjectedMessage] {
        self.chats.get(&chat_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn find(&self, message_id: MessageId) -> Option<&ProjectedMessage> {
        self.chats
            .values()
            .flat_map(|messages| messages.iter())
            .find(|m| m.id() == message_id)
    }

    fn find_mut(&mut self, message_id: MessageId) -> Option<&mut ProjectedMessage> {
        self.chats
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|m| m.id() == message_id)
    }

    /// Number of messages currently showing DOWNLOADING.
    pub fn downloading_count(&self) -> usize {
        self.chats
            .values()
            .flat_map(|messages| messages.iter())
            .filter(|m| m.status() == Some(DownloadStatus::Downloading))
            .count()
    }
}

#[derive(Clone)]
pub struct Projection {
    tx: Arc<watch::Sender<ProjectionState>>,
}

impl Default for Projection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProjectionState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProjectionState> {
        self.tx.subscribe()
    }

    pub fn messages(&self, chat_id: ChatId) -> Vec<ProjectedMessage> {
        self.tx.borrow().messages(chat_id).to_vec()
    }

    pub fn get(&self, message_id: MessageId) -> Option<ProjectedMessage> {
        self.tx.borrow().find(message_id).cloned()
    }

    pub fn downloading_count(&self) -> usize {
        self.tx.borrow().downloading_count()
    }

    /// Move a message's descriptor to `next` if the transition table allows
    /// it. Returns whether anything changed.
    pub(crate) fn transition(&self, message_id: MessageId, next: DownloadStatus) -> bool {
        self.tx.send_if_modified(|state| {
            let Some(file) = state
                .find_mut(message_id)
                .and_then(|m| m.downloadable.as_mut())
            else {
                return false;
            };
            if !file.status.can_transition_to(next) {
                return false;
            }
            file.status = next;
            state.overlay.insert(message_id, Transient::Status(next));
            true
        })
    }

    /// Clear the reference and point the message at its local file. Returns
    /// false unless the message is DOWNLOADING.
    pub(crate) fn materialize(&self, message_id: MessageId, path: &str) -> bool {
        self.tx.send_if_modified(|state| {
            let Some(projected) = state.find_mut(message_id) else {
                return false;
            };
            if projected.status() != Some(DownloadStatus::Downloading) {
                return false;
            }
            projected.message.downloadable_id = None;
            projected.message.media_link = path.to_string();
            projected.downloadable = None;
            state.overlay.insert(
                message_id,
                Transient::Materialized {
                    path: path.to_string(),
                },
            );
            true
        })
    }

    /// Replace one chat's messages with a fresh store snapshot, keeping
    /// overlay entries the store has not caught up with.
    pub(crate) fn apply_store(
        &self,
        chat_id: ChatId,
        messages: Vec<Message>,
        descriptors: &HashMap<FileId, DownloadableFile>,
    ) {
        self.tx.send_modify(|state| {
            let mut touched: HashSet<MessageId> = messages.iter().map(|m| m.id).collect();
            touched.extend(state.messages(chat_id).iter().map(ProjectedMessage::id));

            let (projected, retained) = reconcile(messages, descriptors, &state.overlay);

            state.overlay.retain(|id, _| !touched.contains(id));
            state.overlay.extend(retained);
            state.chats.insert(chat_id, projected);
        });
    }
}
