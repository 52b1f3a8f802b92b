use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use courier_db::Database;
use courier_types::{Chat, ChatId, Message, MessageId, PipelineEvent, ProjectedMessage};

use crate::coordinator::{DownloadCoordinator, DownloadTicket};
use crate::error::SessionError;
use crate::fetcher::{HttpFetcher, NetworkFetcher};
use crate::host::{CapabilityHandle, HostPlatform, LocalHost};
use crate::materializer::FileMaterializer;
use crate::projection::ProjectionState;
use crate::reconciler::StateReconciler;

/// One open chat: its projection kept live from the store, plus the
/// user-facing requests addressed by message id.
pub struct ChatSession<F: NetworkFetcher = HttpFetcher, H: HostPlatform = LocalHost> {
    chat: Chat,
    db: Arc<Database>,
    coordinator: DownloadCoordinator<F>,
    materializer: FileMaterializer<H>,
    watcher: JoinHandle<()>,
}

impl<F: NetworkFetcher, H: HostPlatform> ChatSession<F, H> {
    /// Load the chat, fold its current messages and start following the store.
    pub async fn open(
        chat_id: ChatId,
        db: Arc<Database>,
        coordinator: DownloadCoordinator<F>,
        materializer: FileMaterializer<H>,
    ) -> Result<Self, SessionError> {
        let lookup = Arc::clone(&db);
        let chat = tokio::task::spawn_blocking(move || lookup.get_chat(chat_id))
            .await
            .map_err(|e| SessionError::Store(e.into()))?
            .map_err(SessionError::Store)?
            .ok_or(SessionError::ChatNotFound(chat_id))?;

        let reconciler = StateReconciler::new(Arc::clone(&db), coordinator.projection().clone());
        reconciler.refresh(chat_id).await.map_err(SessionError::Store)?;
        let watcher = reconciler.spawn(chat_id);

        info!(chat_id, owner = %chat.owner, "Chat session opened");
        Ok(Self {
            chat,
            db,
            coordinator,
            materializer,
            watcher,
        })
    }

    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    /// Owner name and profile picture owner, for the chat header.
    pub fn header(&self) -> (&str, &str) {
        (&self.chat.owner, &self.chat.profile_pic_owner)
    }

    pub fn materializer(&self) -> &FileMaterializer<H> {
        &self.materializer
    }

    pub fn messages(&self) -> Vec<ProjectedMessage> {
        self.coordinator.projection().messages(self.chat.id)
    }

    pub fn subscribe(&self) -> watch::Receiver<ProjectionState> {
        self.coordinator.projection().subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.coordinator.subscribe()
    }

    /// Store a USER message. Nothing is sent when there is neither text nor
    /// media; `None` is returned in that case.
    pub async fn send_message(&self, content: &str, media: Option<&Path>) -> Result<Option<MessageId>, SessionError> {
        let media_link = media.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        if content.trim().is_empty() && media_link.is_empty() {
            debug!(chat_id = self.chat.id, "Nothing to send");
            return Ok(None);
        }

        let message = Message::outgoing(self.chat.id, content, media_link);
        let db = Arc::clone(&self.db);
        let id = tokio::task::spawn_blocking(move || db.insert_message(&message))
            .await
            .map_err(|e| SessionError::Store(e.into()))?
            .map_err(SessionError::Store)?;
        Ok(Some(id))
    }

    pub fn request_download(&self, message_id: MessageId) -> Result<DownloadTicket, SessionError> {
        self.find(message_id)?;
        Ok(self.coordinator.begin(message_id)?)
    }

    pub fn request_open(&self, message_id: MessageId) -> Result<CapabilityHandle, SessionError> {
        let path = self.local_media(message_id)?;
        Ok(self.materializer.open_with(&path)?)
    }

    pub fn request_share(&self, message_id: MessageId) -> Result<CapabilityHandle, SessionError> {
        let path = self.local_media(message_id)?;
        Ok(self.materializer.share(&path)?)
    }

    /// Move the message's local file to a host destination. The message keeps
    /// its media link.
    pub async fn request_save(
        &self,
        message_id: MessageId,
        destination: &CapabilityHandle,
    ) -> Result<u64, SessionError> {
        let path = self.local_media(message_id)?;
        Ok(self.materializer.move_to(&path, destination).await?)
    }

    fn find(&self, message_id: MessageId) -> Result<ProjectedMessage, SessionError> {
        self.coordinator
            .projection()
            .get(message_id)
            .filter(|m| m.message.chat_id == self.chat.id)
            .ok_or(SessionError::MessageNotFound(message_id))
    }

    fn local_media(&self, message_id: MessageId) -> Result<PathBuf, SessionError> {
        let projected = self.find(message_id)?;
        if projected.message.downloadable_id.is_some() || !projected.message.has_media() {
            return Err(SessionError::NoLocalMedia(message_id));
        }
        Ok(PathBuf::from(projected.message.media_link))
    }
}

impl<F: NetworkFetcher, H: HostPlatform> Drop for ChatSession<F, H> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
