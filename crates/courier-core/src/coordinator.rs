use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_db::Database;
use courier_types::{
    DownloadStatus, DownloadableFile, FileInDownload, MessageId, PipelineEvent, TransferPhase,
};

use crate::error::{BeginError, PipelineFault};
use crate::fetcher::{ByteStream, HttpFetcher, NetworkFetcher};
use crate::projection::Projection;
use crate::storage::StagingStorage;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Process-wide single-flight slot. At most one transfer holds it.
#[derive(Debug, Clone, Default)]
enum Gate {
    #[default]
    Free,
    Held(FileInDownload),
}

impl Gate {
    fn occupant(&self) -> Option<MessageId> {
        match self {
            Gate::Free => None,
            Gate::Held(file) => Some(file.message_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Finished { path: PathBuf },
    /// Transfer or storage failure; the message shows ERROR and can be retried.
    Failed { reason: String },
}

/// Handle on a started transfer. Dropping it detaches the task.
pub struct DownloadTicket {
    pub message_id: MessageId,
    handle: JoinHandle<Result<DownloadOutcome, PipelineFault>>,
}

impl DownloadTicket {
    pub async fn outcome(self) -> Result<DownloadOutcome, PipelineFault> {
        self.handle.await?
    }
}

/// Drives remote content from PENDING to local.
///
/// `begin` is synchronous and returns as soon as the gate is taken; the fetch
/// and write run on a spawned task that ends in `finish` or `fail`.
pub struct DownloadCoordinator<F: NetworkFetcher = HttpFetcher> {
    inner: Arc<Inner<F>>,
}

struct Inner<F> {
    fetcher: F,
    storage: StagingStorage,
    db: Arc<Database>,
    projection: Projection,
    gate: Mutex<Gate>,
    events: broadcast::Sender<PipelineEvent>,
}

impl<F: NetworkFetcher> Clone for DownloadCoordinator<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: NetworkFetcher> DownloadCoordinator<F> {
    pub fn new(fetcher: F, storage: StagingStorage, db: Arc<Database>, projection: Projection) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                storage,
                db,
                projection,
                gate: Mutex::new(Gate::Free),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub fn projection(&self) -> &Projection {
        &self.inner.projection
    }

    pub fn storage(&self) -> &StagingStorage {
        &self.inner.storage
    }

    /// The transfer currently holding the gate, if any.
    pub fn in_flight(&self) -> Option<FileInDownload> {
        match &*self.inner.gate.lock() {
            Gate::Free => None,
            Gate::Held(file) => Some(file.clone()),
        }
    }

    /// Start downloading the content referenced by `message_id`.
    ///
    /// Rejected with `Busy` while another transfer holds the gate; nothing is
    /// mutated in that case. Must be called from within a tokio runtime.
    pub fn begin(&self, message_id: MessageId) -> Result<DownloadTicket, BeginError> {
        let mut gate = self.inner.gate.lock();

        if let Some(occupant) = gate.occupant() {
            drop(gate);
            info!(message_id, occupant, "Download rejected: gate busy");
            self.emit(PipelineEvent::DownloadRejected {
                message_id,
                occupant,
            });
            return Err(BeginError::Busy { occupant });
        }

        let file = self.check_contract(message_id).inspect_err(|e| {
            error!(message_id, "begin called in violation of its contract: {}", e);
        })?;

        if !self
            .inner
            .projection
            .transition(message_id, DownloadStatus::Downloading)
        {
            error!(message_id, "Projection refused DOWNLOADING");
            return Err(BeginError::InvalidTransition {
                message_id,
                status: file.status,
            });
        }

        *gate = Gate::Held(FileInDownload {
            message_id,
            file_id: file.id,
            url: file.url.clone(),
            name: file.name.clone(),
            started_at: Utc::now(),
            phase: TransferPhase::Fetching,
        });
        drop(gate);

        info!(message_id, file_id = file.id, url = %file.url, "Download started");
        self.emit(PipelineEvent::DownloadStarted {
            message_id,
            file_id: file.id,
            url: file.url.clone(),
        });

        let coordinator = self.clone();
        let handle = tokio::spawn(async move { coordinator.transfer(message_id, file).await });

        Ok(DownloadTicket { message_id, handle })
    }

    fn check_contract(&self, message_id: MessageId) -> Result<DownloadableFile, BeginError> {
        let projected = self
            .inner
            .projection
            .get(message_id)
            .ok_or(BeginError::UnknownMessage(message_id))?;

        let file = match (projected.message.downloadable_id, projected.downloadable) {
            (Some(_), Some(file)) => file,
            _ => return Err(BeginError::NotDownloadable(message_id)),
        };

        if !file.status.can_begin() {
            return Err(BeginError::InvalidTransition {
                message_id,
                status: file.status,
            });
        }
        Ok(file)
    }

    async fn transfer(&self, message_id: MessageId, file: DownloadableFile) -> Result<DownloadOutcome, PipelineFault> {
        match self.inner.fetcher.fetch(&file.url).await {
            Ok(stream) => self.on_fetch_success(message_id, stream).await,
            Err(e) if e.is_recoverable() => {
                let reason = e.to_string();
                self.fail(message_id, &reason);
                Ok(DownloadOutcome::Failed { reason })
            }
            Err(e) => {
                // Release the gate so the session stays usable, but do not
                // absorb the error.
                error!(message_id, url = %file.url, "Fetch failed unexpectedly: {:?}", e);
                self.fail(message_id, &e.to_string());
                Err(PipelineFault::Fetch(e))
            }
        }
    }

    /// Hand a fetched body to storage, then finish or fail the transfer.
    pub async fn on_fetch_success(
        &self,
        message_id: MessageId,
        stream: ByteStream,
    ) -> Result<DownloadOutcome, PipelineFault> {
        let name = {
            let mut gate = self.inner.gate.lock();
            match &mut *gate {
                Gate::Held(file) if file.message_id == message_id => {
                    file.phase = TransferPhase::Writing;
                    file.name.clone()
                }
                _ => return Err(PipelineFault::NotInFlight(message_id)),
            }
        };

        match self.inner.storage.persist(stream, &name).await {
            Ok(path) => {
                self.finish(message_id, &path).await?;
                Ok(DownloadOutcome::Finished { path })
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail(message_id, &reason);
                Ok(DownloadOutcome::Failed { reason })
            }
        }
    }

    /// Point the message at its local file, release the gate and persist.
    ///
    /// Returns `Ok(false)` when the message was already finished and
    /// `NotInFlight` when it does not hold the gate.
    pub async fn finish(&self, message_id: MessageId, path: &Path) -> Result<bool, PipelineFault> {
        let link = path.to_string_lossy().into_owned();

        if self.inner.gate.lock().occupant() != Some(message_id) {
            let finished = self
                .inner
                .projection
                .get(message_id)
                .is_some_and(|m| m.is_materialized());
            if finished {
                debug!(message_id, "finish ignored: already finished");
                return Ok(false);
            }
            warn!(message_id, "finish refused: not the active download");
            return Err(PipelineFault::NotInFlight(message_id));
        }

        if !self.inner.projection.materialize(message_id, &link) {
            debug!(message_id, "finish ignored: nothing to materialize");
            return Ok(false);
        }
        self.release(message_id);

        let db = Arc::clone(&self.inner.db);
        let persisted = link.clone();
        tokio::task::spawn_blocking(move || {
            let Some(mut message) = db.get_message(message_id)? else {
                anyhow::bail!("message {} no longer exists", message_id);
            };
            message.downloadable_id = None;
            message.media_link = persisted;
            db.insert_message(&message)?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
        .map_err(|e| {
            error!(message_id, "Failed to persist finished download: {}", e);
            PipelineFault::Store(e)
        })?;

        info!(message_id, "Download finished: {}", link);
        self.emit(PipelineEvent::DownloadFinished {
            message_id,
            path: link,
        });
        Ok(true)
    }

    /// Mark the message ERROR and release the gate. Nothing is persisted and
    /// the descriptor is left as it is. Returns whether anything changed.
    pub fn fail(&self, message_id: MessageId, reason: &str) -> bool {
        let marked = self
            .inner
            .projection
            .transition(message_id, DownloadStatus::Error);
        let released = self.release(message_id);

        if !marked && !released {
            debug!(message_id, "fail ignored: not downloading");
            return false;
        }

        warn!(message_id, "Download failed: {}", reason);
        self.emit(PipelineEvent::DownloadFailed {
            message_id,
            reason: reason.to_string(),
        });
        true
    }

    /// Free the gate if `message_id` holds it.
    fn release(&self, message_id: MessageId) -> bool {
        let mut gate = self.inner.gate.lock();
        if gate.occupant() != Some(message_id) {
            return false;
        }
        *gate = Gate::Free;
        true
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
