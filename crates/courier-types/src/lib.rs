pub mod events;
pub mod models;
pub mod size;

pub use events::PipelineEvent;
pub use models::{
    Author, Chat, ChatId, ChatSummary, DownloadStatus, DownloadableFile, FileId, FileInDownload,
    Message, MessageId, ProjectedMessage, TransferPhase,
};
pub use size::format_file_size;
