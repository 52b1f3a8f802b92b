mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use reqwest::Url;
use tracing::{info, warn};

use courier_core::{
    ChatSession, DownloadCoordinator, DownloadOutcome, FileMaterializer, HttpFetcher, LocalHost,
    Projection, StagingStorage,
};
use courier_db::Database;
use courier_types::{Chat, ChatId, DownloadableFile, MessageId, ProjectedMessage, format_file_size};

use crate::config::Config;

/// Chat media delivery: fetch remote message content, stage it locally and
/// hand it to the host.
#[derive(Parser, Debug)]
#[command(name = "courier", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a chat.
    NewChat {
        #[arg(long)]
        owner: String,
        /// Name of the profile picture owner.
        #[arg(long, default_value = "")]
        profile_pic: String,
    },

    /// List chats with their most recent message.
    Chats,

    /// Show the messages of a chat.
    Messages {
        chat: ChatId,
        /// Print the projected messages as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Send a message as the local user.
    Send {
        chat: ChatId,
        #[arg(default_value = "")]
        text: String,
        /// Local file to attach.
        #[arg(long)]
        media: Option<PathBuf>,
    },

    /// Register an incoming message whose content is still remote.
    Receive {
        chat: ChatId,
        #[arg(long)]
        url: String,
        /// File name in staging. Defaults to the last URL segment.
        #[arg(long)]
        name: Option<String>,
        /// Size in bytes. Probed from the server when omitted.
        #[arg(long)]
        size: Option<u64>,
        #[arg(long, default_value = "")]
        text: String,
    },

    /// Download a message's remote content into staging.
    Download { chat: ChatId, message: MessageId },

    /// Open a message's local file in the host viewer.
    Open { chat: ChatId, message: MessageId },

    /// Share a message's local file through the host.
    Share { chat: ChatId, message: MessageId },

    /// Move a message's local file to a destination path.
    Save {
        chat: ChatId,
        message: MessageId,
        destination: PathBuf,
    },

    /// List file descriptors no message refers to any more.
    Orphans,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info,courier_core=info,courier_db=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db = Arc::new(Database::open(&config.db_path)?);

    match cli.command {
        Command::NewChat { owner, profile_pic } => {
            let id = db.insert_chat(&Chat {
                id: 0,
                owner,
                profile_pic_owner: profile_pic,
            })?;
            println!("{}", id);
        }

        Command::Chats => {
            for summary in db.list_chat_summaries()? {
                let last = summary.last_message.unwrap_or_default();
                let date = summary
                    .last_message_date
                    .map(|d| d.format("%d/%m/%Y %H:%M").to_string())
                    .unwrap_or_default();
                println!("{:>4}  {:<20} {:<16} {}", summary.chat.id, summary.chat.owner, date, last);
            }
        }

        Command::Messages { chat, json } => {
            let session = open_session(&config, &db, chat).await?;
            let messages = session.messages();
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                for message in &messages {
                    println!("{}", describe(message));
                }
            }
        }

        Command::Send { chat, text, media } => {
            let session = open_session(&config, &db, chat).await?;
            match session.send_message(&text, media.as_deref()).await? {
                Some(id) => println!("{}", id),
                None => bail!("nothing to send: give a text or --media"),
            }
        }

        Command::Receive {
            chat,
            url,
            name,
            size,
            text,
        } => {
            db.get_chat(chat)?.with_context(|| format!("chat {} not found", chat))?;
            let name = match name {
                Some(name) => name,
                None => file_name_from_url(&url)
                    .with_context(|| format!("cannot derive a file name from {}", url))?,
            };
            let size = match size {
                Some(size) => size,
                None => probe(&url).await,
            };

            let (message_id, file_id) =
                db.insert_remote_message(chat, &text, &DownloadableFile::new(name, url, size))?;
            info!(message_id, file_id, "Registered remote content");
            println!("{}", message_id);
        }

        Command::Download { chat, message } => {
            let session = open_session(&config, &db, chat).await?;
            match session.request_download(message)?.outcome().await? {
                DownloadOutcome::Finished { path } => println!("{}", path.display()),
                DownloadOutcome::Failed { reason } => bail!("download failed: {}", reason),
            }
        }

        Command::Open { chat, message } => {
            let session = open_session(&config, &db, chat).await?;
            println!("{}", session.request_open(message)?);
        }

        Command::Share { chat, message } => {
            let session = open_session(&config, &db, chat).await?;
            println!("{}", session.request_share(message)?);
        }

        Command::Save {
            chat,
            message,
            destination,
        } => {
            let session = open_session(&config, &db, chat).await?;
            let handle = session
                .materializer()
                .host()
                .register_destination(&destination);
            let bytes = session.request_save(message, &handle).await?;
            println!("{} ({})", destination.display(), format_file_size(bytes));
        }

        Command::Orphans => {
            for file in db.orphaned_downloadable_files()? {
                println!(
                    "{:>4}  {:<24} {:>10}  {}",
                    file.id,
                    file.name,
                    format_file_size(file.size),
                    file.url
                );
            }
        }
    }

    Ok(())
}

async fn open_session(config: &Config, db: &Arc<Database>, chat_id: ChatId) -> anyhow::Result<ChatSession> {
    let storage = StagingStorage::new(&config.staging_dir).await?;
    let coordinator = DownloadCoordinator::new(HttpFetcher::new(), storage, Arc::clone(db), Projection::new());
    let host = Arc::new(LocalHost::new(
        config.capability_authority.clone(),
        config.capability_ttl,
    ));
    let session = ChatSession::open(chat_id, Arc::clone(db), coordinator, FileMaterializer::new(host)).await?;
    Ok(session)
}

/// Best-effort size lookup; unknown sizes are stored as 0.
async fn probe(url: &str) -> u64 {
    match HttpFetcher::new().probe_size(url).await {
        Ok(Some(size)) => size,
        Ok(None) => {
            warn!(url, "Server did not report a size");
            0
        }
        Err(e) => {
            warn!(url, "Size probe failed: {}", e);
            0
        }
    }
}

/// Last path segment of `url`, percent-decoded.
fn file_name_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let segment = url.path_segments()?.next_back().filter(|s| !s.is_empty())?;
    Some(urlencoding::decode(segment).ok()?.into_owned())
}

fn describe(projected: &ProjectedMessage) -> String {
    let message = &projected.message;
    let mut line = format!(
        "{:>4} {} [{}] {}",
        message.id,
        message.date.format("%H:%M"),
        message.author,
        message.content
    );
    if let Some(file) = &projected.downloadable {
        line.push_str(&format!(
            "  <{} {} {}>",
            file.name,
            format_file_size(file.size),
            file.status
        ));
    } else if message.has_media() {
        line.push_str(&format!("  -> {}", message.media_link));
    }
    line
}
