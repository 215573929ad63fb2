use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, Composer, Identity, OutgoingAttachment, ProgressFn, SelectOutcome,
    SyncCoordinator, SyncEvent,
};
use shared::{
    domain::{ChatRoomId, Role},
    protocol::MessagePayload,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `server_url` from the config file and `CHAT__SERVER_URL`.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "client")]
    role: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List project rooms and the chat rooms visible to this user.
    Rooms,
    /// Follow a chat room until Ctrl-C.
    Tail { chat_room_id: String },
    Send {
        chat_room_id: String,
        #[arg(default_value = "")]
        text: String,
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    let role: Role = cli.role.parse().map_err(|err: String| anyhow!(err))?;
    let identity = Identity::new(cli.user_id, role, cli.token);
    let sync = SyncCoordinator::new(settings, identity).context("failed to build client")?;

    let result = match cli.command {
        Command::Rooms => list_rooms(&sync).await,
        Command::Tail { chat_room_id } => tail(&sync, ChatRoomId::new(chat_room_id)).await,
        Command::Send {
            chat_room_id,
            text,
            attachments,
        } => send(&sync, ChatRoomId::new(chat_room_id), text, attachments).await,
    };
    sync.shutdown().await;
    result
}

async fn list_rooms(sync: &SyncCoordinator) -> Result<()> {
    let projects = sync.refresh_directory().await?;
    if projects.is_empty() {
        println!("no project rooms");
    }
    for project in projects {
        println!("{}  {}", project.id, project.project_title);
        let rooms = sync.directory().list_chat_rooms(&project.id).await?;
        for room in rooms {
            let last = room
                .last_message
                .as_ref()
                .map(|summary| summary.content.as_str())
                .unwrap_or("");
            println!("  {}  {:?}  {}", room.id, room.kind, last);
        }
    }
    Ok(())
}

async fn tail(sync: &Arc<SyncCoordinator>, chat_room_id: ChatRoomId) -> Result<()> {
    let mut events = sync.subscribe();
    sync.start().await?;
    report_selection(sync.select_chat_room(&chat_room_id).await?);
    for message in sync.messages().await {
        print_message(sync, &message);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::MessageAppended { message, .. }) => print_message(sync, &message),
                Ok(SyncEvent::HistoryMerged { added, .. }) => {
                    println!("-- {added} missed message(s) recovered");
                    for message in sync.messages().await.iter().rev().take(added).rev() {
                        print_message(sync, message);
                    }
                }
                Ok(SyncEvent::Reconnecting { attempt, delay }) => {
                    eprintln!("-- reconnecting (attempt {attempt}, retry in {delay:?})");
                }
                Ok(SyncEvent::OutageExceeded { down_for }) => {
                    eprintln!("-- connection down for {down_for:?}");
                }
                Ok(SyncEvent::Error { message, .. }) => eprintln!("-- {message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "probe: dropped events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn send(
    sync: &Arc<SyncCoordinator>,
    chat_room_id: ChatRoomId,
    text: String,
    paths: Vec<PathBuf>,
) -> Result<()> {
    let mut composer = Composer::new(text);
    for path in paths {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read attachment '{}'", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("attachment path '{}' has no file name", path.display()))?;
        let attachment = OutgoingAttachment::new(filename, bytes);
        eprintln!(
            "attaching {} ({} bytes, {})",
            attachment.filename,
            attachment.size(),
            attachment
                .mime_type
                .as_deref()
                .unwrap_or("application/octet-stream")
        );
        composer.attach(attachment);
    }

    sync.start().await?;
    report_selection(sync.select_chat_room(&chat_room_id).await?);
    let progress: ProgressFn = Arc::new(|percent| eprintln!("upload {percent}%"));
    match sync.submit(&mut composer, Some(progress)).await {
        Ok(created) => {
            println!("sent {}", created.id);
            Ok(())
        }
        Err(err) => Err(anyhow!(composer.last_error.unwrap_or_else(|| err.to_string()))),
    }
}

fn report_selection(outcome: SelectOutcome) {
    match outcome {
        SelectOutcome::Degraded(err) => eprintln!("-- history unavailable: {err}"),
        SelectOutcome::Ready | SelectOutcome::Loading | SelectOutcome::Stale => {}
    }
}

fn print_message(sync: &SyncCoordinator, message: &MessagePayload) {
    let who = if message.sender.name.is_empty() {
        message.sender.id.as_str()
    } else {
        message.sender.name.as_str()
    };
    let files = message
        .attachments
        .iter()
        .map(|attachment| match sync.attachment_url(attachment) {
            Some(url) => format!(" [{} {url}]", attachment.filename),
            None => format!(" [{} uploading]", attachment.filename),
        })
        .collect::<String>();
    println!(
        "{}  {who}: {}{files}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.content
    );
}
