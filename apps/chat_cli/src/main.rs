use std::{collections::HashSet, path::Path, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use client_core::{ChatClient, ClientEvent, FileUpload, TimelineEntry};
use shared::domain::{ConversationId, DeleteScope, Identity, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "member")]
    role: String,
    /// Conversation to open once connected.
    #[arg(long)]
    conversation: Option<i64>,
}

const HELP: &str = "commands: /list  /open <id>  /read <id>  /older  /online  /delete <id> me|all  /file <path> [mime]  /quit
anything else is sent to the open conversation";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let identity = Identity {
        user_id: UserId(args.user_id),
        display_name: args.name,
        role: args.role,
    };
    let (client, transport_events) = ChatClient::connect(&args.server_url, identity)?;

    let runner = Arc::clone(&client);
    tokio::spawn(async move { runner.run(transport_events).await });
    tokio::spawn(print_events(Arc::clone(&client)));

    if let Some(conversation_id) = args.conversation {
        client
            .select_conversation(ConversationId(conversation_id))
            .await?;
    }

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = handle_line(&client, line).await {
            println!("! {err:#}");
        }
    }
    Ok(())
}

async fn handle_line(client: &ChatClient, line: &str) -> Result<()> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("/list") => {
            for summary in client.conversations().await {
                let title = summary.name.clone().unwrap_or_else(|| {
                    summary
                        .participants
                        .iter()
                        .map(|participant| participant.display_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                });
                println!(
                    "#{} {} [{}] {}",
                    summary.conversation_id,
                    title,
                    summary.unread_count,
                    summary.last_message_preview.unwrap_or_default()
                );
            }
        }
        Some("/open") => {
            let conversation_id = ConversationId(parse_id(parts.next())?);
            client.select_conversation(conversation_id).await?;
        }
        Some("/read") => {
            let conversation_id = ConversationId(parse_id(parts.next())?);
            client.mark_all_read(conversation_id).await?;
        }
        Some("/older") => {
            let added = client.load_older().await?;
            println!("loaded {added} older messages");
        }
        Some("/online") => {
            let online: Vec<String> = client
                .online_users()
                .await
                .into_iter()
                .map(|user_id| user_id.to_string())
                .collect();
            println!("online: {}", online.join(", "));
        }
        Some("/delete") => {
            let message_id = MessageId(parse_id(parts.next())?);
            let scope = match parts.next() {
                Some("me") => DeleteScope::Me,
                Some("all") => DeleteScope::All,
                _ => bail!("usage: /delete <id> me|all"),
            };
            client.delete_message(message_id, scope).await?;
        }
        Some("/file") => {
            let conversation_id = active(client).await?;
            let path = parts.next().ok_or_else(|| anyhow!("usage: /file <path> [mime]"))?;
            let mime_type = parts
                .next()
                .unwrap_or("application/octet-stream")
                .to_string();
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {path}"))?;
            let file_name = Path::new(path)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("upload")
                .to_string();
            client
                .send_attachments(
                    conversation_id,
                    vec![FileUpload {
                        file_name,
                        mime_type,
                        bytes,
                    }],
                )
                .await?;
        }
        Some(command) if command.starts_with('/') => println!("{HELP}"),
        _ => {
            let conversation_id = active(client).await?;
            client.keystroke(conversation_id).await;
            client.send_text(conversation_id, line).await?;
        }
    }
    Ok(())
}

async fn active(client: &ChatClient) -> Result<ConversationId> {
    client
        .active_conversation()
        .await
        .ok_or_else(|| anyhow!("no conversation open, use /open <id>"))
}

fn parse_id(raw: Option<&str>) -> Result<i64> {
    let raw = raw.ok_or_else(|| anyhow!("missing id"))?;
    raw.parse().with_context(|| format!("invalid id: {raw}"))
}

fn render(entry: &TimelineEntry) -> String {
    let sender = entry
        .sender_name
        .clone()
        .unwrap_or_else(|| entry.sender_id.to_string());
    let body = if entry.body.content().is_empty() {
        entry.body.preview()
    } else {
        entry.body.content().to_string()
    };
    format!("[{}] {sender}: {body}", entry.id)
}

async fn print_events(client: Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    let mut shown: HashSet<(MessageId, bool)> = HashSet::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "chat: event printer lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ClientEvent::TimelineUpdated { .. } => {
                for entry in client.timeline().await {
                    let Some(message_id) = entry.server_id() else {
                        continue;
                    };
                    if shown.insert((message_id, entry.body.is_deleted())) {
                        println!("{}", render(&entry));
                    }
                }
            }
            ClientEvent::UnreadChanged {
                conversation_id,
                unread,
                total,
            } if unread > 0 => {
                println!("* #{conversation_id} has {unread} unread ({total} total)");
            }
            ClientEvent::TypingChanged {
                conversation_id,
                label: Some(label),
            } => {
                if client.active_conversation().await == Some(conversation_id) {
                    println!("* {label}");
                }
            }
            ClientEvent::ConnectionChanged { connected } => {
                println!("* {}", if connected { "connected" } else { "reconnecting…" });
            }
            ClientEvent::SendFailed { temp_id, reason, .. } => {
                println!("! {temp_id} not sent: {reason}");
            }
            ClientEvent::Error(message) => println!("! {message}"),
            _ => {}
        }
    }
}
