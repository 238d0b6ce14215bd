use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings_from, ClientError, ClientEvent, ClientHandle, RealtimeClient,
};
use shared::domain::{ConversationId, LocalId, TransportKind, UserId};
use storage::SqliteCache;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "client.toml")]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    /// `socket` or `push_stream`
    #[arg(long)]
    transport: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
    /// Conversation to open after login.
    #[arg(long, conflicts_with = "peer")]
    conversation: Option<i64>,
    /// Open (or create) the direct conversation with this user.
    #[arg(long)]
    peer: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config);
    if let Some(server_url) = &args.server_url {
        settings.apply("server_url", server_url);
    }
    if let Some(transport) = &args.transport {
        settings.transport = TransportKind::parse(transport)
            .with_context(|| format!("unknown transport '{transport}'"))?;
    }

    let cache = SqliteCache::new(&settings.cache_url)
        .await
        .with_context(|| format!("failed to open cache at {}", settings.cache_url))?;
    let client = RealtimeClient::new(settings, Arc::new(cache));
    let events = client.subscribe_events();

    let user = client.login(&args.username, &args.password).await?;
    println!("Logged in as {} (id={})", user.username, user.id);

    let conversation_id = match (args.conversation, args.peer) {
        (Some(id), _) => Some(ConversationId(id)),
        (None, Some(peer)) => Some(client.open_conversation_with(UserId(peer)).await?.id),
        (None, None) => None,
    };
    if let Some(conversation_id) = conversation_id {
        for message in client.select_conversation(conversation_id).await? {
            println!("[{}] {}: {}", message.status.as_str(), message.sender_id, message.content);
        }
    } else {
        for conversation in client.load_conversations().await? {
            println!(
                "conversation {} with {} ({} unread)",
                conversation.id, conversation.participant.username, conversation.unread_count
            );
        }
    }

    client.connect().await?;

    tokio::spawn(print_events(events, |line| println!("{line}")));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(raw) = line.strip_prefix("/retry ") {
            match raw.trim().parse::<i64>() {
                Ok(id) => report(client.retry(LocalId(id)).await),
                Err(_) => println!("usage: /retry <local id>"),
            }
            continue;
        }
        match client.active_conversation() {
            Some(conversation_id) => report(client.submit_text(conversation_id, line).await),
            None => println!("no conversation selected; restart with --conversation or --peer"),
        }
    }

    info!("shutting down");
    client.shutdown().await;
    Ok(())
}

/// Prints client events until the client shuts down. A lagging receiver
/// reports the skipped count and keeps going.
async fn print_events(
    mut events: broadcast::Receiver<ClientEvent>,
    mut out: impl FnMut(String),
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = describe(event) {
                    out(line);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
                out(format!("* {skipped} events skipped"));
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn describe(event: ClientEvent) -> Option<String> {
    let line = match event {
        ClientEvent::ConnectivityChanged { connected } => {
            format!("* {}", if connected { "online" } else { "offline" })
        }
        ClientEvent::MessageReceived { message } => format!(
            "[{}] {}: {}",
            message.status.as_str(),
            message.sender_id,
            message.content
        ),
        ClientEvent::MessageDeleted { .. } => return None,
        ClientEvent::MessageFailed { local_id, reason } => {
            format!("! message {local_id} failed: {reason} (/retry {local_id})")
        }
        ClientEvent::AuthenticationRejected { reason } => {
            format!("! credential rejected: {reason}")
        }
        ClientEvent::PresenceChanged { user_id, status } => {
            format!("* user {user_id} is {status:?}")
        }
        ClientEvent::Error(message) => format!("! {message}"),
    };
    Some(line)
}

fn report<T>(result: Result<T, ClientError>) {
    let Err(err) = result else {
        return;
    };
    error!(error = %err, "request failed");
    if err.is_unauthorized() {
        println!("! session rejected; log in again");
    } else if let Some(exception) = err.api_exception() {
        println!("! server refused: {}", exception.message);
    }
}
