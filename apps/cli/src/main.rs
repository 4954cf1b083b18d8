use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use client_core::{
    config::load_settings, ClientEvent, GroupAdminPolicy, MemberPolicy, OutgoingFile,
    ReadOnlyPolicy, SendPolicy, SyncClient,
};
use shared::domain::{Conversation, ConversationId, MessageId, SessionIdentity, User, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Member,
    GroupAdmin,
    ReadOnly,
}

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_base_url` from settings.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    channel_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    token: String,
    /// Conversation to open right after connecting.
    #[arg(long)]
    conversation: Option<String>,
    /// Peer shown as the 1:1 conversation title.
    #[arg(long)]
    peer_name: Option<String>,
    #[arg(long)]
    group: bool,
    #[arg(long, value_enum, default_value = "member")]
    policy: PolicyArg,
}

impl PolicyArg {
    fn into_policy(self) -> Arc<dyn SendPolicy> {
        match self {
            PolicyArg::Member => Arc::new(MemberPolicy),
            PolicyArg::GroupAdmin => Arc::new(GroupAdminPolicy),
            PolicyArg::ReadOnly => Arc::new(ReadOnlyPolicy),
        }
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => println!("* connected"),
        ClientEvent::ConnectionLost => println!("* connection lost"),
        ClientEvent::HistoryLoaded {
            conversation_id,
            messages,
        } => {
            println!("* {} messages in {conversation_id}", messages.len());
            for message in messages {
                println!("  [{}] {}: {}", message.id, message.sender.display_name, message.body);
            }
        }
        ClientEvent::MessageAppended(message) => {
            println!("[{}] {}: {}", message.id, message.sender.display_name, message.body)
        }
        ClientEvent::PlaceholderAdded(message) => println!("* uploading {} ...", message.body),
        ClientEvent::PlaceholderResolved { message, .. } => {
            println!("[{}] {}: {} (uploaded)", message.id, message.sender.display_name, message.body)
        }
        ClientEvent::PlaceholderDropped { .. } => println!("* upload discarded"),
        ClientEvent::MessageRemoved { message_id, .. } => println!("* [{message_id}] deleted"),
        ClientEvent::NotificationAdded(entry) => {
            println!("! {} ({})", entry.text, entry.id())
        }
        ClientEvent::RemoteTypingChanged { is_typing: true, .. } => println!("* typing..."),
        ClientEvent::Error(err) => println!("! {err}"),
        _ => {}
    }
}

async fn send_file(client: &SyncClient, rest: &str) -> Result<()> {
    let mut parts = rest.split_whitespace();
    let path = parts.next().context("usage: /file <path> [mime-type]")?;
    let mime_type = parts.next().unwrap_or("application/octet-stream");
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    client
        .send_file(
            OutgoingFile {
                name,
                mime_type: mime_type.to_string(),
                bytes,
            },
            None,
        )
        .await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(channel_url) = args.channel_url {
        settings.channel_url = Some(channel_url);
    }

    let identity = SessionIdentity {
        id: UserId::new(args.user_id),
        display_name: args.display_name,
        avatar_url: String::new(),
        auth_token: args.token,
    };
    let me = identity.as_user();
    let client = SyncClient::for_session(settings, &identity, args.policy.into_policy())?;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    client.connect_websocket(identity).await?;

    if let Some(conversation_id) = args.conversation {
        let peer = User {
            id: UserId::new("peer"),
            display_name: args.peer_name.unwrap_or_default(),
            email: String::new(),
            avatar_url: String::new(),
        };
        let conversation = Conversation {
            id: ConversationId::new(conversation_id.clone()),
            is_group: args.group,
            display_name: conversation_id,
            members: vec![me.clone(), peer],
            group_admin: args.group.then(|| me.id.clone()),
        };
        if let Err(err) = client.open_conversation(conversation).await {
            warn!("cli: could not load history: {err}");
        }
        if let Some(title) = client.current_title().await {
            println!("== {title} ==");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome: Result<()> = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/file", rest) => send_file(&client, rest).await,
            ("/open", id) => {
                let conversation = Conversation {
                    id: ConversationId::new(id.trim()),
                    is_group: false,
                    display_name: id.trim().to_string(),
                    members: vec![me.clone()],
                    group_admin: None,
                };
                client.open_conversation(conversation).await.map_err(Into::into)
            }
            ("/notifications", _) => {
                for entry in client.notifications().await {
                    let marker = if entry.is_read { " " } else { "*" };
                    println!("{marker} {} {}", entry.id(), entry.text);
                }
                if let Some(badge) = client.badge().await {
                    println!("unread: {badge}");
                }
                Ok(())
            }
            ("/select", id) => client
                .select_notification(&MessageId::new(id.trim()))
                .await
                .map(|_| ())
                .map_err(Into::into),
            ("/clear", _) => client.clear_notifications().await.map_err(Into::into),
            ("/delete", rest) => {
                let mut parts = rest.split_whitespace();
                match parts.next() {
                    Some(id) => client
                        .delete_message(&MessageId::new(id), parts.next() == Some("all"))
                        .await
                        .map_err(Into::into),
                    None => Err(anyhow::anyhow!("usage: /delete <message-id> [all]")),
                }
            }
            _ => match client.keystroke().await {
                Ok(()) => client.send_text(line, None).await.map(|_| ()).map_err(Into::into),
                Err(err) => Err(err.into()),
            },
        };
        if let Err(err) = outcome {
            warn!("cli: {err:#}");
        }
    }

    client.disconnect().await;
    info!("cli: bye");
    Ok(())
}
