//! # pawchat
//!
//! Terminal chat client. Joins one conversation, sends every stdin line as a
//! message and prints what arrives.
//!
//! ```text
//! pawchat <conversation-id>
//! ```
//!
//! Lines starting with `/` are commands: `/status`, `/read <message-id>`,
//! `/typing`, `/refresh`, `/quit`.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use pawchat_client::{init_tracing, ChatClient, ClientConfig, SendOutcome};
use pawchat_net::listener;
use pawchat_shared::constants::APP_NAME;
use pawchat_shared::{ConnectionStatus, ConversationId, FrameKind, MessageDraft, MessageId, ServerFrame};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let conversation_id = std::env::args()
        .nth(1)
        .map(ConversationId::new)
        .context("usage: pawchat <conversation-id>")?;

    let config = ClientConfig::from_env();
    info!(
        host = %config.host,
        secure = config.secure,
        fallback = config.api_url.is_some(),
        user = %config.user_id,
        "Starting {} terminal client v{}",
        APP_NAME,
        env!("CARGO_PKG_VERSION")
    );
    let user_id = config.user_id.clone();

    let client = ChatClient::from_config(config).context("Failed to start chat client")?;

    client.on_connection_change(listener(|status: &ConnectionStatus| {
        println!("* connection: {:?}", status.state);
        Ok(())
    }));
    client.on_message(
        FrameKind::NewMessage,
        listener(move |frame: &ServerFrame| {
            if let ServerFrame::NewMessage { message } = frame {
                if message.sender_id != user_id {
                    println!("[{}] {}: {}", message.id, message.sender_id, message.body);
                }
            }
            Ok(())
        }),
    );
    client.on_message(
        FrameKind::Typing,
        listener(|frame: &ServerFrame| {
            if let ServerFrame::Typing { user_id, is_typing: true } = frame {
                println!("* {user_id} is typing...");
            }
            Ok(())
        }),
    );

    let mut dropped = client.dropped_messages();
    tokio::spawn(async move {
        while let Ok(notice) = dropped.recv().await {
            println!("! gave up on \"{}\": {}", notice.message.payload.body, notice.error());
        }
    });

    if let Err(e) = client.open_conversation(conversation_id.clone()).await {
        warn!(error = %e, "Initial connection failed, retrying in the background");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/status", _) => {
                let offline = client.get_offline_status();
                println!(
                    "* {:?}, {} queued, last sync {}",
                    client.connection_status().state,
                    offline.queued_messages,
                    offline
                        .last_sync_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".into())
                );
            }
            ("/read", id) if !id.is_empty() => client.mark_read(&MessageId::new(id)).await,
            ("/typing", _) => client.send_typing(true),
            ("/refresh", _) => match client.refresh_conversation(&conversation_id).await {
                Ok(snapshot) => {
                    for message in &snapshot.messages {
                        println!("[{}] {}: {}", message.id, message.sender_id, message.body);
                    }
                }
                Err(e) => println!("! refresh failed: {e}"),
            },
            _ => {
                let draft = MessageDraft::text(conversation_id.clone(), line);
                match client.send_message(draft).await {
                    Ok(SendOutcome::Queued { .. }) => println!("* offline, message queued"),
                    Ok(_) => {}
                    Err(e) => println!("! not sent: {e}"),
                }
            }
        }
    }

    client.close_conversation();
    info!("Bye");
    Ok(())
}
