use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use client_core::{config::load_settings, EngineNotice, PassthroughCipher, ReconciliationEngine};
use shared::{
    domain::{ChannelId, ChannelSummary, Message, MessageId, MessageStatus, PubKey, REACTION_TAG, TEXT_TAG},
    protocol::ChannelEvent,
};
use storage::{NewMessageRow, Storage};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the configured database url.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates or renames a channel.
    Channel {
        channel_id: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Writes a message row the way the network layer would.
    Post {
        channel_id: String,
        message_id: String,
        body: String,
        #[arg(long)]
        parent: Option<String>,
        /// Stores the row as a reaction to `--parent`.
        #[arg(long)]
        reaction: bool,
        #[arg(long, default_value = "pk-operator")]
        pubkey: String,
        #[arg(long, default_value_t = 0)]
        codeset: u8,
        #[arg(long)]
        timestamp_ms: Option<i64>,
        #[arg(long, default_value_t = 0)]
        round: u64,
    },
    Pin {
        channel_id: String,
        message_id: String,
        #[arg(long)]
        unpin: bool,
    },
    Hide {
        message_id: String,
        #[arg(long)]
        unhide: bool,
    },
    /// Prints the reconciled timeline of a channel.
    Timeline {
        channel_id: String,
        #[arg(long, default_value_t = 1)]
        pages: usize,
        #[arg(long)]
        json: bool,
    },
    /// Feeds newline-delimited `ChannelEvent` JSON through the engine and
    /// prints the resulting notices.
    Replay { events_file: String },
    /// Runs the event loop and pin refresher, printing notices until ctrl-c.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }
    let storage = Storage::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open {}", settings.database_url))?;

    match cli.command {
        Command::Channel {
            channel_id,
            name,
            description,
        } => {
            storage
                .upsert_channel(&ChannelSummary {
                    channel_id: ChannelId::new(channel_id.clone()),
                    name,
                    description,
                })
                .await?;
            println!("channel_id={channel_id}");
        }
        Command::Post {
            channel_id,
            message_id,
            body,
            parent,
            reaction,
            pubkey,
            codeset,
            timestamp_ms,
            round,
        } => {
            if reaction && parent.is_none() {
                anyhow::bail!("a reaction needs --parent");
            }
            let timestamp = match timestamp_ms {
                Some(ms) => Utc
                    .timestamp_millis_opt(ms)
                    .single()
                    .context("timestamp out of range")?,
                None => Utc::now(),
            };
            let row_id = storage
                .upsert_message_row(&NewMessageRow {
                    message_id: MessageId::new(message_id),
                    channel_id: ChannelId::new(channel_id),
                    parent_message_id: parent.map(MessageId::new),
                    nickname: None,
                    text: PassthroughCipher::encode(&body),
                    type_tag: if reaction { REACTION_TAG } else { TEXT_TAG },
                    status_tag: MessageStatus::Delivered.tag(),
                    timestamp,
                    round,
                    pubkey: PubKey::new(pubkey),
                    codeset,
                    pinned: false,
                    hidden: false,
                })
                .await?;
            println!("row_id={}", row_id.0);
        }
        Command::Pin {
            channel_id,
            message_id,
            unpin,
        } => {
            let row = storage
                .set_pinned(&ChannelId::new(channel_id), &MessageId::new(message_id.clone()), !unpin)
                .await?;
            match row {
                Some(row_id) => println!("row_id={} pinned={}", row_id.0, !unpin),
                None => println!("no row for message_id={message_id}"),
            }
        }
        Command::Hide { message_id, unhide } => {
            let rows = storage
                .set_hidden(&MessageId::new(message_id), !unhide)
                .await?;
            println!("updated {} row(s)", rows.len());
        }
        Command::Timeline {
            channel_id,
            pages,
            json,
        } => {
            let channel_id = ChannelId::new(channel_id);
            let engine = ReconciliationEngine::new(Arc::new(storage), settings);
            engine.load_initial().await?;
            engine.select_channel(&channel_id).await?;
            for _ in 1..pages {
                engine.load_more(&channel_id).await?;
            }

            let timeline = engine.timeline(&channel_id).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&timeline)?);
            } else {
                for message in &timeline {
                    let reactions = engine.reactions(&channel_id, &message.id).await;
                    println!("{}", render(message));
                    for (emoji, reactors) in reactions {
                        println!("        {emoji} x{}", reactors.len());
                    }
                }
            }
            let blocked = engine.blocked_len().await;
            if blocked > 0 {
                warn!(blocked, "messages still waiting for a parent");
            }
        }
        Command::Replay { events_file } => {
            let raw = tokio::fs::read_to_string(&events_file)
                .await
                .with_context(|| format!("failed to read {events_file}"))?;
            let engine = ReconciliationEngine::new(Arc::new(storage), settings);
            engine.load_initial().await?;
            let mut notices = engine.subscribe_notices();

            for (line_no, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let event: ChannelEvent = serde_json::from_str(line)
                    .with_context(|| format!("{events_file}:{}: invalid event", line_no + 1))?;
                if let Err(err) = engine.handle_event(event).await {
                    warn!(line = line_no + 1, "replay: event failed: {err}");
                }
                while let Some(notice) = notices.try_recv() {
                    println!("{}", serde_json::to_string(&notice)?);
                }
            }
        }
        Command::Watch => {
            let engine = ReconciliationEngine::new(Arc::new(storage), settings);
            engine.load_initial().await?;
            let mut notices = engine.subscribe_notices();
            let pins = engine.spawn_pin_refresh();
            let runner = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.run().await })
            };
            info!("watching; ctrl-c to stop");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    notice = notices.recv() => match notice {
                        Ok(notice) => print_notice(&notice)?,
                        Err(err) => {
                            warn!("watch: notice stream ended: {err}");
                            break;
                        }
                    },
                }
            }
            engine.shutdown().await;
            pins.await?;
            runner.await??;
        }
    }

    Ok(())
}

fn render(message: &Message) -> String {
    let reply = message
        .replied_to
        .as_ref()
        .map(|parent| format!(" (re {}: {})", parent.sender.codename, parent.body))
        .unwrap_or_default();
    let name = message
        .nickname
        .clone()
        .unwrap_or_else(|| message.sender.codename.clone());
    let pin = if message.pinned { " [pinned]" } else { "" };
    format!(
        "{} {:<24} {}{}{}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        name,
        message.body,
        reply,
        pin
    )
}

fn print_notice(notice: &EngineNotice) -> Result<()> {
    println!("{}", serde_json::to_string(notice)?);
    Ok(())
}
