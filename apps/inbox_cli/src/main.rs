use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use client_core::{
    settings::{load_settings, load_settings_from},
    ChatSession, ClientSettings, ConversationCache, Listener, SessionDeps,
};
use shared::domain::{Identity, InboundMessage, Recipient, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// User id whose inbox is subscribed.
    #[arg(long)]
    identity: String,
    #[arg(long, default_value = "")]
    token: String,
    /// TOML settings file; defaults to `INBOX_CONFIG` or `inbox.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print inbound messages until interrupted.
    Listen,
    /// Print inbound messages and send every stdin line to one recipient.
    Chat {
        #[arg(long)]
        to_id: i64,
        #[arg(long, default_value = "")]
        to_name: String,
    },
    /// Fetch the conversation list once and print it.
    Conversations,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let settings = settings_for(&cli)?;
    let identity = Identity::parse(&cli.identity)
        .ok_or_else(|| anyhow!("--identity must not be blank"))?;
    let deps = SessionDeps::from_settings(&settings)?;
    let mut session = ChatSession::connect(&settings, deps, Some(identity), &cli.token, None)?;

    match cli.command {
        Command::Conversations => {
            let outcome = session.resync().await;
            info!(?outcome, "inbox: conversation fetch finished");
            print_conversations(&session.conversations().borrow());
        }
        Command::Listen => {
            let _printer = session.scoped_listener(printer());
            tokio::spawn(log_state_changes(&session));
            tokio::signal::ctrl_c().await?;
        }
        Command::Chat { to_id, to_name } => {
            let _printer = session.scoped_listener(printer());
            tokio::spawn(log_state_changes(&session));
            let receiver = Recipient {
                id: UserId(to_id),
                name: to_name,
                avatar: String::new(),
            };
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Some(line) = line? else { break };
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if !session.send_to(receiver.clone(), line) {
                            eprintln!("not connected; message dropped");
                        }
                    }
                    signal = tokio::signal::ctrl_c() => {
                        signal?;
                        break;
                    }
                }
            }
        }
    }

    session.close();
    Ok(())
}

fn settings_for(cli: &Cli) -> Result<ClientSettings> {
    let mut settings = match &cli.config {
        Some(path) => load_settings_from(Some(path.as_path()), |key| std::env::var(key).ok())?,
        None => load_settings()?,
    };
    if let Some(base_url) = &cli.base_url {
        settings.base_url = base_url.clone();
    }
    Ok(settings)
}

fn printer() -> Listener {
    Arc::new(|message: &InboundMessage| {
        println!(
            "[{}] {} ({}): {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.sender.name,
            message.sender.id,
            message.content
        );
    })
}

fn log_state_changes(session: &ChatSession) -> impl std::future::Future<Output = ()> + 'static {
    let mut states = WatchStream::new(session.watch_state());
    let mut caches = WatchStream::new(session.conversations());
    async move {
        loop {
            tokio::select! {
                Some(state) = states.next() => info!(?state, "inbox: connection state"),
                Some(cache) = caches.next() => info!(
                    conversations = cache.conversations.len(),
                    unread = cache.unread,
                    "inbox: conversations updated"
                ),
                else => break,
            }
        }
    }
}

fn print_conversations(cache: &ConversationCache) {
    println!("{} unread", cache.unread);
    for summary in &cache.conversations {
        println!(
            "{:>4}  {} ({}): {}",
            summary.unread,
            summary.peer.name,
            summary.peer.id,
            summary.last_message.as_deref().unwrap_or("")
        );
    }
}
