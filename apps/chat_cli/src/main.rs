use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use chat_sync::{
    load_settings, ConversationSession, HttpBackend, Message, MessageStatus, ProfileDirectory,
    SessionDependencies, StaticIdentity, SyncEvent, WebSocketPush,
};
use clap::Parser;
use shared::domain::{ConversationId, CorrelationToken, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    conversation_id: i64,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    Retry(CorrelationToken),
    Quit,
    Nothing,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Nothing);
    }
    if line == "/quit" {
        return Ok(Command::Quit);
    }
    if let Some(rest) = line.strip_prefix("/retry") {
        let token = rest
            .trim()
            .parse::<CorrelationToken>()
            .map_err(|err| anyhow!("usage: /retry <token> ({err})"))?;
        return Ok(Command::Retry(token));
    }
    Ok(Command::Send(line.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LineId {
    Local(CorrelationToken),
    Remote(MessageId),
}

fn line_id(message: &Message) -> Option<LineId> {
    message
        .origin
        .map(LineId::Local)
        .or_else(|| message.backend_id().map(LineId::Remote))
}

fn render_line(message: &Message, sender: &str) -> String {
    let time = message.sent_at.format("%H:%M:%S");
    match message.status {
        MessageStatus::Confirmed => format!("[{time}] {sender}: {}", message.body),
        MessageStatus::Provisional => format!("[{time}] {sender}: {} (sending)", message.body),
        MessageStatus::Failed => format!(
            "[{time}] {sender}: {} (failed, /retry {})",
            message.body,
            message.origin.map(|t| t.to_string()).unwrap_or_default()
        ),
    }
}

async fn print_transcript(session: Arc<ConversationSession>, profiles: Arc<ProfileDirectory>) {
    let mut shown: HashMap<LineId, MessageStatus> = HashMap::new();
    let mut revisions = WatchStream::new(session.watch_transcript());
    while revisions.next().await.is_some() {
        let transcript = session.snapshot().await;
        profiles.prefetch(transcript.messages.iter().map(|m| m.sender_id));
        for message in &transcript.messages {
            let Some(id) = line_id(message) else {
                continue;
            };
            if shown.get(&id) == Some(&message.status) {
                continue;
            }
            shown.insert(id, message.status);
            let sender = profiles
                .display_name(message.sender_id)
                .await
                .unwrap_or_else(|| format!("user {}", message.sender_id));
            println!("{}", render_line(message, &sender));
        }
    }
}

async fn report_events(session: Arc<ConversationSession>) {
    let mut events = session.subscribe_events();
    while let Ok(event) = events.recv().await {
        match event {
            SyncEvent::PushStateChanged(state) => info!(?state, "push state changed"),
            SyncEvent::SendFailed { token, reason } => {
                eprintln!("send {token} failed: {reason}");
            }
            SyncEvent::Error(error) => warn!(%error, "sync error"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let backend = Arc::new(HttpBackend::new(settings.server_url.clone())?);
    let profiles = ProfileDirectory::new(backend.clone());
    let deps = SessionDependencies {
        backend,
        push: Arc::new(WebSocketPush::new(settings.server_url.clone())),
        identity: Arc::new(StaticIdentity(UserId(args.user_id))),
    };
    let session =
        ConversationSession::open(&settings, ConversationId(args.conversation_id), deps).await?;
    println!(
        "Joined conversation {} as user {} (type /quit to leave)",
        args.conversation_id, args.user_id
    );

    let printer = tokio::spawn(print_transcript(Arc::clone(&session), profiles));
    let reporter = tokio::spawn(report_events(Arc::clone(&session)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            Ok(Command::Nothing) => {}
            Ok(Command::Quit) => break,
            Ok(Command::Send(body)) => {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    if let Err(err) = session.send(&body).await {
                        if err.token().is_none() {
                            eprintln!("not sent: {err}");
                        }
                    }
                });
            }
            Ok(Command::Retry(token)) => {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    if let Err(err) = session.retry(token).await {
                        if err.token().is_none() {
                            eprintln!("retry rejected: {err}");
                        }
                    }
                });
            }
            Err(err) => eprintln!("{err}"),
        }
    }

    session.close().await;
    printer.abort();
    reporter.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_plain_text() {
        assert_eq!(parse_command("  ").expect("parse"), Command::Nothing);
        assert_eq!(parse_command("/quit").expect("parse"), Command::Quit);
        assert_eq!(
            parse_command(" hello there ").expect("parse"),
            Command::Send("hello there".into())
        );

        let token = CorrelationToken::new();
        assert_eq!(
            parse_command(&format!("/retry {token}")).expect("parse"),
            Command::Retry(token)
        );
        assert!(parse_command("/retry not-a-token").is_err());
    }
}
