use std::collections::HashSet;
use std::io::Write;

use anyhow::{Result, anyhow};
use message_stream::{
    ChannelId, ChannelSession, LiveFeed, MessageId, MessageSubmitter, PageFetcher,
    SessionSnapshot, SessionUpdate, StreamEntry, StreamError, StreamSnapshot,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError};
use crate::config::{FileConfig, ServerConfig, StreamConfig, TeamChatConfig};
use crate::push::PushClient;

pub type ChatSession = ChannelSession<ApiClient, PushClient>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("login required")]
    LoginRequired,

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("session closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// HTTP and push clients built from one configuration.
pub struct Clients {
    pub api: ApiClient,
    pub push: PushClient,
    pub stream: StreamConfig,
}

impl Clients {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ApiError> {
        let server = ServerConfig::from_file(&fc.server, &fc.auth);
        Ok(Self {
            api: ApiClient::new(&server)?,
            push: PushClient::new(&server),
            stream: StreamConfig::from_file(&fc.stream, &fc.auth),
        })
    }

    pub fn session(&self) -> ChatSession {
        ChannelSession::new(
            self.api.clone(),
            self.push.clone(),
            self.stream.session_config(),
        )
    }
}

fn load_clients(config: &TeamChatConfig) -> Result<Clients> {
    let fc = config.load()?;
    Ok(Clients::from_file(&fc)?)
}

fn login_hint(config: &TeamChatConfig) -> anyhow::Error {
    anyhow!(
        "Not logged in, or the session expired. Log in with the web client and put the session \
         cookie in auth.session_cookie in {} (or TEAM_CHAT_AUTH__SESSION_COOKIE).",
        config.config_toml_path().display()
    )
}

fn command_error(config: &TeamChatConfig, err: ChatError) -> anyhow::Error {
    match err {
        ChatError::LoginRequired | ChatError::Stream(StreamError::AuthRequired) => {
            login_hint(config)
        }
        other => other.into(),
    }
}

// ── commands ───────────────────────────────────────────────────────────

pub async fn channels_command(config: &TeamChatConfig, json: bool) -> Result<()> {
    let clients = load_clients(config)?;
    let channels = match clients.api.list_channels().await {
        Ok(channels) => channels,
        Err(ApiError::AuthRequired) => return Err(login_hint(config)),
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&channels)?);
    } else if channels.is_empty() {
        println!("No channels.");
    } else {
        println!("{:<28} {:<28} {}", "ID", "NAME", "MEMBERS");
        println!("{}", "-".repeat(66));
        for channel in &channels {
            println!(
                "{:<28} {:<28} {}",
                channel.id, channel.name, channel.member_count
            );
        }
        println!("\n{} channel(s)", channels.len());
    }
    Ok(())
}

pub async fn history_command(
    config: &TeamChatConfig,
    channel: &str,
    pages: u32,
    json: bool,
) -> Result<()> {
    let clients = load_clients(config)?;
    let mut session = clients.session();
    let result = load_history(&mut session, ChannelId::new(channel), pages).await;
    session.deactivate();
    let snapshot = result.map_err(|e| command_error(config, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    if snapshot.stream.entries.is_empty() {
        println!("No messages in #{}.", snapshot.channel);
    }
    for entry in &snapshot.stream.entries {
        println!("{}", format_entry(entry));
    }
    if snapshot.stream.has_older {
        println!("(older messages available, use --pages to load more)");
    }
    Ok(())
}

pub async fn open_command(config: &TeamChatConfig, channel: &str) -> Result<()> {
    let clients = load_clients(config)?;
    let mut session = clients.session();
    eprintln!(
        "Joined #{channel}. /more loads older messages, /switch <channel> changes channel, \
         /retry reloads after an error, /quit exits."
    );
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    let result = run_interactive(&mut session, ChannelId::new(channel), stdin, &mut stdout).await;
    session.deactivate();
    result.map_err(|e| command_error(config, e))
}

// ── session driving ────────────────────────────────────────────────────

/// Process updates until a history page lands.
pub async fn await_page<A, L>(session: &mut ChannelSession<A, L>) -> Result<SessionUpdate, ChatError>
where
    A: PageFetcher + MessageSubmitter,
    L: LiveFeed,
{
    while let Some(update) = session.next_update().await {
        match update {
            SessionUpdate::InitialLoaded { .. } | SessionUpdate::OlderLoaded { .. } => {
                return Ok(update);
            }
            SessionUpdate::LoadFailed { error } => return Err(error.into()),
            SessionUpdate::LoginRequired => return Err(ChatError::LoginRequired),
            SessionUpdate::CatchUpFailed { error } => {
                warn!(code = error.error_code(), "catch-up after subscribing failed: {}", error);
            }
            other => debug!(?other, "update while waiting for history"),
        }
    }
    Err(ChatError::Closed)
}

/// Activate `channel` and load up to `pages` pages of history, newest first.
pub async fn load_history<A, L>(
    session: &mut ChannelSession<A, L>,
    channel: ChannelId,
    pages: u32,
) -> Result<SessionSnapshot, ChatError>
where
    A: PageFetcher + MessageSubmitter,
    L: LiveFeed,
{
    session.activate(channel);
    await_page(session).await?;
    for _ in 1..pages {
        if !session.load_more() {
            break;
        }
        await_page(session).await?;
    }
    session.snapshot().ok_or(ChatError::Closed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    More,
    Switch(ChannelId),
    Retry,
    Quit,
    Send(String),
}

/// Blank lines yield nothing; unknown slash commands are sent as text.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let command = match trimmed.split_once(char::is_whitespace) {
        Some(("/switch", target)) if !target.trim().is_empty() => {
            Command::Switch(ChannelId::new(target.trim()))
        }
        None if trimmed == "/more" => Command::More,
        None if trimmed == "/retry" => Command::Retry,
        None if trimmed == "/quit" || trimmed == "/exit" => Command::Quit,
        _ => Command::Send(line.to_string()),
    };
    Some(command)
}

pub fn format_entry(entry: &StreamEntry) -> String {
    match entry {
        StreamEntry::Confirmed(message) => format!(
            "[{}] {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.user.name,
            message.text
        ),
        StreamEntry::Pending(pending) => {
            let name = pending.author.as_ref().map_or("you", |a| a.name.as_str());
            format!("[sending...........] {}: {}", name, pending.text)
        }
    }
}

/// Prints each confirmed message once, in the order it becomes visible.
#[derive(Debug, Default)]
pub struct Transcript {
    shown: HashSet<MessageId>,
}

impl Transcript {
    pub fn reset(&mut self) {
        self.shown.clear();
    }

    pub fn render(
        &mut self,
        update: &SessionUpdate,
        stream: Option<&StreamSnapshot>,
        out: &mut impl Write,
    ) -> Result<(), ChatError> {
        match update {
            SessionUpdate::LoginRequired => return Err(ChatError::LoginRequired),
            SessionUpdate::LoadFailed { error } => {
                writeln!(out, "! could not load messages: {error}")?;
                if error.is_retryable() {
                    writeln!(out, "! /retry to try again")?;
                }
            }
            SessionUpdate::CatchUpFailed { error } => {
                writeln!(out, "! could not fetch missed messages: {error}")?;
            }
            SessionUpdate::SendFailed { error, .. } => {
                writeln!(out, "! {error}")?;
            }
            SessionUpdate::LiveFeedDegraded { error, retry_in } => {
                writeln!(
                    out,
                    "! live updates paused ({error}), retrying in {}s",
                    retry_in.as_secs().max(1)
                )?;
            }
            SessionUpdate::LiveFeedConnected => debug!("live feed connected"),
            SessionUpdate::LiveFeedReconnecting { attempt } => {
                debug!(attempt, "live feed reconnecting");
            }
            SessionUpdate::Stale => {}
            SessionUpdate::OlderLoaded { added, .. } => {
                if *added > 0 {
                    writeln!(out, "-- {added} earlier message(s) --")?;
                }
                self.print_new(stream, out)?;
            }
            SessionUpdate::InitialLoaded { .. }
            | SessionUpdate::CaughtUp { .. }
            | SessionUpdate::Live(_)
            | SessionUpdate::SendConfirmed { .. } => self.print_new(stream, out)?,
        }
        Ok(())
    }

    fn print_new(
        &mut self,
        stream: Option<&StreamSnapshot>,
        out: &mut impl Write,
    ) -> Result<(), ChatError> {
        let Some(stream) = stream else {
            return Ok(());
        };
        for entry in &stream.entries {
            if let StreamEntry::Confirmed(message) = entry {
                if self.shown.insert(message.id.clone()) {
                    writeln!(out, "{}", format_entry(entry))?;
                }
            }
        }
        Ok(())
    }
}

/// Read commands from `input` and render session updates to `out` until
/// `/quit` or end of input.
pub async fn run_interactive<A, L, R>(
    session: &mut ChannelSession<A, L>,
    channel: ChannelId,
    input: R,
    out: &mut impl Write,
) -> Result<(), ChatError>
where
    A: PageFetcher + MessageSubmitter,
    L: LiveFeed,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut transcript = Transcript::default();
    writeln!(out, "== #{channel} ==")?;
    session.activate(channel);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    None => {}
                    Some(Command::Quit) => break,
                    Some(Command::More) => {
                        if !session.load_more() {
                            writeln!(out, "! no older messages to load")?;
                        }
                    }
                    Some(Command::Retry) => {
                        if !session.retry() {
                            writeln!(out, "! nothing to retry")?;
                        }
                    }
                    Some(Command::Switch(next)) => {
                        transcript.reset();
                        writeln!(out, "== #{next} ==")?;
                        session.activate(next);
                    }
                    Some(Command::Send(text)) => {
                        if let Err(e) = session.send(&text) {
                            writeln!(out, "! message not sent: {e}")?;
                        }
                    }
                }
            }
            update = session.next_update() => {
                let Some(update) = update else { break };
                let snapshot = session.snapshot();
                let stream = snapshot.as_ref().map(|s| &s.stream);
                transcript.render(&update, stream, out)?;
            }
        }
        out.flush()?;
    }
    Ok(())
}
