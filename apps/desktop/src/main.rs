use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    config::normalize_database_url, load_settings, spawn_session, OutgoingMessage, RosterFilter,
    SessionHandle, SessionState, SlotPhase, SqliteRemoteStore,
};
use shared::{
    domain::{ConversationId, DisplayType, MessageId, UserId},
    protocol::{Patch, USERS},
    records::{fields, Attachment},
};
use tokio::sync::watch;
use tracing::{info, warn};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the configured database url.
    #[arg(long)]
    database_url: Option<String>,
    /// User id to sign in as.
    #[arg(long, global = true)]
    identity: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    SeedProfile {
        user_id: String,
        display_name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        photo_url: Option<String>,
    },
    Chats {
        #[arg(long, value_enum, default_value_t = Filter::All)]
        filter: Filter,
    },
    Open {
        conversation_id: String,
    },
    Send {
        conversation_id: String,
        text: String,
        #[arg(long)]
        image_url: Option<String>,
    },
    Start {
        other_user_id: String,
    },
    Favourite {
        conversation_id: String,
    },
    Delete {
        conversation_id: String,
        #[arg(required = true)]
        message_ids: Vec<String>,
    },
    Contacts {
        #[arg(default_value = "")]
        needle: String,
    },
    Watch {
        conversation_id: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Filter {
    All,
    Unread,
    Favourites,
    Groups,
}

impl From<Filter> for RosterFilter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::All => RosterFilter::All,
            Filter::Unread => RosterFilter::Unread,
            Filter::Favourites => RosterFilter::Favourites,
            Filter::Groups => RosterFilter::Groups,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(database_url) = &cli.database_url {
        settings.database_url = database_url.clone();
    }
    let database_url = normalize_database_url(&settings.database_url);
    let store = Arc::new(
        SqliteRemoteStore::open(&database_url)
            .await
            .with_context(|| format!("failed to open document store at '{database_url}'"))?,
    );

    if let Command::SeedProfile {
        user_id,
        display_name,
        email,
        photo_url,
    } = &cli.command
    {
        let mut profile = Patch::new().set(fields::DISPLAY_NAME, display_name.as_str());
        if let Some(email) = email {
            profile = profile.set(fields::EMAIL, email.as_str());
        }
        if let Some(photo_url) = photo_url {
            profile = profile.set(fields::PHOTO_URL, photo_url.as_str());
        }
        store
            .storage()
            .put_document(USERS, user_id, &profile.set(fields::IS_ONLINE, false))
            .await?;
        println!("seeded profile user_id={user_id}");
        return Ok(());
    }

    let identity = cli
        .identity
        .clone()
        .ok_or_else(|| anyhow!("--identity is required for this command"))?;
    let (_identity_tx, identity_rx) = watch::channel(Some(UserId::new(identity)));
    let session = spawn_session(store.clone(), identity_rx, settings);
    let result = run(&session, cli.command).await;

    if let Err(error) = session.shutdown().await {
        warn!(%error, "session did not shut down cleanly");
    }
    result
}

async fn run(session: &SessionHandle, command: Command) -> Result<()> {
    match command {
        Command::SeedProfile { .. } => {}
        Command::Chats { filter } => {
            wait_for(session, |state| !state.roster_loading).await?;
            wait_for_profiles(session).await;
            let state = session.state();
            for entry in state.filtered_roster(filter.into()) {
                println!(
                    "{}\t{}\t{}\tunread={}{}\t{}",
                    entry.id(),
                    entry.display_name,
                    entry.relative_time,
                    entry.conversation.unread_count,
                    if entry.conversation.is_favourite { "\t*" } else { "" },
                    entry.conversation.last_message_text,
                );
            }
        }
        Command::Open { conversation_id } => {
            let state = open(session, conversation_id).await?;
            for view in &state.messages {
                print_message(view.display_type, &view.record);
            }
        }
        Command::Send {
            conversation_id,
            text,
            image_url,
        } => {
            open(session, conversation_id).await?;
            let mut message = OutgoingMessage::text(text);
            if let Some(url) = image_url {
                message = message.with_attachment(Attachment::Image { url });
            }
            let id = session.send(message).await?;
            println!("sent message_id={id}");
        }
        Command::Start { other_user_id } => {
            wait_for(session, |state| !state.roster_loading).await?;
            let id = session
                .create_conversation(UserId::new(other_user_id))
                .await?;
            println!("conversation_id={id}");
        }
        Command::Favourite { conversation_id } => {
            let id = ConversationId::new(conversation_id);
            wait_for(session, |state| state.roster_entry(&id).is_some()).await?;
            let favourite = session.toggle_favourite(id.clone()).await?;
            println!("conversation_id={id} favourite={favourite}");
        }
        Command::Delete {
            conversation_id,
            message_ids,
        } => {
            open(session, conversation_id).await?;
            let ids: Vec<MessageId> = message_ids.into_iter().map(MessageId::new).collect();
            let count = ids.len();
            session.delete_messages(ids).await?;
            println!("deleted {count} message(s)");
        }
        Command::Contacts { needle } => {
            for profile in session.search_contacts(needle).await? {
                println!(
                    "{}\t{}\t{}",
                    profile.id,
                    profile.best_name().unwrap_or_default(),
                    if profile.is_online { "online" } else { "offline" }
                );
            }
        }
        Command::Watch { conversation_id } => {
            if let Some(conversation_id) = conversation_id {
                open(session, conversation_id).await?;
            }
            let mut events = session.subscribe_events();
            info!("watching session events; press ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => println!("{event:?}"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}

async fn open(session: &SessionHandle, conversation_id: String) -> Result<SessionState> {
    session
        .select_conversation(Some(ConversationId::new(conversation_id)))
        .await?;
    wait_for(session, |state| state.subscriptions.messages == SlotPhase::Live).await
}

async fn wait_for(
    session: &SessionHandle,
    ready: impl FnMut(&SessionState) -> bool,
) -> Result<SessionState> {
    let mut state = session.watch_state();
    let snapshot = tokio::time::timeout(WAIT_TIMEOUT, state.wait_for(ready))
        .await
        .context("timed out waiting for session state")?
        .context("session stopped")?
        .clone();
    Ok(snapshot)
}

/// Profile reads complete shortly after the roster; give them a moment.
async fn wait_for_profiles(session: &SessionHandle) {
    let resolved = |state: &SessionState| {
        state
            .roster
            .iter()
            .all(|entry| entry.display_name != client_core::roster::UNKNOWN_USER)
    };
    if wait_for(session, resolved).await.is_err() {
        warn!("some profiles could not be resolved");
    }
}

fn print_message(display_type: DisplayType, record: &shared::records::MessageRecord) {
    let arrow = match display_type {
        DisplayType::Sent => ">>",
        DisplayType::Received => "<<",
    };
    let body = match (record.text.as_deref(), record.attachment(), record.voice_duration) {
        (Some(text), _, _) if !text.trim().is_empty() => text.to_owned(),
        (_, _, Some(seconds)) => format!("[voice {seconds}s]"),
        (_, Some(Attachment::Image { url }), _) => format!("[image {url}]"),
        (_, Some(Attachment::File { name, .. }), _) => format!("[file {name}]"),
        _ => String::new(),
    };
    println!(
        "{arrow} {}\t{}\t{}\t{}",
        record.id,
        record.sender_id,
        record.status.as_str(),
        body
    );
}
