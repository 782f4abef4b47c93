//! Ploggy data directory admin tool
//!
//! Inspects and edits a data directory while no engine is running on it.
//!
//! Usage:
//!   ploggy-data show                 - Self identity and status
//!   ploggy-data friends              - Friends with exchange timestamps
//!   ploggy-data status <friend>      - A friend's last known status
//!   ploggy-data remove-friend <friend>
//!   ploggy-data reset --yes          - Delete every record
//!
//! `<friend>` is a full friend id or a unique prefix of one.
//!
//! Environment:
//!   PLOGGY_CONFIG    - TOML config file (optional)
//!   PLOGGY_DATA_DIR  - Data directory override
//!   RUST_LOG         - Log filter (default: info)

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

use ploggy::{DataStore, EngineConfig, EventBus, Friend, FriendId, Status};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::var("PLOGGY_CONFIG") {
        Ok(path) => EngineConfig::load(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => EngineConfig::from_env()?,
    };
    let store = DataStore::open(&config.data_dir, EventBus::new()).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["show"] => show(&store).await,
        ["friends"] => friends(&store).await,
        ["status", friend] => friend_status(&store, friend).await,
        ["remove-friend", friend] => remove_friend(&store, friend).await,
        ["reset", "--yes"] => {
            store.reset().await?;
            println!("Reset {}", store.dir().display());
            Ok(())
        }
        ["reset"] => bail!("reset deletes every record in {}; pass --yes", store.dir().display()),
        _ => {
            eprintln!("usage: ploggy-data <show|friends|status <friend>|remove-friend <friend>|reset --yes>");
            std::process::exit(2);
        }
    }
}

async fn show(store: &DataStore) -> Result<()> {
    let me = match store.get_self().await {
        Ok(me) => me,
        Err(e) if e.is_not_found() => {
            println!("No self identity in {}", store.dir().display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let public = &me.public_identity;
    println!("Nickname: {}", public.nickname);
    println!("Hostname: {}", public.hidden_service_hostname);
    println!("Id:       {}", public.friend_id().as_str());

    match store.get_self_status().await {
        Ok(status) => print_status(&status),
        Err(e) if e.is_not_found() => println!("Status:   (none)"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn friends(store: &DataStore) -> Result<()> {
    let friends = store.get_friends().await?;
    if friends.is_empty() {
        println!("No friends");
        return Ok(());
    }
    for friend in friends {
        println!(
            "{}  {:<20} sent {}  received {}",
            friend.id,
            friend.public_identity.nickname,
            when(friend.last_sent_status_timestamp),
            when(friend.last_received_status_timestamp),
        );
    }
    Ok(())
}

async fn friend_status(store: &DataStore, query: &str) -> Result<()> {
    let friend = resolve_friend(store, query).await?;
    println!("Friend:   {} ({})", friend.public_identity.nickname, friend.id);
    match store.get_friend_status(&friend.id).await {
        Ok(status) => print_status(&status),
        Err(e) if e.is_not_found() => println!("Status:   (none)"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn remove_friend(store: &DataStore, query: &str) -> Result<()> {
    let friend = resolve_friend(store, query).await?;
    store.remove_friend(&friend.id).await?;
    println!("Removed {} ({})", friend.public_identity.nickname, friend.id);
    Ok(())
}

async fn resolve_friend(store: &DataStore, query: &str) -> Result<Friend> {
    if let Some(id) = FriendId::parse(query) {
        return store
            .get_friend_by_id(&id)
            .await
            .with_context(|| format!("no friend {id}"));
    }

    let prefix = query.to_ascii_lowercase();
    let mut matches: Vec<Friend> = store
        .get_friends()
        .await?
        .into_iter()
        .filter(|f| f.id.as_str().starts_with(&prefix))
        .collect();
    match matches.len() {
        0 => bail!("no friend matches {query}"),
        1 => Ok(matches.remove(0)),
        n => bail!("{query} is ambiguous ({n} friends match)"),
    }
}

fn print_status(status: &Status) {
    println!("Status:   {}", status.timestamp.to_rfc3339());
    println!("Location: {}, {} (precision {})", status.latitude, status.longitude, status.precision);
    println!("Address:  {}", status.street_address);
}

fn when(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}
