//! Interactive chat node over TCP.
//!
//! Lines typed on stdin go to the current group (the lobby at first).
//! Lines starting with `/` are commands; `/help` lists them.

use anyhow::Context;
use cbc_engine::{ConnectionState, Engine, EngineConfig, EngineEvent, GroupId, PeerId, TcpLink};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const DEFAULT_LISTEN: &str = "127.0.0.1:0";

const HELP: &str = "\
/create <name>      create a group and switch to it
/join <name>        join a group by name and switch to it
/leave              leave the current group
/switch <name>      switch to a group you belong to (\"lobby\" for the lobby)
/dm <peer> <text>   send a direct message
/nick <name>        change your display name
/rename <name>      rename the current group
/groups             list visible groups
/users [query]      list or search users
/members            members of the current group
/history            replay the current group
/peers              connection states
/connect <id@addr>  dial a peer
/status             delivery state of the current group
/quit";

pub async fn run() -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env();
    let local = config.resolve_peer_id().context("resolving peer id")?;
    let listen = config.listen.clone().unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let link = Arc::new(TcpLink::bind(local.clone(), &listen).await?);
    println!(
        "{} {} listening on {}",
        "causeway".bold().bright_cyan(),
        local.to_string().bright_magenta(),
        link.local_addr()
    );

    let engine = Arc::new(Engine::start(config, link).await?);
    let printer = tokio::spawn(print_events(engine.clone()));

    let mut current = GroupId::lobby();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = handle_line(&engine, &mut current, line).await {
            println!("{} {}", "error:".bright_red(), e);
        }
    }

    printer.abort();
    engine.shutdown();
    info!("bye");
    Ok(())
}

async fn handle_line(engine: &Engine<TcpLink>, current: &mut GroupId, line: &str) -> anyhow::Result<()> {
    let Some(command) = line.strip_prefix('/') else {
        engine.send_message(current, line).await?;
        return Ok(());
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();

    match name {
        "help" => println!("{}", HELP),
        "create" => {
            *current = engine.create_group(rest).await?;
            println!("created {}", current);
        }
        "join" => {
            let group = engine
                .find_group(rest)
                .with_context(|| format!("no group named {:?}", rest))?;
            engine.join_group(&group.group).await?;
            *current = group.group;
        }
        "leave" => {
            engine.leave_group(current).await?;
            *current = GroupId::lobby();
        }
        "switch" => {
            let group = if rest.eq_ignore_ascii_case("lobby") {
                GroupId::lobby()
            } else {
                engine
                    .find_group(rest)
                    .with_context(|| format!("no group named {:?}", rest))?
                    .group
            };
            if !engine.my_groups().contains(&group) {
                anyhow::bail!("not a member of {}", rest);
            }
            *current = group;
        }
        "dm" => {
            let (peer, text) = rest.split_once(' ').context("usage: /dm <peer> <text>")?;
            engine.send_direct(&PeerId::new(peer), text).await?;
        }
        "nick" => engine.rename_self(rest).await?,
        "rename" => engine.rename_group(current, rest).await?,
        "groups" => {
            for group in engine.list_groups() {
                println!("  {} ({} members) {}", group.name.bold(), group.members.len(), group.group.to_string().dimmed());
            }
        }
        "users" => {
            let users = if rest.is_empty() {
                engine.list_users()
            } else {
                engine.search_users(rest)
            };
            for user in users {
                println!("  {} {}", user.display_name.bold(), user.peer.to_string().dimmed());
            }
        }
        "members" => {
            for member in engine.list_members(current) {
                println!("  {}", name_of(engine, &member));
            }
        }
        "history" => {
            for message in engine.history(current)? {
                println!("  {}: {}", name_of(engine, &message.origin).bright_yellow(), message.payload);
            }
        }
        "peers" => {
            for peer in engine.peers() {
                println!(
                    "  {} {:?} {}",
                    peer.peer,
                    peer.state,
                    peer.address.unwrap_or_default().dimmed()
                );
            }
        }
        "connect" => {
            let target = cbc_engine::BootstrapPeer::parse(rest).context("usage: /connect <id@addr>")?;
            engine.connect(target.peer, target.address);
        }
        "status" => {
            let status = engine.group_status(current)?;
            println!(
                "  {} delivered, {} pending, missing {:?}",
                engine.history(current)?.len(),
                status.pending,
                status.missing
            );
        }
        other => anyhow::bail!("unknown command /{} (try /help)", other),
    }
    Ok(())
}

fn name_of(engine: &Engine<TcpLink>, peer: &PeerId) -> String {
    engine
        .list_users()
        .into_iter()
        .find(|p| &p.peer == peer)
        .map(|p| p.display_name)
        .unwrap_or_else(|| peer.to_string())
}

async fn print_events(engine: Arc<Engine<TcpLink>>) {
    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::Delivered { group, message }) => {
                if &message.origin == engine.local_id() {
                    continue;
                }
                let place = if group.is_lobby() {
                    String::new()
                } else if group.is_direct() {
                    "[dm] ".to_string()
                } else {
                    engine
                        .group_info(&group)
                        .map(|g| format!("[{}] ", g.name))
                        .unwrap_or_default()
                };
                println!(
                    "{}{}: {}",
                    place.dimmed(),
                    name_of(&engine, &message.origin).bright_yellow(),
                    message.payload
                );
            }
            Ok(EngineEvent::PeerState { peer, state }) => match state {
                ConnectionState::Live => println!("{} {} is live", "*".bright_green(), peer),
                ConnectionState::Disconnected => println!("{} {} went away", "*".bright_red(), peer),
                _ => {}
            },
            Ok(EngineEvent::HistoryIncomplete { group, missing }) => {
                println!("{} waiting on {:?} in {}", "*".bright_yellow(), missing, group);
            }
            Ok(EngineEvent::Directory { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
