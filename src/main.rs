//! Headless replica CLI: host or join a room without a rendering toolkit.
//!
//! Useful as an always-on relay for a room and as a debugging console.
//! Commands are read line by line from stdin while the session polls in the
//! background.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use canvasync::{
    AttrValue, CanvasBridge, CanvasSession, FsSnapshotStore, ObjectId, ObjectView,
    PersistenceService, RoomId, UserIdentity,
};

#[derive(Parser, Debug)]
#[command(name = "canvasync", about = "Headless collaborative canvas replica")]
struct Args {
    /// Room to host or join (UUID). A fresh room is created when omitted.
    #[arg(long)]
    room: Option<uuid::Uuid>,

    /// Ticket of a peer to join.
    #[arg(long)]
    join: Option<String>,

    /// Display name announced to peers.
    #[arg(long, default_value = "anonymous")]
    name: String,

    /// Cursor color announced to peers.
    #[arg(long, default_value = "#7aa2f7")]
    color: String,

    /// Snapshot storage directory (defaults to the platform data dir).
    #[arg(long)]
    storage: Option<std::path::PathBuf>,
}

/// Bridge that just logs remote changes.
struct LogBridge;

impl CanvasBridge for LogBridge {
    fn apply_remote_added(&mut self, record: &ObjectView) {
        info!(object = %record.id, attrs = ?record.attrs, "remote added");
    }

    fn apply_remote_modified(&mut self, record: &ObjectView) {
        info!(object = %record.id, attrs = ?record.attrs, "remote modified");
    }

    fn apply_remote_removed(&mut self, id: ObjectId) {
        info!(object = %id, "remote removed");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let room = args.room.map(RoomId).unwrap_or_default();
    let store = match args.storage {
        Some(dir) => FsSnapshotStore::new(dir),
        None => FsSnapshotStore::default(),
    };
    let mut session = CanvasSession::new(
        room,
        UserIdentity {
            name: args.name,
            color: args.color,
        },
        PersistenceService::new(Box::new(store)),
    )?;
    session.connect(args.join)?;

    println!("room: {room}");
    if let Some(ticket) = session.ticket() {
        println!("ticket: {ticket}");
    }
    println!("commands: add k=v ..., set <id> k=v ..., del <id>, list, undo, redo, save, quit");

    // Stdin reader on its own thread so the poll loop never blocks.
    let (line_tx, line_rx) = mpsc::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut bridge = LogBridge;
    loop {
        let now = Instant::now();
        session.poll(&mut bridge, now);

        match line_rx.try_recv() {
            Ok(line) => match handle_command(&mut session, line.trim(), now) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("error: {e:#}"),
            },
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => break,
        }

        thread::sleep(Duration::from_millis(16));
    }

    session.close();
    Ok(())
}

/// Returns false when the session should end.
fn handle_command(session: &mut CanvasSession, line: &str, now: Instant) -> Result<bool> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some("add") => {
            let attrs = parse_attrs(parts)?;
            if let Some(id) = session.add_object(attrs, now)? {
                println!("added {id}");
            }
        }
        Some("set") => {
            let id = parse_id(parts.next())?;
            let changes = parse_attrs(parts)?;
            session.modify_object(id, changes, false, now)?;
        }
        Some("del") => {
            let id = parse_id(parts.next())?;
            session.remove_object(id, now)?;
        }
        Some("list") => {
            for view in session.document().objects() {
                println!("{} {:?}", view.id, view.attrs);
            }
            println!(
                "{} objects, {} peers, {:?}",
                session.document().len(),
                session.presence().count(),
                session.status()
            );
        }
        Some("undo") => {
            if !session.undo(now)? {
                println!("nothing to undo");
            }
        }
        Some("redo") => {
            if !session.redo(now)? {
                println!("nothing to redo");
            }
        }
        Some("save") => {
            println!("saved: {}", session.save(now));
        }
        Some("quit") => return Ok(false),
        Some(other) => println!("unknown command: {other}"),
    }
    Ok(true)
}

fn parse_id(arg: Option<&str>) -> Result<ObjectId> {
    let raw = arg.context("expected an object id")?;
    let uuid = raw.parse().context("invalid object id")?;
    Ok(ObjectId(uuid))
}

/// Parse `key=value` pairs; values try integer, then float, then text.
fn parse_attrs<'a>(
    parts: impl Iterator<Item = &'a str>,
) -> Result<BTreeMap<String, AttrValue>> {
    let mut attrs = BTreeMap::new();
    for part in parts {
        let (key, raw) = part
            .split_once('=')
            .with_context(|| format!("expected key=value, got {part}"))?;
        let value = if let Ok(i) = raw.parse::<i64>() {
            AttrValue::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            AttrValue::Float(f)
        } else {
            AttrValue::Text(raw.to_string())
        };
        attrs.insert(key.to_string(), value);
    }
    Ok(attrs)
}
