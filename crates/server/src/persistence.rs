//! Persistence layer - batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Batches writes for better performance under high event volume.
//! `MessageAppend` carries an optional ack that fires once the batch
//! containing it has committed — publish paths await the ack so a
//! message is durable before fan-out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use concierge_protocol::{
    Attachment, Message, Priority, Rating, Room, RoomKind, RoomSource, RoomStatus, SenderKind,
    TransferEvent, TransferTrigger,
};

/// Commands that can be persisted
#[derive(Debug)]
pub enum PersistCommand {
    /// Create a new room
    RoomCreate { room: Room },

    /// Update room status/agent/closed_at
    RoomUpdate {
        id: String,
        status: Option<RoomStatus>,
        agent_id: Option<String>,
        agent_name: Option<String>,
        closed_at: Option<i64>,
    },

    /// Append a message. `ack` fires after the containing batch commits.
    MessageAppend {
        message: Message,
        ack: Option<oneshot::Sender<()>>,
    },

    /// Flip messages to read (one-way)
    MessagesMarkRead {
        room_id: String,
        message_ids: Vec<String>,
    },

    /// Record an AI→human handoff
    TransferInsert { event: TransferEvent },
}

/// Create the persistence channel pair
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1024)
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    /// Create a new persistence writer against the resolved data dir
    pub fn new(rx: mpsc::Receiver<PersistCommand>) -> Self {
        Self::with_db_path(rx, crate::paths::db_path())
    }

    pub fn with_db_path(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(50),
        }
    }

    /// Run the persistence writer (call from tokio::spawn)
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
            "PersistenceWriter started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.batch.push(cmd);
                            if self.batch.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => {
                            // Channel closed: final flush, then exit
                            self.flush().await;
                            return;
                        }
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    /// Flush the batch to SQLite
    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        // Use spawn_blocking for SQLite (it's not async)
        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    commands = count,
                    "Persisted {} commands",
                    count
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

/// Flush a batch of commands to SQLite (runs in blocking thread).
/// Acks for appended messages fire only after the transaction commits;
/// an ack whose command failed is dropped so the publisher sees the error.
fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open_connection(db_path)?;
    let count = batch.len();

    let tx = conn.unchecked_transaction()?;
    let mut acks: Vec<oneshot::Sender<()>> = Vec::new();

    for mut cmd in batch {
        let ack = match &mut cmd {
            PersistCommand::MessageAppend { ack, .. } => ack.take(),
            _ => None,
        };

        match execute_command(&tx, cmd) {
            Ok(()) => {
                if let Some(ack) = ack {
                    acks.push(ack);
                }
            }
            Err(e) => {
                warn!(
                    component = "persistence",
                    event = "persistence.command_failed",
                    error = %e,
                    "Failed to execute command"
                );
                // Continue with other commands; the dropped ack surfaces
                // the failure to the publisher.
            }
        }
    }

    tx.commit()?;

    for ack in acks {
        let _ = ack.send(());
    }

    Ok(count)
}

fn open_connection(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Execute a single persist command
fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::RoomCreate { room } => {
            conn.execute(
                "INSERT INTO rooms (id, kind, status, owner_user_id, agent_id, agent_name, subject, priority, source, created_at, closed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    room.id,
                    room_kind_str(room.kind),
                    room_status_str(room.status),
                    room.owner_user_id,
                    room.agent_id,
                    room.agent_name,
                    room.subject,
                    priority_str(room.priority),
                    room_source_str(room.source),
                    room.created_at,
                    room.closed_at,
                ],
            )?;
        }

        PersistCommand::RoomUpdate {
            id,
            status,
            agent_id,
            agent_name,
            closed_at,
        } => {
            // Build dynamic update
            let mut updates = Vec::new();
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(s) = status {
                updates.push("status = ?");
                params_vec.push(Box::new(room_status_str(s).to_string()));
            }
            if let Some(a) = agent_id {
                updates.push("agent_id = ?");
                params_vec.push(Box::new(a));
            }
            if let Some(n) = agent_name {
                updates.push("agent_name = ?");
                params_vec.push(Box::new(n));
            }
            if let Some(c) = closed_at {
                updates.push("closed_at = ?");
                params_vec.push(Box::new(c));
            }

            if !updates.is_empty() {
                let sql = format!("UPDATE rooms SET {} WHERE id = ?", updates.join(", "));
                params_vec.push(Box::new(id));

                let params_refs: Vec<&dyn rusqlite::ToSql> =
                    params_vec.iter().map(|b| b.as_ref()).collect();
                conn.execute(&sql, rusqlite::params_from_iter(params_refs))?;
            }
        }

        PersistCommand::MessageAppend { message, .. } => {
            let (url, thumb, file_name) = match &message.attachment {
                Some(a) => (
                    Some(a.url.clone()),
                    a.thumbnail_url.clone(),
                    a.file_name.clone(),
                ),
                None => (None, None, None),
            };

            conn.execute(
                "INSERT INTO messages (id, room_id, sender_kind, sender_id, body, attachment_url, attachment_thumbnail_url, attachment_file_name, created_at, sequence, is_read, is_transfer_request)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.id,
                    message.room_id,
                    sender_kind_str(message.sender_kind),
                    message.sender_id,
                    message.body,
                    url,
                    thumb,
                    file_name,
                    message.created_at,
                    message.sequence as i64,
                    if message.read { 1 } else { 0 },
                    if message.is_transfer_request { 1 } else { 0 },
                ],
            )?;
        }

        PersistCommand::MessagesMarkRead {
            room_id,
            message_ids,
        } => {
            // One-way flip; already-read rows are untouched by the predicate
            for id in message_ids {
                conn.execute(
                    "UPDATE messages SET is_read = 1 WHERE id = ?1 AND room_id = ?2 AND is_read = 0",
                    params![id, room_id],
                )?;
            }
        }

        PersistCommand::TransferInsert { event } => {
            let copied = serde_json::to_string(&event.copied_message_ids)
                .unwrap_or_else(|_| "[]".to_string());
            conn.execute(
                "INSERT INTO transfers (id, source_room_id, target_room_id, triggered_by, window_start, window_end, copied_message_ids)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id,
                    event.source_room_id,
                    event.target_room_id,
                    transfer_trigger_str(event.triggered_by),
                    event.window_start,
                    event.window_end,
                    copied,
                ],
            )?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    owner_user_id TEXT NOT NULL,
    agent_id TEXT,
    agent_name TEXT,
    subject TEXT NOT NULL,
    priority TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    closed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_rooms_owner ON rooms(owner_user_id, status);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    sender_kind TEXT NOT NULL,
    sender_id TEXT,
    body TEXT,
    attachment_url TEXT,
    attachment_thumbnail_url TEXT,
    attachment_file_name TEXT,
    created_at INTEGER NOT NULL,
    sequence INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_transfer_request INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id, sequence);

CREATE TABLE IF NOT EXISTS transfers (
    id TEXT PRIMARY KEY,
    source_room_id TEXT NOT NULL,
    target_room_id TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    copied_message_ids TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ratings (
    room_id TEXT PRIMARY KEY,
    score INTEGER NOT NULL,
    comment TEXT,
    submitted_at INTEGER NOT NULL
);
";

/// Create tables idempotently. Called once at startup before any writes.
pub fn init_schema(db_path: &Path) -> Result<(), rusqlite::Error> {
    let conn = open_connection(db_path)?;
    conn.execute_batch(SCHEMA)
}

/// Async wrapper over [`init_schema`] for the startup path.
pub async fn init_schema_at_data_dir() -> anyhow::Result<()> {
    let db_path = crate::paths::db_path();
    tokio::task::spawn_blocking(move || init_schema(&db_path)).await??;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

fn room_from_row(row: &rusqlite::Row<'_>) -> Result<Room, rusqlite::Error> {
    Ok(Room {
        id: row.get("id")?,
        kind: parse_room_kind(&row.get::<_, String>("kind")?),
        status: parse_room_status(&row.get::<_, String>("status")?),
        owner_user_id: row.get("owner_user_id")?,
        agent_id: row.get("agent_id")?,
        agent_name: row.get("agent_name")?,
        subject: row.get("subject")?,
        priority: parse_priority(&row.get::<_, String>("priority")?),
        source: parse_room_source(&row.get::<_, String>("source")?),
        created_at: row.get("created_at")?,
        closed_at: row.get("closed_at")?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> Result<Message, rusqlite::Error> {
    let url: Option<String> = row.get("attachment_url")?;
    let attachment = url.map(|url| Attachment {
        url,
        thumbnail_url: row.get("attachment_thumbnail_url").ok().flatten(),
        file_name: row.get("attachment_file_name").ok().flatten(),
    });

    Ok(Message {
        id: row.get("id")?,
        room_id: row.get("room_id")?,
        sender_kind: parse_sender_kind(&row.get::<_, String>("sender_kind")?),
        sender_id: row.get("sender_id")?,
        body: row.get("body")?,
        attachment,
        created_at: row.get("created_at")?,
        sequence: row.get::<_, i64>("sequence")? as u64,
        read: row.get::<_, i64>("is_read")? != 0,
        is_transfer_request: row.get::<_, i64>("is_transfer_request")? != 0,
    })
}

/// Load all non-closed rooms (startup restore)
pub fn load_open_rooms_sync(db_path: &Path) -> Result<Vec<Room>, rusqlite::Error> {
    let conn = open_connection(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT * FROM rooms WHERE status != 'closed' ORDER BY created_at ASC",
    )?;
    let rooms = stmt
        .query_map([], room_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rooms)
}

pub async fn load_open_rooms(db_path: PathBuf) -> anyhow::Result<Vec<Room>> {
    Ok(tokio::task::spawn_blocking(move || load_open_rooms_sync(&db_path)).await??)
}

/// Load a room's messages in delivery order
pub fn load_messages_sync(db_path: &Path, room_id: &str) -> Result<Vec<Message>, rusqlite::Error> {
    let conn = open_connection(db_path)?;
    let mut stmt =
        conn.prepare("SELECT * FROM messages WHERE room_id = ?1 ORDER BY sequence ASC")?;
    let messages = stmt
        .query_map(params![room_id], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

pub async fn load_messages(db_path: PathBuf, room_id: String) -> anyhow::Result<Vec<Message>> {
    Ok(tokio::task::spawn_blocking(move || load_messages_sync(&db_path, &room_id)).await??)
}

/// Load one room by id
pub fn load_room_sync(db_path: &Path, room_id: &str) -> Result<Option<Room>, rusqlite::Error> {
    let conn = open_connection(db_path)?;
    conn.query_row(
        "SELECT * FROM rooms WHERE id = ?1",
        params![room_id],
        room_from_row,
    )
    .optional()
}

pub async fn load_room(db_path: PathBuf, room_id: String) -> anyhow::Result<Option<Room>> {
    Ok(tokio::task::spawn_blocking(move || load_room_sync(&db_path, &room_id)).await??)
}

/// Insert a rating. Returns `false` when one already exists for the room
/// — the primary key makes the second write lose atomically.
pub fn insert_rating_sync(db_path: &Path, rating: &Rating) -> Result<bool, rusqlite::Error> {
    let conn = open_connection(db_path)?;
    let inserted = conn.execute(
        "INSERT INTO ratings (room_id, score, comment, submitted_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(room_id) DO NOTHING",
        params![rating.room_id, rating.score, rating.comment, rating.submitted_at],
    )?;
    Ok(inserted > 0)
}

pub async fn insert_rating(db_path: PathBuf, rating: Rating) -> anyhow::Result<bool> {
    Ok(tokio::task::spawn_blocking(move || insert_rating_sync(&db_path, &rating)).await??)
}

// ---------------------------------------------------------------------------
// Enum <-> column mappings
// ---------------------------------------------------------------------------

fn room_kind_str(kind: RoomKind) -> &'static str {
    match kind {
        RoomKind::Ai => "ai",
        RoomKind::Human => "human",
    }
}

fn parse_room_kind(raw: &str) -> RoomKind {
    match raw {
        "human" => RoomKind::Human,
        _ => RoomKind::Ai,
    }
}

fn room_status_str(status: RoomStatus) -> &'static str {
    match status {
        RoomStatus::AiActive => "ai_active",
        RoomStatus::Waiting => "waiting",
        RoomStatus::Active => "active",
        RoomStatus::Closed => "closed",
    }
}

fn parse_room_status(raw: &str) -> RoomStatus {
    match raw {
        "ai_active" => RoomStatus::AiActive,
        "waiting" => RoomStatus::Waiting,
        "active" => RoomStatus::Active,
        _ => RoomStatus::Closed,
    }
}

fn priority_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
    }
}

fn parse_priority(raw: &str) -> Priority {
    match raw {
        "low" => Priority::Low,
        "high" => Priority::High,
        _ => Priority::Medium,
    }
}

fn room_source_str(source: RoomSource) -> &'static str {
    match source {
        RoomSource::Direct => "direct",
        RoomSource::AiTransfer => "ai_transfer",
    }
}

fn parse_room_source(raw: &str) -> RoomSource {
    match raw {
        "ai_transfer" => RoomSource::AiTransfer,
        _ => RoomSource::Direct,
    }
}

fn sender_kind_str(kind: SenderKind) -> &'static str {
    match kind {
        SenderKind::User => "user",
        SenderKind::Agent => "agent",
        SenderKind::Ai => "ai",
        SenderKind::System => "system",
    }
}

fn parse_sender_kind(raw: &str) -> SenderKind {
    match raw {
        "user" => SenderKind::User,
        "agent" => SenderKind::Agent,
        "system" => SenderKind::System,
        _ => SenderKind::Ai,
    }
}

fn transfer_trigger_str(trigger: TransferTrigger) -> &'static str {
    match trigger {
        TransferTrigger::Keyword => "keyword",
        TransferTrigger::AiSuggestion => "ai_suggestion",
    }
}
