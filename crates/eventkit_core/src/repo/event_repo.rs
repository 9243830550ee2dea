//! Event repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide CRUD and ordered series queries over `events` storage.
//! - Own the transaction boundary used by the propagation engine.
//! - Stamp `created`/`modified` from an injected [`Clock`].
//!
//! # Invariants
//! - Write paths call `Event::validate()` before SQL mutations.
//! - Every mutation strictly increases `modified` for the touched rows.
//! - Deleting an event orphans its children; it never cascades.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::clock::{Clock, SystemClock};
use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::event::{Event, EventId, EventValidationError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const EVENT_SELECT_SQL: &str = "SELECT
    id,
    title,
    description,
    location,
    start_ms,
    end_ms,
    repeat_expression,
    master_id,
    created_ms,
    modified_ms
FROM events";

const EVENT_COLUMNS: [&str; 10] = [
    "id",
    "title",
    "description",
    "location",
    "start_ms",
    "end_ms",
    "repeat_expression",
    "master_id",
    "created_ms",
    "modified_ms",
];

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for event persistence and query operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Validation(#[from] EventValidationError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("event not found: {0}")]
    NotFound(EventId),
    /// SQLite gave up waiting for another writer.
    #[error("database busy: {0}")]
    Busy(String),
    #[error("invalid persisted event data: {0}")]
    InvalidData(String),
    #[error("event repository requires schema version {expected_version}, got {actual_version}")]
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    #[error("event repository requires table `{0}`")]
    MissingRequiredTable(&'static str),
    #[error("event repository requires column `{column}` in table `{table}`")]
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        match &value {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::Busy(value.to_string())
            }
            _ => Self::Db(DbError::Sqlite(value)),
        }
    }
}

/// Store interface consumed by the propagation engine.
pub trait EventRepository {
    /// Inserts a new event and returns its ID.
    fn insert_event(&self, event: &Event) -> RepoResult<EventId>;
    /// Loads one event by ID.
    fn get_event(&self, id: EventId) -> RepoResult<Option<Event>>;
    /// Replaces all mutable fields of an existing event.
    fn update_event(&self, event: &Event) -> RepoResult<()>;
    /// Deletes one event and orphans the events pointing at it.
    fn delete_event(&self, id: EventId) -> RepoResult<()>;
    /// Lists attached children of `master_id`, ordered by start then ID.
    ///
    /// Events that point at the master but carry their own rule are not
    /// part of its series and are excluded.
    fn query_children(&self, master_id: EventId) -> RepoResult<Vec<Event>>;
    /// Re-points one event at another master, or clears the link.
    fn set_master(&self, id: EventId, master_id: Option<EventId>) -> RepoResult<()>;
    /// Clears the master link of every event pointing at `master_id`.
    fn orphan_children(&self, master_id: EventId) -> RepoResult<usize>;
    /// Runs `work` inside one transaction; nested calls join the outer one.
    ///
    /// Any error rolls every write of `work` back.
    fn atomically<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<RepoError>;
}

/// SQLite-backed event repository.
pub struct SqliteEventRepository<'conn> {
    conn: &'conn Connection,
    clock: Arc<dyn Clock>,
}

impl<'conn> SqliteEventRepository<'conn> {
    /// Creates repository from a migrated connection using the system clock.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        Self::with_clock(conn, Arc::new(SystemClock))
    }

    /// Creates repository from a migrated connection and explicit clock.
    pub fn with_clock(conn: &'conn Connection, clock: Arc<dyn Clock>) -> RepoResult<Self> {
        ensure_event_connection_ready(conn)?;
        Ok(Self { conn, clock })
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

impl EventRepository for SqliteEventRepository<'_> {
    fn insert_event(&self, event: &Event) -> RepoResult<EventId> {
        event.validate()?;
        let now_ms = self.now_ms();

        self.conn.execute(
            "INSERT INTO events (
                id,
                title,
                description,
                location,
                start_ms,
                end_ms,
                repeat_expression,
                master_id,
                created_ms,
                modified_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9);",
            params![
                event.id.to_string(),
                event.title.as_str(),
                event.description.as_str(),
                event.location.as_deref(),
                event.start.timestamp_millis(),
                event.end.map(|end| end.timestamp_millis()),
                event.repeat_expression(),
                event.master_id.map(|id| id.to_string()),
                now_ms,
            ],
        )?;

        Ok(event.id)
    }

    fn get_event(&self, id: EventId) -> RepoResult<Option<Event>> {
        self.conn
            .query_row(
                &format!("{EVENT_SELECT_SQL} WHERE id = ?1;"),
                [id.to_string()],
                |row| Ok(parse_event_row(row)),
            )
            .optional()?
            .transpose()
    }

    fn update_event(&self, event: &Event) -> RepoResult<()> {
        event.validate()?;

        let changed = self.conn.execute(
            "UPDATE events
             SET
                title = ?1,
                description = ?2,
                location = ?3,
                start_ms = ?4,
                end_ms = ?5,
                repeat_expression = ?6,
                master_id = ?7,
                modified_ms = MAX(?8, modified_ms + 1)
             WHERE id = ?9;",
            params![
                event.title.as_str(),
                event.description.as_str(),
                event.location.as_deref(),
                event.start.timestamp_millis(),
                event.end.map(|end| end.timestamp_millis()),
                event.repeat_expression(),
                event.master_id.map(|id| id.to_string()),
                self.now_ms(),
                event.id.to_string(),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(event.id));
        }
        Ok(())
    }

    fn delete_event(&self, id: EventId) -> RepoResult<()> {
        self.atomically(|| {
            self.orphan_children(id)?;
            let changed = self
                .conn
                .execute("DELETE FROM events WHERE id = ?1;", [id.to_string()])?;
            if changed == 0 {
                return Err(RepoError::NotFound(id));
            }
            Ok(())
        })
    }

    fn query_children(&self, master_id: EventId) -> RepoResult<Vec<Event>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EVENT_SELECT_SQL}
             WHERE master_id = ?1
               AND repeat_expression IS NULL
             ORDER BY start_ms ASC, id ASC;"
        ))?;

        let mut rows = stmt.query([master_id.to_string()])?;
        let mut children = Vec::new();
        while let Some(row) = rows.next()? {
            children.push(parse_event_row(row)?);
        }
        Ok(children)
    }

    fn set_master(&self, id: EventId, master_id: Option<EventId>) -> RepoResult<()> {
        if master_id == Some(id) {
            return Err(EventValidationError::SelfReference(id).into());
        }

        let changed = self.conn.execute(
            "UPDATE events
             SET
                master_id = ?1,
                modified_ms = MAX(?2, modified_ms + 1)
             WHERE id = ?3;",
            params![
                master_id.map(|value| value.to_string()),
                self.now_ms(),
                id.to_string()
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    fn orphan_children(&self, master_id: EventId) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE events
             SET
                master_id = NULL,
                modified_ms = MAX(?1, modified_ms + 1)
             WHERE master_id = ?2;",
            params![self.now_ms(), master_id.to_string()],
        )?;
        Ok(changed)
    }

    fn atomically<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<RepoError>,
    {
        if !self.conn.is_autocommit() {
            return work();
        }

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .map_err(RepoError::from)?;
        let value = work()?;
        tx.commit().map_err(RepoError::from)?;
        Ok(value)
    }
}

fn parse_event_row(row: &Row<'_>) -> RepoResult<Event> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "events.id")?;

    let master_id = row
        .get::<_, Option<String>>("master_id")?
        .map(|value| parse_uuid(&value, "events.master_id"))
        .transpose()?;

    let end = row
        .get::<_, Option<i64>>("end_ms")?
        .map(|value| parse_millis(value, "events.end_ms"))
        .transpose()?;

    let event = Event {
        id,
        title: row.get("title")?,
        description: row.get("description")?,
        location: row.get("location")?,
        start: parse_millis(row.get("start_ms")?, "events.start_ms")?,
        end,
        repeat_expression: row.get("repeat_expression")?,
        master_id,
        created: parse_millis(row.get("created_ms")?, "events.created_ms")?,
        modified: parse_millis(row.get("modified_ms")?, "events.modified_ms")?,
    };
    event.validate()?;
    Ok(event)
}

fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

fn parse_millis(value: i64, column: &'static str) -> RepoResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid timestamp `{value}` in {column}")))
}

fn ensure_event_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, "events")? {
        return Err(RepoError::MissingRequiredTable("events"));
    }

    for column in EVENT_COLUMNS {
        if !table_has_column(conn, "events", column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: "events",
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
