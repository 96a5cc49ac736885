//! SQLite implementation of every store, behind one `tokio-rusqlite` connection.
//!
//! Descriptors and enrollment image lists are stored as JSON arrays.
//! Timestamps are Unix milliseconds. A NULL distance means "no gallery entry"
//! and reads back as infinity.

use crate::model::{
    local_day_bounds, DailySummary, DetectionEvent, DoorState, EventId, HistoryPage,
    HistoryQuery, KnownFilter, NewDetectionEvent, NewPerson, Person, PersonUpdate,
};
use crate::{GalleryStore, HistoryStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use porchlight_core::{Descriptor, PersonId, RecognitionConfig};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS people (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name      TEXT NOT NULL,
    descriptor        TEXT NOT NULL,
    enrollment_images TEXT NOT NULL DEFAULT '[]',
    created_at        INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS detections (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id    INTEGER REFERENCES people(id) ON DELETE SET NULL,
    matched_name TEXT,
    captured_at  INTEGER NOT NULL,
    image_ref    TEXT NOT NULL DEFAULT '',
    distance     REAL,
    is_known     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS detections_captured_at ON detections(captured_at);
CREATE TABLE IF NOT EXISTS door_state (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    is_locked       INTEGER NOT NULL,
    last_changed_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS settings (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    body TEXT NOT NULL
);
";

const PERSON_COLUMNS: &str = "id, display_name, descriptor, enrollment_images, created_at";
const EVENT_COLUMNS: &str =
    "id, person_id, matched_name, captured_at, image_ref, distance, is_known";

/// Row as read from `people`, before JSON decoding.
type PersonRow = (i64, String, String, String, i64);
/// Row as read from `detections`.
type EventRow = (i64, Option<i64>, Option<String>, i64, String, Option<f64>, bool);

fn read_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersonRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn read_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(StoreError::BadTimestamp(ms))
}

fn decode_person(row: PersonRow) -> Result<Person, StoreError> {
    let (id, display_name, descriptor, images, created_at) = row;
    let descriptor: Descriptor = serde_json::from_str(&descriptor)?;
    Ok(Person {
        id: PersonId(id),
        display_name,
        descriptor,
        enrollment_images: serde_json::from_str(&images)?,
        created_at: timestamp(created_at)?,
    })
}

fn decode_event(row: EventRow) -> Result<DetectionEvent, StoreError> {
    let (id, person_id, matched_name, captured_at, image_ref, distance, is_known) = row;
    Ok(DetectionEvent {
        id: EventId(id),
        matched_identity_id: person_id.map(PersonId),
        matched_name,
        captured_at: timestamp(captured_at)?,
        image_ref,
        distance: distance.map(|d| d as f32).unwrap_or(f32::INFINITY),
        is_known,
    })
}

fn decode_events(rows: Vec<EventRow>) -> Result<Vec<DetectionEvent>, StoreError> {
    rows.into_iter().map(decode_event).collect()
}

/// All stores on one SQLite database. Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn).await
    }

    /// Private database that lives as long as this store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        tracing::info!("in-memory database opened");
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        let now = Utc::now().timestamp_millis();
        conn.call(move |conn| {
            conn.pragma_update(None, "foreign_keys", 1)?;
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT OR IGNORE INTO door_state (id, is_locked, last_changed_at) VALUES (1, 1, ?1)",
                params![now],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn door_state(&self) -> Result<DoorState, StoreError> {
        let (is_locked, changed) = self
            .conn
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT is_locked, last_changed_at FROM door_state WHERE id = 1",
                    [],
                    |row| Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)?)),
                )?)
            })
            .await?;
        Ok(DoorState {
            is_locked,
            last_changed_at: timestamp(changed)?,
        })
    }

    /// Explicit lock/unlock. Always bumps `last_changed_at`.
    pub async fn set_locked(&self, locked: bool) -> Result<DoorState, StoreError> {
        let now = Utc::now();
        let ms = now.timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE door_state SET is_locked = ?1, last_changed_at = ?2 WHERE id = 1",
                    params![locked, ms],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(locked, "door state changed");
        Ok(DoorState {
            is_locked: locked,
            last_changed_at: timestamp(ms)?,
        })
    }

    /// Persisted recognition settings, `None` before the first save.
    pub async fn load_settings(&self) -> Result<Option<RecognitionConfig>, StoreError> {
        let body = self
            .conn
            .call(|conn| {
                Ok(conn
                    .query_row("SELECT body FROM settings WHERE id = 1", [], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()?)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    pub async fn save_settings(&self, config: &RecognitionConfig) -> Result<(), StoreError> {
        let body = serde_json::to_string(config)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO settings (id, body) VALUES (1, ?1)
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                    params![body],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GalleryStore for SqliteStore {
    async fn list_all(&self) -> Result<Vec<Person>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {PERSON_COLUMNS} FROM people ORDER BY id"))?;
                let rows = stmt
                    .query_map([], read_person)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_person).collect()
    }

    async fn get(&self, id: PersonId) -> Result<Option<Person>, StoreError> {
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {PERSON_COLUMNS} FROM people WHERE id = ?1"),
                        params![id.0],
                        read_person,
                    )
                    .optional()?)
            })
            .await?;
        row.map(decode_person).transpose()
    }

    async fn insert(&self, person: NewPerson) -> Result<Person, StoreError> {
        let descriptor = serde_json::to_string(&person.descriptor)?;
        let images = serde_json::to_string(&person.enrollment_images)?;
        let created_at = Utc::now().timestamp_millis();
        let name = person.display_name.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO people (display_name, descriptor, enrollment_images, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![name, descriptor, images, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        tracing::info!(person_id = id, name = %person.display_name, "person enrolled");
        Ok(Person {
            id: PersonId(id),
            display_name: person.display_name,
            descriptor: person.descriptor,
            enrollment_images: person.enrollment_images,
            created_at: timestamp(created_at)?,
        })
    }

    async fn update(&self, id: PersonId, update: PersonUpdate) -> Result<Person, StoreError> {
        let changed = match update {
            PersonUpdate::Rename(name) => {
                self.conn
                    .call(move |conn| {
                        Ok(conn.execute(
                            "UPDATE people SET display_name = ?2 WHERE id = ?1",
                            params![id.0, name],
                        )?)
                    })
                    .await?
            }
            PersonUpdate::Reenroll {
                descriptor,
                enrollment_images,
            } => {
                let descriptor = serde_json::to_string(&descriptor)?;
                let images = serde_json::to_string(&enrollment_images)?;
                self.conn
                    .call(move |conn| {
                        Ok(conn.execute(
                            "UPDATE people SET descriptor = ?2, enrollment_images = ?3 WHERE id = ?1",
                            params![id.0, descriptor, images],
                        )?)
                    })
                    .await?
            }
        };
        if changed == 0 {
            return Err(StoreError::PersonNotFound(id));
        }
        tracing::info!(person_id = %id, "person updated");
        self.get(id).await?.ok_or(StoreError::PersonNotFound(id))
    }

    async fn delete(&self, id: PersonId) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM people WHERE id = ?1", params![id.0])?))
            .await?;
        if removed > 0 {
            tracing::info!(person_id = %id, "person removed");
        }
        Ok(removed > 0)
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn append(&self, event: NewDetectionEvent) -> Result<DetectionEvent, StoreError> {
        let captured_ms = event.captured_at.timestamp_millis();
        let distance = event.distance.is_finite().then_some(f64::from(event.distance));
        let person_id = event.matched_identity_id.map(|p| p.0);
        let name = event.matched_name.clone();
        let image_ref = event.image_ref.clone();
        let is_known = event.is_known;
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO detections
                        (person_id, matched_name, captured_at, image_ref, distance, is_known)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![person_id, name, captured_ms, image_ref, distance, is_known],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(DetectionEvent {
            id: EventId(id),
            matched_identity_id: event.matched_identity_id,
            matched_name: event.matched_name,
            captured_at: timestamp(captured_ms)?,
            image_ref: event.image_ref,
            distance: event.distance,
            is_known: event.is_known,
        })
    }

    async fn list_recent(&self, n: u32) -> Result<Vec<DetectionEvent>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM detections
                     ORDER BY captured_at DESC, id DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![n], read_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        decode_events(rows)
    }

    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError> {
        let known = match query.filter {
            KnownFilter::All => None,
            KnownFilter::Known => Some(true),
            KnownFilter::Unknown => Some(false),
        };
        let (from, until) = match query.date {
            Some(day) => {
                let (start, end) = local_day_bounds(day);
                (Some(start.timestamp_millis()), Some(end.timestamp_millis()))
            }
            None => (None, None),
        };
        let limit = i64::from(query.limit.max(1));
        // Far-out pages saturate and simply come back empty.
        let offset = i64::from(query.page.max(1) - 1).saturating_mul(limit);

        let (total, rows) = self
            .conn
            .call(move |conn| {
                let filter = "WHERE (?1 IS NULL OR is_known = ?1)
                                AND (?2 IS NULL OR captured_at >= ?2)
                                AND (?3 IS NULL OR captured_at < ?3)";
                let total: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM detections {filter}"),
                    params![known, from, until],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM detections {filter}
                     ORDER BY captured_at DESC, id DESC LIMIT ?4 OFFSET ?5"
                ))?;
                let rows = stmt
                    .query_map(params![known, from, until, limit, offset], read_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((total, rows))
            })
            .await?;
        Ok(HistoryPage {
            entries: decode_events(rows)?,
            total: total.max(0) as u64,
        })
    }

    async fn latest(&self) -> Result<Option<DetectionEvent>, StoreError> {
        Ok(self.list_recent(1).await?.into_iter().next())
    }

    async fn summary_for(&self, day: NaiveDate) -> Result<DailySummary, StoreError> {
        let (start, end) = local_day_bounds(day);
        let (start, end) = (start.timestamp_millis(), end.timestamp_millis());
        let (total, known) = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(is_known), 0) FROM detections
                     WHERE captured_at >= ?1 AND captured_at < ?2",
                    params![start, end],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?)
            })
            .await?;
        let (total, known) = (total.max(0) as u64, known.max(0) as u64);
        Ok(DailySummary {
            total,
            known,
            unknown: total.saturating_sub(known),
        })
    }

    async fn delete_by_id(&self, id: EventId) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM detections WHERE id = ?1", params![id.0])?)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let removed = self
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM detections", [])?))
            .await?;
        tracing::info!(removed, "history cleared");
        Ok(removed as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = cutoff.timestamp_millis();
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM detections WHERE captured_at < ?1", params![cutoff])?)
            })
            .await?;
        Ok(removed as u64)
    }
}
