//! porchlight-store: persistence for the doorbell daemon.
//!
//! People (the recognition gallery), detection history, door state and
//! recognition settings, kept in one SQLite database. Sessions talk to the
//! [`GalleryStore`] and [`HistoryStore`] traits so tests can swap in fakes.

pub mod model;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use porchlight_core::PersonId;
use thiserror::Error;

pub use model::{
    local_day_bounds, DailySummary, DetectionEvent, DoorState, EventId, HistoryPage,
    HistoryQuery, KnownFilter, NewDetectionEvent, NewPerson, Person, PersonUpdate,
};
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("person {0} not found")]
    PersonNotFound(PersonId),
    #[error("stored timestamp {0} out of range")]
    BadTimestamp(i64),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(tokio_rusqlite::Error::Rusqlite(e))
    }
}

/// Enrolled people. `list_all` returns them in ascending id order.
#[async_trait]
pub trait GalleryStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<Person>, StoreError>;
    async fn get(&self, id: PersonId) -> Result<Option<Person>, StoreError>;
    async fn insert(&self, person: NewPerson) -> Result<Person, StoreError>;
    async fn update(&self, id: PersonId, update: PersonUpdate) -> Result<Person, StoreError>;
    /// Returns `false` when no such person existed.
    async fn delete(&self, id: PersonId) -> Result<bool, StoreError>;
}

/// Detection events, append-only apart from deletion.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, event: NewDetectionEvent) -> Result<DetectionEvent, StoreError>;
    /// Newest first.
    async fn list_recent(&self, n: u32) -> Result<Vec<DetectionEvent>, StoreError>;
    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError>;
    async fn latest(&self) -> Result<Option<DetectionEvent>, StoreError>;
    async fn summary_for(&self, day: NaiveDate) -> Result<DailySummary, StoreError>;
    async fn delete_by_id(&self, id: EventId) -> Result<bool, StoreError>;
    async fn delete_all(&self) -> Result<u64, StoreError>;
    /// Removes events captured strictly before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
