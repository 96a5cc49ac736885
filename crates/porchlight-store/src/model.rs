//! Stored records and query types.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use porchlight_core::{Descriptor, PersonId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: PersonId,
    pub display_name: String,
    /// Always the aggregate of the descriptors of `enrollment_images`.
    pub descriptor: Descriptor,
    pub enrollment_images: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPerson {
    pub display_name: String,
    pub descriptor: Descriptor,
    pub enrollment_images: Vec<String>,
}

/// Allowed mutations of a person. A descriptor only ever changes together
/// with the images it was computed from.
#[derive(Debug, Clone)]
pub enum PersonUpdate {
    Rename(String),
    Reenroll {
        descriptor: Descriptor,
        enrollment_images: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One classified sample from a detection session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub id: EventId,
    /// Set to `None` when the matched person is deleted.
    pub matched_identity_id: Option<PersonId>,
    /// Kept after the person is deleted.
    pub matched_name: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub image_ref: String,
    /// Nearest gallery distance; infinite when the gallery was empty.
    pub distance: f32,
    pub is_known: bool,
}

impl DetectionEvent {
    /// `1 - distance`, clamped to [0, 1].
    pub fn confidence(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct NewDetectionEvent {
    pub matched_identity_id: Option<PersonId>,
    pub matched_name: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub image_ref: String,
    pub distance: f32,
    pub is_known: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnownFilter {
    #[default]
    All,
    Known,
    Unknown,
}

impl FromStr for KnownFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(Self::All),
            "known" => Ok(Self::Known),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown history filter {other:?} (all, known, unknown)")),
        }
    }
}

/// Paged history lookup. Pages are 1-based; entries come newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub page: u32,
    pub limit: u32,
    pub filter: KnownFilter,
    /// Restrict to one local calendar day.
    pub date: Option<NaiveDate>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 9,
            filter: KnownFilter::All,
            date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<DetectionEvent>,
    /// Size of the filtered set before paging.
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub total: u64,
    pub known: u64,
    pub unknown: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorState {
    pub is_locked: bool,
    pub last_changed_at: DateTime<Utc>,
}

/// UTC instants bounding a local calendar day: `[start, end)`.
pub fn local_day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_of = |d: NaiveDate| {
        let midnight = d.and_hms_opt(0, 0, 0).unwrap_or_default();
        Local
            .from_local_datetime(&midnight)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    };
    let next = date.succ_opt().unwrap_or(date);
    (start_of(date), start_of(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_filter_parse() {
        assert_eq!("known".parse::<KnownFilter>(), Ok(KnownFilter::Known));
        assert_eq!("".parse::<KnownFilter>(), Ok(KnownFilter::All));
        assert!("friends".parse::<KnownFilter>().is_err());
    }

    #[test]
    fn test_local_day_bounds_span_a_day() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();
        let (start, end) = local_day_bounds(day);
        assert!(end > start);
        // DST transitions shift a day by at most an hour.
        assert!((end - start - Duration::hours(24)).num_minutes().abs() <= 60);
        assert_eq!(start.with_timezone(&Local).date_naive(), day);
    }

    #[test]
    fn test_event_confidence() {
        let mut event = DetectionEvent {
            id: EventId(1),
            matched_identity_id: None,
            matched_name: None,
            captured_at: Utc::now(),
            image_ref: String::new(),
            distance: 0.25,
            is_known: true,
        };
        assert!((event.confidence() - 0.75).abs() < 1e-6);
        event.distance = f32::INFINITY;
        assert_eq!(event.confidence(), 0.0);
    }
}
