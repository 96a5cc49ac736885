//! Nearest-neighbour matching of a query descriptor against the gallery.

use crate::types::{Descriptor, PersonId};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("query has {actual} dimensions, gallery index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Result of matching a query descriptor against a [`FaceIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, or `None` when the nearest entry is beyond threshold.
    pub person_id: Option<PersonId>,
    /// Distance to the nearest gallery entry, reported even when unmatched.
    /// `f32::INFINITY` for an empty gallery.
    pub distance: f32,
}

impl MatchResult {
    pub fn is_known(&self) -> bool {
        self.person_id.is_some()
    }

    /// Display confidence in [0, 1]: `1 - distance`, clamped.
    pub fn confidence(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// Immutable, matcher-ready snapshot of the gallery.
///
/// Entries are held in ascending [`PersonId`] order, which fixes the
/// tie-break between equidistant identities. An index is never mutated; a
/// gallery change produces a new index that replaces the old one whole.
#[derive(Debug, Clone, Default)]
pub struct FaceIndex {
    entries: Vec<(PersonId, Descriptor)>,
    dimension: Option<usize>,
}

impl FaceIndex {
    /// Build an index from gallery entries.
    ///
    /// The dimensionality of the first entry (in id order) wins; entries
    /// with a different length are left out and logged.
    pub fn build(gallery: impl IntoIterator<Item = (PersonId, Descriptor)>) -> Self {
        let mut entries: Vec<(PersonId, Descriptor)> = gallery.into_iter().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.dedup_by_key(|(id, _)| *id);

        let dimension = entries.first().map(|(_, d)| d.len());
        if let Some(dim) = dimension {
            entries.retain(|(id, d)| {
                let keep = d.len() == dim;
                if !keep {
                    tracing::warn!(
                        person_id = %id,
                        expected = dim,
                        actual = d.len(),
                        "skipping gallery entry with mismatched descriptor length"
                    );
                }
                keep
            });
        }

        Self { entries, dimension }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor dimensionality the index accepts (`None` when empty).
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Classify `query` against every entry.
    ///
    /// The nearest entry is a match iff its distance is `<= threshold`.
    /// Equidistant entries resolve to the lowest id.
    pub fn find_best(&self, query: &Descriptor, threshold: f32) -> Result<MatchResult, MatchError> {
        if let Some(expected) = self.dimension {
            if query.len() != expected {
                return Err(MatchError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut best_distance = f32::INFINITY;
        let mut best_id: Option<PersonId> = None;

        for (id, descriptor) in &self.entries {
            let distance = query.euclidean_distance(descriptor);
            // Strict comparison keeps the first (lowest id) entry on ties.
            if distance < best_distance {
                best_distance = distance;
                best_id = Some(*id);
            }
        }

        Ok(MatchResult {
            person_id: best_id.filter(|_| best_distance <= threshold),
            distance: best_distance,
        })
    }
}
