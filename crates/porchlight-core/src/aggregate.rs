//! Reduces the descriptors captured during one enrollment to a single
//! representative descriptor.

use crate::types::Descriptor;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AggregateError {
    #[error("no descriptors to aggregate")]
    EmptyInput,
    #[error("descriptor {index} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Element-wise arithmetic mean of all input descriptors.
pub fn aggregate(descriptors: &[Descriptor]) -> Result<Descriptor, AggregateError> {
    let first = descriptors.first().ok_or(AggregateError::EmptyInput)?;
    let dim = first.len();

    // Accumulate in f64 so long enrollments don't drift.
    let mut sums = vec![0.0f64; dim];
    for (index, descriptor) in descriptors.iter().enumerate() {
        if descriptor.len() != dim {
            return Err(AggregateError::DimensionMismatch {
                index,
                expected: dim,
                actual: descriptor.len(),
            });
        }
        for (sum, v) in sums.iter_mut().zip(descriptor.values()) {
            *sum += f64::from(*v);
        }
    }

    let n = descriptors.len() as f64;
    Ok(Descriptor::new(
        sums.into_iter().map(|s| (s / n) as f32).collect(),
    ))
}
