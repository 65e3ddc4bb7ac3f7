use std::collections::HashMap;

use super::error::DecodeError;
use super::registry::ClassIdentityRegistry;

/// Bijection between embedding-table rows and class ids.
///
/// Rows are assigned in ascending numeric class-id order. The registry's
/// first-seen order is only used for presentation; every row-indexed
/// structure in the crate follows this ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexAligner {
    row_to_class: Vec<u32>,
    class_to_row: HashMap<u32, usize>,
}

impl IndexAligner {
    /// Derives the alignment for every class the registry knows
    pub fn align(registry: &ClassIdentityRegistry) -> Self {
        let mut row_to_class = registry.order().to_vec();
        row_to_class.sort_unstable();
        let class_to_row = row_to_class
            .iter()
            .enumerate()
            .map(|(row, &class_id)| (class_id, row))
            .collect();
        Self {
            row_to_class,
            class_to_row,
        }
    }

    /// Maps a detector row index back to a class id.
    ///
    /// # Errors
    /// - `DecodeError` if `row` has no class; nothing is clamped
    pub fn decode(&self, row: usize) -> Result<u32, DecodeError> {
        self.row_to_class.get(row).copied().ok_or(DecodeError {
            row,
            rows: self.row_to_class.len(),
        })
    }

    pub fn row_of(&self, class_id: u32) -> Option<usize> {
        self.class_to_row.get(&class_id).copied()
    }

    /// Class ids in row order
    pub fn row_to_class(&self) -> &[u32] {
        &self.row_to_class
    }

    pub fn class_to_row(&self) -> &HashMap<u32, usize> {
        &self.class_to_row
    }

    pub fn len(&self) -> usize {
        self.row_to_class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_to_class.is_empty()
    }

    /// Two alignments describe the same class set in the same row order
    pub fn same_classes(&self, other: &IndexAligner) -> bool {
        self.row_to_class == other.row_to_class
    }
}
