use super::aligner::IndexAligner;
use super::error::InvariantViolation;
use super::registry::ClassIdentityRegistry;
use super::table::EmbeddingTable;
use super::utils::ZERO_NORM;

/// Allowed distance of a non-zero row norm from 1.0
pub const NORM_TOLERANCE: f32 = 1e-5;

/// Checks the invariants that tie registry, table and aligner together.
pub struct ConsistencyValidator;

impl ConsistencyValidator {
    /// Verifies one generation.
    ///
    /// Checks, in order:
    /// 1. Registry size, table rows and both aligner maps have equal cardinality
    /// 2. The registry's forward and reverse maps have equal size
    /// 3. Every row maps to a class that maps back to the same row
    /// 4. Every registered class has a row
    /// 5. Every table value is finite
    /// 6. Every non-zero row has unit norm
    ///
    /// # Errors
    /// - The first `InvariantViolation` found
    pub fn check(
        registry: &ClassIdentityRegistry,
        table: &EmbeddingTable,
        aligner: &IndexAligner,
    ) -> Result<(), InvariantViolation> {
        let cardinality = InvariantViolation::Cardinality {
            registry: registry.len(),
            table_rows: table.rows(),
            row_to_class: aligner.row_to_class().len(),
            class_to_row: aligner.class_to_row().len(),
        };
        let rows = table.rows();
        if registry.len() != rows
            || registry.reverse_len() != rows
            || aligner.row_to_class().len() != rows
            || aligner.class_to_row().len() != rows
        {
            return Err(cardinality);
        }

        for (row, &class_id) in aligner.row_to_class().iter().enumerate() {
            match aligner.class_to_row().get(&class_id) {
                Some(&back) if back == row => {}
                _ => return Err(InvariantViolation::NotInverse { row, class_id }),
            }
        }

        for (&class_id, &row) in aligner.class_to_row() {
            if row >= rows {
                return Err(InvariantViolation::RowOutOfRange { row, rows });
            }
            if !registry.contains(class_id) {
                return Err(InvariantViolation::NotInverse { row, class_id });
            }
        }

        if let Some(&missing) = registry.order().iter().find(|id| aligner.row_of(**id).is_none()) {
            return Err(InvariantViolation::MissingClass(missing));
        }

        for (row, values) in table.view().outer_iter().enumerate() {
            if let Some(column) = values.iter().position(|v| !v.is_finite()) {
                return Err(InvariantViolation::NonFinite { row, column });
            }
        }

        for (row, norm) in table.row_norms().into_iter().enumerate() {
            if !norm.is_finite() || (f64::from(norm) > ZERO_NORM && (norm - 1.0).abs() > NORM_TOLERANCE) {
                return Err(InvariantViolation::NotNormalized { row, norm });
            }
        }

        Ok(())
    }

    /// Like [`check`](Self::check), also requiring the table to have `dim` columns
    pub fn check_with_dim(
        registry: &ClassIdentityRegistry,
        table: &EmbeddingTable,
        aligner: &IndexAligner,
        dim: Option<usize>,
    ) -> Result<(), InvariantViolation> {
        Self::check(registry, table, aligner)?;
        match dim {
            Some(expected) if table.rows() > 0 && table.dim() != expected => Err(InvariantViolation::Dimension {
                expected,
                actual: table.dim(),
            }),
            _ => Ok(()),
        }
    }
}
