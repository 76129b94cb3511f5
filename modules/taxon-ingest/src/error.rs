//! Typed errors for the ingestion pipeline.

use thiserror::Error;

use crate::request::ItemWarning;
use crate::session::Stage;

/// Failure taxonomy of a batch call.
///
/// `OrganisationResolution` and `Catalog` are fatal to the whole call and are
/// raised before any item runs. Everything else aborts only the current item.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("could not resolve organisation: {0}")]
    OrganisationResolution(String),

    #[error("could not load schema catalog: {0}")]
    Catalog(String),

    #[error("classification failed: {0}")]
    Classification(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Non-fatal: logged and surfaced as a warning, the item proceeds without a parent.
    #[error("parent resolution failed: {0}")]
    ParentResolution(String),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("batch deadline exceeded during {0}")]
    Cancelled(Stage),

    #[error("{} of {total} items failed: {}", failures.len(), failures.join("; "))]
    PartialBatchFailure { total: usize, failures: Vec<String> },
}

impl IngestError {
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }

    /// Non-fatal errors become a warning on the stored item; anything else is
    /// handed back.
    pub fn into_warning(self) -> Result<ItemWarning, Self> {
        match self {
            Self::ParentResolution(reason) => Ok(ItemWarning::ParentResolution { reason }),
            other => Err(other),
        }
    }

    /// Whether the error aborts the whole batch rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OrganisationResolution(_) | Self::Catalog(_))
    }
}

/// Violation of a compiled extraction schema by oracle output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaViolation {
    #[error("expected an object of fields, got {0}")]
    NotAnObject(&'static str),

    #[error("required field `{0}` is missing or null")]
    MissingRequired(String),

    #[error("field `{field}` expected {expected}, got {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("field `{field}` value {value} is not one of the allowed terms")]
    NotInEnum { field: String, value: String },

    #[error("field `{field}` exceeds maximum {max} (got {actual})")]
    AboveMaximum { field: String, max: f64, actual: f64 },
}
