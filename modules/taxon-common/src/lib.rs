pub mod config;
pub mod error;
pub mod patch;
pub mod types;
pub mod value;

pub use config::{Config, FileConfig, IngestConfig, ModelsConfig};
pub use error::TaxonError;
pub use patch::{merge_metadata, merge_related_ids, merge_value};
pub use types::*;
pub use value::{metadata_from_json, metadata_to_json, Metadata, MetadataValue};
