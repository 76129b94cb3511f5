//! Ingestion entrypoint request and response types.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use taxon_common::{ObjectRecord, RelatedIds, RelatedRef};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct IngestHints {
    /// Trusted type id; skips classification.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub object_type_id: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub parent_object_id: Option<Uuid>,
    /// Free-text guidance passed to extraction.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub data_description: Option<String>,
    /// Enables dedup; similarity needed to merge into an existing record.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub required_match_threshold: Option<f64>,
    #[builder(default)]
    #[serde(default)]
    pub new_related_ids: RelatedIds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[builder(setter(into))]
    pub connection_id: String,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub organisation_id: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub dry_run: bool,
    pub payload: serde_json::Value,
    #[builder(default)]
    #[serde(default)]
    pub hints: IngestHints,
}

impl IngestRequest {
    /// Items of the batch: a JSON array payload is flattened, anything else
    /// is a single item.
    pub fn items(&self) -> Vec<serde_json::Value> {
        let mut items = Vec::new();
        flatten_into(&self.payload, &mut items);
        items
    }
}

fn flatten_into(value: &serde_json::Value, out: &mut Vec<serde_json::Value>) {
    match value {
        serde_json::Value::Array(elements) => {
            for element in elements {
                flatten_into(element, out);
            }
        }
        other => out.push(other.clone()),
    }
}

/// Non-fatal degradation recorded on a stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemWarning {
    ParentResolution { reason: String },
    /// A caller-supplied related id was dropped before linking.
    RelatedIdRejected { peer: RelatedRef, reason: String },
    Propagation { peer: RelatedRef, error: String },
    Analysis { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    #[serde(rename_all = "camelCase")]
    Stored {
        index: usize,
        id: Uuid,
        object_type_id: String,
        merged: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<ItemWarning>,
    },
    Previewed {
        index: usize,
        record: ObjectRecord,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<ItemWarning>,
    },
    Failed {
        index: usize,
        error: String,
    },
}

impl ItemOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Stored { index, .. } | Self::Previewed { index, .. } | Self::Failed { index, .. } => {
                *index
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

pub const STATUS_OK: u16 = 200;
pub const STATUS_FAILED: u16 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub status: u16,
    pub message: String,
    /// Dry-run previews, in item order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<ObjectRecord>>,
    #[serde(default)]
    pub outcomes: Vec<ItemOutcome>,
}

impl IngestResponse {
    /// Response for an error raised before any item ran.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILED,
            message: message.into(),
            data: None,
            outcomes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn stored_ids(&self) -> Vec<Uuid> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ItemOutcome::Stored { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<&ItemOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure()).collect()
    }
}
