//! Structural patch merge.
//!
//! Used for every partial-field update (relationship back-propagation and
//! storage upserts flagged `may_already_exist`). This is deliberately not the
//! semantic merge: no value is ever reconciled, only combined.
//!
//! - arrays: union, base order first, then unseen incoming elements
//! - objects: recursive merge key-by-key
//! - anything else: incoming wins

use crate::types::RelatedIds;
use crate::value::{Metadata, MetadataValue};

pub fn merge_value(base: &MetadataValue, incoming: &MetadataValue) -> MetadataValue {
    match (base, incoming) {
        (MetadataValue::Array(existing), MetadataValue::Array(new)) => {
            MetadataValue::Array(union_arrays(existing, new))
        }
        (MetadataValue::Object(existing), MetadataValue::Object(new)) => {
            MetadataValue::Object(merge_metadata(existing, new))
        }
        (_, new) => new.clone(),
    }
}

pub fn merge_metadata(base: &Metadata, incoming: &Metadata) -> Metadata {
    let mut merged = base.clone();
    for (key, new) in incoming {
        let value = match base.get(key) {
            Some(existing) => merge_value(existing, new),
            None => new.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

fn union_arrays(base: &[MetadataValue], incoming: &[MetadataValue]) -> Vec<MetadataValue> {
    let mut out = base.to_vec();
    for item in incoming {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Union two relationship adjacency maps.
pub fn merge_related_ids(base: &RelatedIds, incoming: &RelatedIds) -> RelatedIds {
    let mut merged = base.clone();
    for (object_type_id, ids) in incoming {
        merged
            .entry(object_type_id.clone())
            .or_default()
            .extend(ids.iter().copied());
    }
    merged
}
