use serde_json::{json, Value};

use taxon_common::{Metadata, ObjectRecord};

use crate::schema::TypeDescription;

pub(crate) const CLASSIFY_SYSTEM: &str = "\
You sort inbound data into an organisation's object types.
Read the payload and the candidate types, then call select_object_type with the
single type whose description best fits the payload. Always choose one of the
listed ids.";

pub(crate) const EXTRACT_SYSTEM: &str = "\
You extract structured metadata from inbound data.
Call record_object with values taken from the payload. Use null for any field
the payload does not support; never invent values. Respect the allowed values
and limits stated in each field's schema.";

pub(crate) const MERGE_SYSTEM: &str = "\
You reconcile two versions of the same object.
Call record_object with a single object that keeps every fact from the existing
version and adds or corrects facts from the incoming version. Prefer the
incoming value when both disagree about the same fact. Combine list fields
without duplicates.";

pub(crate) const MATCH_SYSTEM: &str = "\
You link a new object to an existing parent object.
Call select_match with the id of the candidate that the new object most likely
belongs to, or \"none\" if no candidate is a plausible match.";

pub(crate) const ANALYSIS_SYSTEM: &str = "\
You analyse newly stored objects for an organisation.
Use the tools to look up related objects and to record derived signals or jobs
when the object warrants them. Only record something when the object gives
clear evidence for it. Finish with a short plain-text summary.";

/// Truncate to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

pub(crate) fn render_payload(payload: &Value, max_chars: usize) -> String {
    let text = serde_json::to_string_pretty(payload).unwrap_or_default();
    truncate_to_char_boundary(&text, max_chars).to_string()
}

pub(crate) fn classify_prompt(candidates: &[TypeDescription], payload: &str) -> String {
    let types = serde_json::to_string_pretty(candidates).unwrap_or_default();
    format!("## Candidate types\n{types}\n\n## Payload\n{payload}")
}

pub(crate) fn extract_prompt(payload: &str, guidance: Option<&str>) -> String {
    match guidance {
        Some(guidance) => format!("## What this data is\n{guidance}\n\n## Payload\n{payload}"),
        None => format!("## Payload\n{payload}"),
    }
}

pub(crate) fn merge_prompt(existing: &Metadata, incoming: &Metadata) -> String {
    let existing = serde_json::to_string_pretty(existing).unwrap_or_default();
    let incoming = serde_json::to_string_pretty(incoming).unwrap_or_default();
    format!("## Existing\n{existing}\n\n## Incoming\n{incoming}")
}

pub(crate) fn match_prompt(candidates: &[ObjectRecord], target: &str) -> String {
    let listed: Vec<Value> = candidates
        .iter()
        .map(|c| json!({"id": c.id, "metadata": c.metadata}))
        .collect();
    let listed = serde_json::to_string_pretty(&listed).unwrap_or_default();
    format!("## Candidates\n{listed}\n\n## New object\n{target}")
}
