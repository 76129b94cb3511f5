use tracing::debug;

use crate::error::IngestError;
use crate::schema::CompiledSchema;
use crate::traits::Oracle;

/// Pick the object type of `payload`.
///
/// A hint is trusted and returned without consulting the oracle, but it must
/// still name a type visible to the run. Oracle answers outside the candidate
/// set are rejected.
pub async fn classify(
    oracle: &dyn Oracle,
    schema: &CompiledSchema,
    payload: &serde_json::Value,
    hint: Option<&str>,
) -> Result<String, IngestError> {
    if let Some(hint) = hint {
        if !schema.contains(hint) {
            return Err(IngestError::Classification(format!(
                "hinted object type `{hint}` is not in the catalog"
            )));
        }
        debug!(object_type_id = %hint, "Using hinted object type");
        return Ok(hint.to_string());
    }

    let candidates = schema.classification_candidates();
    if candidates.is_empty() {
        return Err(IngestError::Classification(
            "no object types available for classification".into(),
        ));
    }

    let answer = oracle
        .classify(&candidates, payload)
        .await
        .map_err(|e| IngestError::Classification(format!("{e:#}")))?;
    let answer = answer.trim();

    if candidates.iter().any(|c| c.id == answer) {
        debug!(object_type_id = %answer, "Classified payload");
        Ok(answer.to_string())
    } else {
        Err(IngestError::Classification(format!(
            "oracle answered `{answer}`, which is not a candidate type"
        )))
    }
}
