use taxon_common::Metadata;

use crate::error::IngestError;
use crate::schema::ExtractionSchema;
use crate::traits::{Oracle, OracleOutput};

/// Turn a raw payload into metadata conforming to `schema`.
pub async fn extract(
    oracle: &dyn Oracle,
    schema: &ExtractionSchema,
    payload: &serde_json::Value,
    guidance: Option<&str>,
) -> Result<Metadata, IngestError> {
    let output = oracle
        .extract(schema, payload, guidance)
        .await
        .map_err(|e| IngestError::Extraction(format!("{e:#}")))?;

    admit(schema, output).map_err(IngestError::Extraction)
}

/// Accept only function-shaped replies that satisfy the schema.
pub(crate) fn admit(schema: &ExtractionSchema, output: OracleOutput) -> Result<Metadata, String> {
    match output {
        OracleOutput::Function(value) => schema.validate(value).map_err(|e| e.to_string()),
        OracleOutput::Text(text) => Err(format!(
            "oracle replied with free text instead of structured output: {}",
            text.chars().take(120).collect::<String>()
        )),
    }
}
