use anyhow::{Context, Result};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Reply of a forced selection call (`select_object_type`, `select_match`):
/// a flat object whose `FIELD` names one of a fixed set of values.
pub(crate) trait Selection: JsonSchema + DeserializeOwned {
    /// Property carrying the selected value.
    const FIELD: &'static str;

    fn into_selected(self) -> String;

    /// Strict-mode parameters: every property required, no extra keys, and
    /// `FIELD` limited to `allowed`.
    fn parameters(allowed: &[String]) -> Result<Value> {
        let root = schema_for!(Self);
        let properties = root.schema.object.map(|o| o.properties).unwrap_or_default();
        let required: Vec<&String> = properties.keys().collect();

        let mut properties =
            serde_json::to_value(&properties).context("Failed to render reply schema")?;
        if let Some(field) = properties.get_mut(Self::FIELD).and_then(Value::as_object_mut) {
            field.insert("enum".to_string(), json!(allowed));
        }

        Ok(json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct Pick {
        /// Chosen colour.
        colour: String,
        note: Option<String>,
    }

    impl Selection for Pick {
        const FIELD: &'static str = "colour";

        fn into_selected(self) -> String {
            self.colour
        }
    }

    #[test]
    fn selected_field_is_pinned_to_allowed_values() {
        let schema = Pick::parameters(&["red".to_string(), "blue".to_string()]).unwrap();

        assert_eq!(schema["properties"]["colour"]["enum"], json!(["red", "blue"]));
        assert_eq!(schema["properties"]["colour"]["description"], "Chosen colour.");
        assert!(schema["properties"]["note"].get("enum").is_none());
    }

    #[test]
    fn every_property_is_required_and_closed() {
        let schema = Pick::parameters(&[]).unwrap();

        assert_eq!(schema["required"], json!(["colour", "note"]));
        assert_eq!(schema["additionalProperties"], Value::Bool(false));
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
    }
}
