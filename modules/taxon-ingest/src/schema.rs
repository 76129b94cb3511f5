//! Schema compiler: turns the configuration catalog into per-type prompt
//! descriptions and extraction schemas, and validates oracle output against
//! the latter.
//!
//! Compilation is pure and deterministic. It is recomputed on every run from
//! the catalog visible to the run's organisation and never shared between
//! organisations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use taxon_common::{FieldKind, Metadata, MetadataValue, ObjectCategory, SchemaCatalog};

use crate::error::SchemaViolation;

/// Prompt-facing description of one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDescription {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip)]
    pub category: ObjectCategory,
    pub fields: BTreeMap<String, FieldDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldShape {
    Scalar {
        kind: FieldKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enum_values: Option<Vec<String>>,
    },
    Array {
        items: Box<FieldSchema>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub description: String,
    pub shape: FieldShape,
    /// Non-required fields are nullable.
    pub required: bool,
    /// Upper bound: value for numbers, length for strings, element count for arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

impl FieldSchema {
    pub fn nullable(&self) -> bool {
        !self.required
    }

    fn kind_label(&self) -> &'static str {
        match &self.shape {
            FieldShape::Scalar { kind, .. } => kind.as_str(),
            FieldShape::Array { .. } => "array",
        }
    }

    /// JSON-schema rendering of this field for function-call parameters.
    pub fn to_json_schema(&self) -> Value {
        let type_name = self.kind_label();
        let mut schema = json!({
            "type": if self.nullable() { json!([type_name, "null"]) } else { json!(type_name) },
            "description": self.description,
        });

        match &self.shape {
            FieldShape::Scalar { kind, enum_values } => {
                if let Some(values) = enum_values {
                    let mut allowed: Vec<Value> = values.iter().map(|v| json!(v)).collect();
                    if self.nullable() {
                        allowed.push(Value::Null);
                    }
                    schema["enum"] = Value::Array(allowed);
                }
                if let Some(max) = self.max_value {
                    match kind {
                        FieldKind::Number => schema["maximum"] = json!(max),
                        FieldKind::String => schema["maxLength"] = json!(max as u64),
                        _ => {}
                    }
                }
            }
            FieldShape::Array { items } => {
                schema["items"] = items.to_json_schema();
                if let Some(max) = self.max_value {
                    schema["maxItems"] = json!(max as u64);
                }
            }
        }
        schema
    }

    fn validate(&self, field: &str, value: MetadataValue) -> Result<MetadataValue, SchemaViolation> {
        if value.is_null() {
            return if self.required {
                Err(SchemaViolation::MissingRequired(field.to_string()))
            } else {
                Ok(MetadataValue::Null)
            };
        }

        match &self.shape {
            FieldShape::Array { items } => {
                let MetadataValue::Array(elements) = value else {
                    return Err(self.wrong_type(field, &value));
                };
                if let Some(max) = self.max_value {
                    if elements.len() as f64 > max {
                        return Err(SchemaViolation::AboveMaximum {
                            field: field.to_string(),
                            max,
                            actual: elements.len() as f64,
                        });
                    }
                }
                let checked = elements
                    .into_iter()
                    .map(|element| items.validate(field, element))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MetadataValue::Array(checked))
            }
            FieldShape::Scalar { kind, enum_values } => {
                let kind_matches = matches!(
                    (kind, &value),
                    (FieldKind::String, MetadataValue::String(_))
                        | (FieldKind::Number, MetadataValue::Number(_))
                        | (FieldKind::Boolean, MetadataValue::Bool(_))
                        | (FieldKind::Object, MetadataValue::Object(_))
                );
                if !kind_matches {
                    return Err(self.wrong_type(field, &value));
                }

                if let (Some(allowed), Some(s)) = (enum_values, value.as_str()) {
                    if !allowed.iter().any(|a| a == s) {
                        return Err(SchemaViolation::NotInEnum {
                            field: field.to_string(),
                            value: s.to_string(),
                        });
                    }
                }

                if let Some(max) = self.max_value {
                    let actual = match &value {
                        MetadataValue::Number(n) => Some(*n),
                        MetadataValue::String(s) => Some(s.chars().count() as f64),
                        _ => None,
                    };
                    if let Some(actual) = actual.filter(|a| *a > max) {
                        return Err(SchemaViolation::AboveMaximum {
                            field: field.to_string(),
                            max,
                            actual,
                        });
                    }
                }
                Ok(value)
            }
        }
    }

    fn wrong_type(&self, field: &str, value: &MetadataValue) -> SchemaViolation {
        SchemaViolation::WrongType {
            field: field.to_string(),
            expected: self.kind_label(),
            found: value.kind_name(),
        }
    }
}

/// Extraction schema of one object type, keyed by field id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionSchema {
    pub object_type_id: String,
    pub fields: BTreeMap<String, FieldSchema>,
}

impl ExtractionSchema {
    /// Strict object schema: every property listed, no extra keys allowed.
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(id, field)| (id.clone(), field.to_json_schema()))
            .collect();
        let required: Vec<&String> = self.fields.keys().collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Check oracle output against the schema.
    ///
    /// The result holds exactly the schema's fields: unknown keys are dropped,
    /// missing nullable fields become null.
    pub fn validate(&self, output: Value) -> Result<Metadata, SchemaViolation> {
        let MetadataValue::Object(mut raw) = MetadataValue::from_json(output) else {
            return Err(SchemaViolation::NotAnObject("non-object value"));
        };

        let mut metadata = Metadata::new();
        for (id, field) in &self.fields {
            let value = raw.remove(id).unwrap_or(MetadataValue::Null);
            metadata.insert(id.clone(), field.validate(id, value)?);
        }

        if !raw.is_empty() {
            tracing::debug!(
                object_type_id = %self.object_type_id,
                dropped = ?raw.keys().collect::<Vec<_>>(),
                "Dropped fields outside the extraction schema"
            );
        }
        Ok(metadata)
    }
}

/// Per-run compilation of the catalog.
#[derive(Debug, Clone, Default)]
pub struct CompiledSchema {
    descriptions: BTreeMap<String, TypeDescription>,
    extraction: BTreeMap<String, ExtractionSchema>,
    /// Fields skipped because their field type is not in the catalog.
    pub unresolved_fields: Vec<String>,
}

impl CompiledSchema {
    pub fn compile(catalog: &SchemaCatalog) -> Self {
        let mut compiled = Self::default();

        for object_type in &catalog.object_types {
            let mut description = TypeDescription {
                id: object_type.id.clone(),
                name: object_type.name.clone(),
                description: object_type.description.clone(),
                category: object_type.category,
                fields: BTreeMap::new(),
            };
            let mut extraction = ExtractionSchema {
                object_type_id: object_type.id.clone(),
                fields: BTreeMap::new(),
            };

            for field in catalog.fields_for(&object_type.id).filter(|f| f.allow_ai_update) {
                let Some(field_type) = catalog.field_type(&field.field_type_id) else {
                    if !compiled.unresolved_fields.contains(&field.id) {
                        compiled.unresolved_fields.push(field.id.clone());
                    }
                    continue;
                };

                let enum_values = field.dictionary_term_type.as_deref().map(|term_type| {
                    catalog
                        .terms_of(term_type)
                        .map(|t| t.id.clone())
                        .collect::<Vec<_>>()
                });
                let scalar = FieldShape::Scalar {
                    kind: field_type.kind,
                    enum_values,
                };

                let schema = if field.is_array || field_type.is_array {
                    FieldSchema {
                        description: field.description.clone(),
                        shape: FieldShape::Array {
                            items: Box::new(FieldSchema {
                                description: field.name.clone(),
                                shape: scalar,
                                required: true,
                                max_value: None,
                            }),
                        },
                        required: field.is_required,
                        max_value: field.max_value,
                    }
                } else {
                    FieldSchema {
                        description: field.description.clone(),
                        shape: scalar,
                        required: field.is_required,
                        max_value: field.max_value,
                    }
                };

                description.fields.insert(
                    field.id.clone(),
                    FieldDescription {
                        description: field.description.clone(),
                    },
                );
                extraction.fields.insert(field.id.clone(), schema);
            }

            compiled.descriptions.insert(object_type.id.clone(), description);
            compiled.extraction.insert(object_type.id.clone(), extraction);
        }

        compiled
    }

    pub fn description(&self, object_type_id: &str) -> Option<&TypeDescription> {
        self.descriptions.get(object_type_id)
    }

    pub fn extraction_schema(&self, object_type_id: &str) -> Option<&ExtractionSchema> {
        self.extraction.get(object_type_id)
    }

    pub fn contains(&self, object_type_id: &str) -> bool {
        self.descriptions.contains_key(object_type_id)
    }

    pub fn descriptions(&self) -> impl Iterator<Item = &TypeDescription> {
        self.descriptions.values()
    }

    /// Types the classifier may pick. Signal and job types are only produced
    /// by the analysis pass, so they are never offered for inbound payloads.
    pub fn classification_candidates(&self) -> Vec<TypeDescription> {
        self.descriptions
            .values()
            .filter(|d| !d.category.is_derived())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_catalog;

    #[test]
    fn compile_is_deterministic() {
        let catalog = sample_catalog();
        let a = CompiledSchema::compile(&catalog);
        let b = CompiledSchema::compile(&catalog);
        assert_eq!(
            a.extraction_schema("feedback").unwrap().to_json_schema(),
            b.extraction_schema("feedback").unwrap().to_json_schema()
        );
    }

    #[test]
    fn non_ai_fields_are_omitted() {
        let compiled = CompiledSchema::compile(&sample_catalog());
        let feedback = compiled.extraction_schema("feedback").unwrap();

        assert!(feedback.fields.contains_key("title"));
        assert!(feedback.fields.contains_key("severity"));
        assert!(!feedback.fields.contains_key("internal_score"));
        assert!(!compiled.description("feedback").unwrap().fields.contains_key("internal_score"));
    }

    #[test]
    fn global_fields_apply_to_every_type() {
        let compiled = CompiledSchema::compile(&sample_catalog());
        assert!(compiled.extraction_schema("feedback").unwrap().fields.contains_key("tags"));
        assert!(compiled.extraction_schema("product").unwrap().fields.contains_key("tags"));
    }

    #[test]
    fn dictionary_fields_become_enums() {
        let compiled = CompiledSchema::compile(&sample_catalog());
        let schema = compiled.extraction_schema("feedback").unwrap().to_json_schema();
        let severity = &schema["properties"]["severity"];

        assert_eq!(severity["type"], json!(["string", "null"]));
        assert_eq!(severity["enum"], json!(["low", "medium", "high", "critical", null]));
    }

    #[test]
    fn strict_schema_requires_every_property() {
        let compiled = CompiledSchema::compile(&sample_catalog());
        let schema = compiled.extraction_schema("feedback").unwrap().to_json_schema();

        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["required"], json!(["severity", "tags", "title"]));
        assert_eq!(schema["properties"]["title"]["type"], json!("string"));
        assert_eq!(schema["properties"]["tags"]["type"], json!(["array", "null"]));
        assert_eq!(schema["properties"]["tags"]["items"]["type"], json!("string"));
    }

    #[test]
    fn derived_types_are_not_classification_candidates() {
        let compiled = CompiledSchema::compile(&sample_catalog());
        let ids: Vec<String> = compiled
            .classification_candidates()
            .into_iter()
            .map(|d| d.id)
            .collect();

        assert!(ids.contains(&"feedback".to_string()));
        assert!(ids.contains(&"message".to_string()));
        assert!(!ids.contains(&"signal".to_string()));
        assert!(!ids.contains(&"job".to_string()));
    }

    #[test]
    fn validate_fills_nullable_and_drops_unknown() {
        let compiled = CompiledSchema::compile(&sample_catalog());
        let schema = compiled.extraction_schema("feedback").unwrap();

        let metadata = schema
            .validate(json!({"title": "Login fails", "extra": 1}))
            .unwrap();

        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata["title"].as_str(), Some("Login fails"));
        assert!(metadata["severity"].is_null());
        assert!(metadata["tags"].is_null());
    }

    #[test]
    fn validate_rejects_bad_output() {
        let compiled = CompiledSchema::compile(&sample_catalog());
        let schema = compiled.extraction_schema("feedback").unwrap();

        assert_eq!(
            schema.validate(json!({"severity": "high"})),
            Err(SchemaViolation::MissingRequired("title".into()))
        );
        assert!(matches!(
            schema.validate(json!({"title": "x", "severity": "apocalyptic"})),
            Err(SchemaViolation::NotInEnum { .. })
        ));
        assert!(matches!(
            schema.validate(json!({"title": 12})),
            Err(SchemaViolation::WrongType { .. })
        ));
        assert!(matches!(
            schema.validate(json!(["title"])),
            Err(SchemaViolation::NotAnObject(_))
        ));
    }

    #[test]
    fn max_value_bounds_numbers_strings_and_arrays() {
        let number = FieldSchema {
            description: String::new(),
            shape: FieldShape::Scalar { kind: FieldKind::Number, enum_values: None },
            required: true,
            max_value: Some(10.0),
        };
        assert!(number.validate("n", MetadataValue::Number(10.0)).is_ok());
        assert!(number.validate("n", MetadataValue::Number(11.0)).is_err());

        let string = FieldSchema {
            shape: FieldShape::Scalar { kind: FieldKind::String, enum_values: None },
            max_value: Some(3.0),
            ..number.clone()
        };
        assert!(string.validate("s", "abc".into()).is_ok());
        assert!(string.validate("s", "abcd".into()).is_err());

        let array = FieldSchema {
            shape: FieldShape::Array { items: Box::new(string.clone()) },
            max_value: Some(1.0),
            ..number
        };
        assert!(array
            .validate("a", MetadataValue::Array(vec!["a".into(), "b".into()]))
            .is_err());
    }
}
