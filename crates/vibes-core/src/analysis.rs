//! Shape of an enrichment result and its validation.

use serde_json::{Value, json};

use crate::error::AppError;

pub const SENTIMENTS: &[&str] = &["Positive", "Neutral", "Negative", "Mixed"];

/// JSON Schema every enrichment payload must satisfy before it is cached.
pub fn analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "core_themes": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 },
                "minItems": 1,
                "maxItems": 10
            },
            "overall_sentiment": {
                "type": "string",
                "enum": SENTIMENTS
            },
            "one_sentence_summary": {
                "type": "string",
                "minLength": 1
            }
        },
        "required": ["core_themes", "overall_sentiment", "one_sentence_summary"]
    })
}

/// Compiled [`analysis_schema`].
pub struct AnalysisValidator {
    validator: jsonschema::Validator,
}

impl AnalysisValidator {
    pub fn new() -> Result<Self, AppError> {
        Self::with_schema(&analysis_schema())
    }

    pub fn with_schema(schema: &Value) -> Result<Self, AppError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| AppError::SchemaValidationError(format!("invalid schema: {e}")))?;
        Ok(Self { validator })
    }

    pub fn validate(&self, value: &Value) -> Result<(), AppError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::SchemaValidationError(errors.join("; ")))
        }
    }
}
