//! Plugin manifest validation
//!
//! Manifests are checked against an embedded JSON Schema before they are
//! deserialized, so operators get every structural problem at once with
//! its location instead of the first serde failure.

use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

const MANIFEST_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "confhub plugin manifest",
  "type": "object",
  "properties": {
    "plugins": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["type", "name"],
        "properties": {
          "type": { "type": "string", "minLength": 1, "pattern": "^[^.]+$" },
          "name": { "type": "string", "minLength": 1 },
          "enabled": { "type": "boolean" },
          "active": { "type": "boolean" },
          "configs": { "type": "object" },
          "params": { "type": "object" },
          "disabled_repositories": {
            "type": "array",
            "items": { "type": "string" }
          }
        },
        "additionalProperties": false
      }
    }
  }
}"#;

/// Schema for validating plugin manifests
#[derive(Debug, Clone)]
pub struct ManifestSchema {
    compiled: Arc<jsonschema::Validator>,
}

static MANIFEST: OnceLock<std::result::Result<ManifestSchema, Error>> = OnceLock::new();

impl ManifestSchema {
    /// The built-in manifest schema, compiled once per process
    pub fn get() -> Result<&'static ManifestSchema> {
        MANIFEST
            .get_or_init(|| Self::from_json(MANIFEST_SCHEMA))
            .as_ref()
            .map_err(Clone::clone)
    }

    fn from_json(json: &str) -> Result<Self> {
        let schema: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::internal(format!("Invalid manifest schema JSON: {}", e)))?;
        let compiled = jsonschema::validator_for(&schema)
            .map_err(|e| Error::internal(format!("Invalid manifest schema: {}", e)))?;
        Ok(Self {
            compiled: Arc::new(compiled),
        })
    }

    /// Validate a manifest document, reporting every violation
    pub fn validate(&self, document: &serde_json::Value) -> Result<()> {
        let violations: Vec<String> = self
            .compiled
            .iter_errors(document)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::validation("", violations.join("\n  ")))
        }
    }
}
