//! Plugin configuration schema and validation.
//!
//! The same schema is applied at install time and whenever the configuration
//! is updated, so both paths accept and reject exactly the same values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A flat JSON object of configuration values.
pub type ConfigMap = serde_json::Map<String, Value>;

/// Value type a configuration field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ConfigType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Declaration of a single configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    #[serde(rename = "type")]
    pub field_type: ConfigType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values, if restricted.
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Lower bound: numeric value for numbers, length for strings and arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound: numeric value for numbers, length for strings and arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ConfigField {
    pub fn new(field_type: ConfigType) -> Self {
        Self {
            field_type,
            required: false,
            default: None,
            allowed: None,
            min: None,
            max: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.allowed = Some(values);
        self
    }

    #[must_use]
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    fn check(&self, key: &str, value: &Value, issues: &mut Vec<ConfigIssue>) {
        if !self.field_type.matches(value) {
            issues.push(ConfigIssue::new(
                key,
                format!("expected {}, got {}", self.field_type.as_str(), json_type(value)),
            ));
            return;
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                issues.push(ConfigIssue::new(key, format!("value {value} is not one of the allowed values")));
            }
        }

        let measured = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(a) => Some(a.len() as f64),
            _ => None,
        };
        let Some(measured) = measured else { return };
        let unit = if value.is_number() { "value" } else { "length" };

        if let Some(min) = self.min {
            if measured < min {
                issues.push(ConfigIssue::new(key, format!("{unit} {measured} is below minimum {min}")));
            }
        }
        if let Some(max) = self.max {
            if measured > max {
                issues.push(ConfigIssue::new(key, format!("{unit} {measured} is above maximum {max}")));
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One reason a configuration was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigIssue {
    pub key: String,
    pub message: String,
}

impl ConfigIssue {
    fn new(key: &str, message: String) -> Self {
        Self {
            key: key.to_string(),
            message,
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Mapping from configuration key to its declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    fields: BTreeMap<String, ConfigField>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, field: ConfigField) -> Self {
        self.fields.insert(key.into(), field);
        self
    }

    pub fn fields(&self) -> &BTreeMap<String, ConfigField> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&ConfigField> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field-level defaults declared in the schema.
    pub fn defaults(&self) -> ConfigMap {
        self.fields
            .iter()
            .filter_map(|(k, f)| f.default.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Builds the effective configuration and validates it.
    ///
    /// Precedence, lowest first: schema field defaults, the manifest's
    /// `default_config`, then caller overrides.
    pub fn resolve(
        &self,
        manifest_defaults: &ConfigMap,
        overrides: &ConfigMap,
    ) -> Result<ConfigMap, Vec<ConfigIssue>> {
        let mut effective = self.defaults();
        for (k, v) in manifest_defaults.iter().chain(overrides.iter()) {
            effective.insert(k.clone(), v.clone());
        }

        let issues = self.validate(&effective);
        if issues.is_empty() {
            Ok(effective)
        } else {
            Err(issues)
        }
    }

    /// Checks a complete configuration; returns every problem found.
    ///
    /// An empty schema accepts any object.
    pub fn validate(&self, config: &ConfigMap) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.fields.is_empty() {
            return issues;
        }

        for (key, field) in &self.fields {
            match config.get(key) {
                Some(value) => field.check(key, value, &mut issues),
                None if field.required => {
                    issues.push(ConfigIssue::new(key, "required value is missing".to_string()));
                }
                None => {}
            }
        }

        for key in config.keys() {
            if !self.fields.contains_key(key) {
                issues.push(ConfigIssue::new(key, "unknown configuration key".to_string()));
            }
        }

        issues
    }
}
