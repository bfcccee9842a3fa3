//! Data-driven parameter schemas for node types.
//!
//! The parameter schema is data, not compile-time types: each node type in
//! the registry declares a list of `ParamDef` records, and the validator
//! checks node parameters against them. Strings containing `{{ … }}` are
//! expressions and skip static type checking (they resolve at run time).

use crate::expression::is_expression;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The declared type of a node parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    /// A string that must parse as an http(s) URL.
    Url,
    /// A string that must parse as a cron expression.
    Cron,
    /// A raw expression; always accepted as a string.
    Expression,
}

/// Declaration of a single node parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    /// Parameter name.
    pub name: String,
    /// Expected value type.
    pub kind: ParamKind,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Default applied when the parameter is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    /// Permitted values, for enum-like parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl ParamDef {
    /// Creates a required parameter.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            options: None,
        }
    }

    /// Creates an optional parameter.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            options: None,
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Restricts the parameter to an enumerated set of string values.
    #[must_use]
    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = Some(options.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Statically checks a parameter value against this definition.
    ///
    /// Expression strings are accepted for any kind; they are resolved and
    /// re-checked at run time.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value does not conform.
    pub fn check(&self, value: &JsonValue) -> Result<(), String> {
        if let JsonValue::String(s) = value
            && is_expression(s)
        {
            return Ok(());
        }

        if let Some(options) = &self.options {
            let JsonValue::String(s) = value else {
                return Err(format!("parameter '{}' must be one of {:?}", self.name, options));
            };
            if !options.iter().any(|o| o == s) {
                return Err(format!(
                    "parameter '{}' has value '{s}' outside permitted set {:?}",
                    self.name, options
                ));
            }
            return Ok(());
        }

        match self.kind {
            ParamKind::String | ParamKind::Expression => match value {
                JsonValue::String(_) => Ok(()),
                _ => Err(format!("parameter '{}' must be a string", self.name)),
            },
            ParamKind::Number => match value {
                JsonValue::Number(_) => Ok(()),
                _ => Err(format!("parameter '{}' must be a number", self.name)),
            },
            ParamKind::Boolean => match value {
                JsonValue::Bool(_) => Ok(()),
                _ => Err(format!("parameter '{}' must be a boolean", self.name)),
            },
            ParamKind::Array => match value {
                JsonValue::Array(_) => Ok(()),
                _ => Err(format!("parameter '{}' must be an array", self.name)),
            },
            ParamKind::Object => match value {
                JsonValue::Object(_) => Ok(()),
                _ => Err(format!("parameter '{}' must be an object", self.name)),
            },
            ParamKind::Url => {
                let JsonValue::String(s) = value else {
                    return Err(format!("parameter '{}' must be a URL string", self.name));
                };
                if s.starts_with("http://") || s.starts_with("https://") {
                    Ok(())
                } else {
                    Err(format!("parameter '{}' must be an http(s) URL", self.name))
                }
            }
            ParamKind::Cron => {
                let JsonValue::String(s) = value else {
                    return Err(format!("parameter '{}' must be a cron string", self.name));
                };
                // The cron crate expects a 6/7-field expression with seconds;
                // workflow definitions use the 5-field form.
                let with_seconds = format!("0 {s}");
                match with_seconds.parse::<cron::Schedule>() {
                    Ok(_) => Ok(()),
                    Err(e) => Err(format!("parameter '{}' is not a valid cron expression: {e}", self.name)),
                }
            }
        }
    }
}
