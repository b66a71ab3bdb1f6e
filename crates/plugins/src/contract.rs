//! Parameter contracts
//!
//! A manifest declares each parameter either as a short string such as
//! `"string: who to greet"` / `"integer? page size"` or as an object
//! `{"type": "integer", "description": "...", "required": false}`.
//! The same contract documents the action for the model and guards the
//! executor against obviously wrong input.

use crate::error::ExecutorError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Accepted JSON type of one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamType {
    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "string" | "str" => Some(ParamType::String),
            "number" | "float" => Some(ParamType::Number),
            "integer" | "int" => Some(ParamType::Integer),
            "boolean" | "bool" => Some(ParamType::Boolean),
            "object" | "dict" => Some(ParamType::Object),
            "array" | "list" => Some(ParamType::Array),
            "any" => Some(ParamType::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Manifest form of a parameter declaration
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawParameter {
    Short(String),
    Detailed {
        #[serde(rename = "type")]
        ty: Option<String>,
        #[serde(default)]
        description: String,
        required: Option<bool>,
    },
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub ty: ParamType,
    pub description: String,
    pub required: bool,
}

impl ParameterSpec {
    /// Parse the short string form.
    ///
    /// A leading type word is optional; a `?` suffix on it, or the word
    /// "optional" anywhere in the text, marks the parameter optional.
    pub fn parse_short(text: &str) -> Self {
        let text = text.trim();
        let head_end = text
            .find(|c: char| c.is_whitespace() || c == ':')
            .unwrap_or(text.len());
        let head = &text[..head_end];
        let (word, marked) = match head.strip_suffix('?') {
            Some(word) => (word, true),
            None => (head, false),
        };

        let (ty, description, marked) = match ParamType::from_word(word) {
            Some(ty) => {
                let rest = text[head_end..]
                    .trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '-')
                    .trim_end();
                (ty, rest.to_string(), marked)
            }
            None => (ParamType::Any, text.to_string(), false),
        };

        let required = !(marked || description.to_ascii_lowercase().contains("optional"));
        Self {
            ty,
            description,
            required,
        }
    }

    fn from_raw(name: &str, raw: RawParameter) -> std::result::Result<Self, String> {
        match raw {
            RawParameter::Short(text) => Ok(Self::parse_short(&text)),
            RawParameter::Detailed {
                ty,
                description,
                required,
            } => {
                let ty = match ty {
                    Some(word) => ParamType::from_word(&word).ok_or_else(|| {
                        format!("parameter '{}' has unknown type '{}'", name, word)
                    })?,
                    None => ParamType::Any,
                };
                Ok(Self {
                    ty,
                    description,
                    required: required.unwrap_or(true),
                })
            }
        }
    }

    /// Compact model-facing form, e.g. `string, required: who to greet`
    pub fn summary(&self) -> String {
        let need = if self.required { "required" } else { "optional" };
        if self.description.is_empty() {
            format!("{}, {}", self.ty, need)
        } else {
            format!("{}, {}: {}", self.ty, need, self.description)
        }
    }
}

/// Parameter name to declaration, in name order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterContract {
    params: BTreeMap<String, ParameterSpec>,
}

impl ParameterContract {
    pub(crate) fn from_raw(
        raw: BTreeMap<String, RawParameter>,
    ) -> std::result::Result<Self, String> {
        let mut params = BTreeMap::new();
        for (name, param) in raw {
            if name.trim().is_empty() {
                return Err("parameter name is empty".to_string());
            }
            let spec = ParameterSpec::from_raw(&name, param)?;
            params.insert(name, spec);
        }
        Ok(Self { params })
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterSpec)> {
        self.params.iter()
    }

    /// Check `args` against the contract. Undeclared arguments pass through.
    pub fn validate(&self, args: &Value) -> std::result::Result<(), ExecutorError> {
        let empty = Map::new();
        let map = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(ExecutorError::ArgumentInvalid {
                    field: "arguments".to_string(),
                    reason: format!("expected an object, got {}", json_type_name(other)),
                })
            }
        };

        for (name, spec) in &self.params {
            match map.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ExecutorError::ArgumentInvalid {
                            field: name.clone(),
                            reason: "required argument missing".to_string(),
                        });
                    }
                }
                Some(value) if !spec.ty.accepts(value) => {
                    return Err(ExecutorError::ArgumentInvalid {
                        field: name.clone(),
                        reason: format!("expected {}, got {}", spec.ty, json_type_name(value)),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// `{"name": "<summary>"}` object for prompt listings
    pub fn to_prompt_json(&self) -> Value {
        let map: Map<String, Value> = self
            .params
            .iter()
            .map(|(name, spec)| (name.clone(), Value::String(spec.summary())))
            .collect();
        Value::Object(map)
    }
}
