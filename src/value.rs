//! Positional job arguments.
//!
//! Arguments are stored as a tagged union of primitive value kinds so that any
//! storage adapter can persist them without knowing what a handler expects.
//! They are decoded into handler-specific types only at invocation time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single positional argument passed to a job's action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Argument>),
    Map(BTreeMap<String, Argument>),
}

impl Argument {
    /// Returns the string payload, if this is a string argument.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Argument::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an integer argument.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Argument::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Argument::Float(value) => Some(*value),
            Argument::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Argument::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Short name of the value kind, used in handler error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Argument::Null => "null",
            Argument::Bool(_) => "bool",
            Argument::Int(_) => "int",
            Argument::Float(_) => "float",
            Argument::Str(_) => "str",
            Argument::List(_) => "list",
            Argument::Map(_) => "map",
        }
    }

    /// Converts the argument into an untagged JSON value for handlers that
    /// deserialize their inputs with serde.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Argument::Null => JsonValue::Null,
            Argument::Bool(value) => JsonValue::Bool(*value),
            Argument::Int(value) => JsonValue::from(*value),
            Argument::Float(value) => serde_json::Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Argument::Str(value) => JsonValue::String(value.clone()),
            Argument::List(items) => JsonValue::Array(items.iter().map(Argument::to_json).collect()),
            Argument::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Whether every float inside the argument is finite.
    pub fn is_finite(&self) -> bool {
        match self {
            Argument::Float(value) => value.is_finite(),
            Argument::List(items) => items.iter().all(Argument::is_finite),
            Argument::Map(entries) => entries.values().all(Argument::is_finite),
            _ => true,
        }
    }

    /// Builds an argument from an untagged JSON value.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Argument::Null,
            JsonValue::Bool(value) => Argument::Bool(value),
            // Integers outside i64 keep their exact digits as a string.
            JsonValue::Number(number) => match (number.as_i64(), number.is_f64()) {
                (Some(value), _) => Argument::Int(value),
                (None, true) => Argument::Float(number.as_f64().unwrap_or_default()),
                (None, false) => Argument::Str(number.to_string()),
            },
            JsonValue::String(value) => Argument::Str(value),
            JsonValue::Array(items) => {
                Argument::List(items.into_iter().map(Argument::from_json).collect())
            }
            JsonValue::Object(entries) => Argument::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Argument::from_json(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Argument::Bool(value)
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Argument::Int(value)
    }
}

impl From<i32> for Argument {
    fn from(value: i32) -> Self {
        Argument::Int(i64::from(value))
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Argument::Float(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Str(value.to_string())
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Str(value)
    }
}

impl<T: Into<Argument>> From<Vec<T>> for Argument {
    fn from(values: Vec<T>) -> Self {
        Argument::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Argument>> From<Option<T>> for Argument {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Argument::Null)
    }
}

/// Encodes an argument list into the JSON document stored by adapters.
///
/// NaN and infinite floats are rejected: JSON has no representation for them
/// and the stored document could not be decoded again.
pub fn encode_arguments(arguments: &[Argument]) -> serde_json::Result<JsonValue> {
    if let Some(index) = arguments.iter().position(|argument| !argument.is_finite()) {
        return Err(serde::ser::Error::custom(format!(
            "argument {index} contains a non-finite float"
        )));
    }
    serde_json::to_value(arguments)
}

/// Decodes an argument list previously produced by [`encode_arguments`].
pub fn decode_arguments(value: JsonValue) -> serde_json::Result<Vec<Argument>> {
    serde_json::from_value(value)
}
