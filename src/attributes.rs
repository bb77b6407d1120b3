use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Caller-supplied attributes that targeting queries are evaluated against (e.g., a targeting
/// key, a plan, a country).
pub type EvaluationContext = HashMap<String, AttributeValue>;

/// A single evaluation context value.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}
