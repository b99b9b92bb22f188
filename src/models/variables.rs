//! Workflow variables: a schema-less map of strongly typed values

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single workflow variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Variable {
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Variable {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variable::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Variable::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variable::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Variable {
    fn from(v: i64) -> Self {
        Variable::Int(v)
    }
}

impl From<i32> for Variable {
    fn from(v: i32) -> Self {
        Variable::Int(v as i64)
    }
}

impl From<bool> for Variable {
    fn from(v: bool) -> Self {
        Variable::Bool(v)
    }
}

impl From<String> for Variable {
    fn from(v: String) -> Self {
        Variable::Text(v)
    }
}

impl From<&str> for Variable {
    fn from(v: &str) -> Self {
        Variable::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for Variable {
    fn from(v: DateTime<Utc>) -> Self {
        Variable::Timestamp(v)
    }
}

/// Instance variables keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, Variable>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Variable>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Variable>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Variable> {
        self.0.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Variable::as_int)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Overlay `other` onto these variables; keys in `other` win
    pub fn merge(&mut self, other: Variables) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Variable)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, Variable)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
