use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ArgError;

/// A single job argument. Only primitives are representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    /// Type name used in extraction errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Job arguments keyed by name.
///
/// Extraction is strict: a present value of another type is an error,
/// never a coercion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(BTreeMap<String, ArgValue>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Option<ArgValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }

    /// Check every value is storable. NaN and infinite floats have no JSON
    /// form and would come back from the broker as undecodable.
    pub fn validate(&self) -> Result<(), ArgError> {
        for (key, value) in &self.0 {
            if let ArgValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(ArgError::NonFinite(key.clone()));
                }
            }
        }
        Ok(())
    }

    fn require(&self, key: &str) -> Result<&ArgValue, ArgError> {
        self.0.get(key).ok_or_else(|| ArgError::Missing(key.to_string()))
    }

    fn wrong_type(key: &str, expected: &'static str, found: &ArgValue) -> ArgError {
        ArgError::WrongType {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    pub fn string(&self, key: &str) -> Result<&str, ArgError> {
        match self.require(key)? {
            ArgValue::String(v) => Ok(v),
            other => Err(Self::wrong_type(key, "string", other)),
        }
    }

    pub fn int(&self, key: &str) -> Result<i64, ArgError> {
        match self.require(key)? {
            ArgValue::Int(v) => Ok(*v),
            other => Err(Self::wrong_type(key, "int", other)),
        }
    }

    pub fn float(&self, key: &str) -> Result<f64, ArgError> {
        match self.require(key)? {
            ArgValue::Float(v) => Ok(*v),
            other => Err(Self::wrong_type(key, "float", other)),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool, ArgError> {
        match self.require(key)? {
            ArgValue::Bool(v) => Ok(*v),
            other => Err(Self::wrong_type(key, "bool", other)),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Arguments
where
    K: Into<String>,
    V: Into<ArgValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
