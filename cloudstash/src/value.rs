//! Loosely typed table records.
//!
//! Table rows are flexible documents, so an [Item] maps attribute names to an [AttributeValue]
//! sum type instead of following a fixed schema.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// A single row of a document table.
pub type Item = BTreeMap<String, AttributeValue>;

/// Builds an [Item] from attribute name/value pairs.
pub fn item<'a, V: Into<AttributeValue>>(pairs: impl IntoIterator<Item = (&'a str, V)>) -> Item {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.into()))
        .collect()
}

/// The value of an attribute in an [Item].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

/// Non-finite floats have no document representation and become [AttributeValue::Null].
impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<Item> for AttributeValue {
    fn from(value: Item) -> Self {
        Self::Map(value)
    }
}

/// Names of the attributes making up a table's primary key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    pub partition_key: String,
    pub sort_key: Option<String>,
}

impl KeySchema {
    pub fn partition_only(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: None,
        }
    }

    pub fn with_sort_key(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: Some(sort_key.into()),
        }
    }

    /// Extracts the primary key of `item`, failing with a description of what is wrong.
    pub fn primary_key(&self, item: &Item) -> Result<PrimaryKey, String> {
        let partition = key_value(item, &self.partition_key)?;
        let sort = self
            .sort_key
            .as_ref()
            .map(|sort_key| key_value(item, sort_key))
            .transpose()?;
        Ok(PrimaryKey { partition, sort })
    }
}

fn key_value(item: &Item, attribute: &str) -> Result<KeyValue, String> {
    let value = item
        .get(attribute)
        .ok_or_else(|| format!("missing key attribute '{attribute}'"))?;
    KeyValue::from_attribute(value)
        .ok_or_else(|| format!("key attribute '{attribute}' has unsupported value {value:?}"))
}

/// A value usable as (part of) a primary key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Bool(bool),
    Integer(i64),
    String(String),
}

impl KeyValue {
    /// Key attributes must be booleans, integers, or strings.
    pub fn from_attribute(value: &AttributeValue) -> Option<Self> {
        match value {
            AttributeValue::Bool(b) => Some(Self::Bool(*b)),
            AttributeValue::Number(n) => n.as_i64().map(Self::Integer),
            AttributeValue::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// The primary key of an item: partition value and optional sort value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimaryKey {
    pub partition: KeyValue,
    pub sort: Option<KeyValue>,
}
