//! Core domain model for wikisync: cells, rows, field selectors and identity rules.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "wikisync-core";

/// One cell of a normalized row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    pub fn is_absent(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Int(_) => false,
            Self::Text(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
        }
    }

    /// Entries of the cell viewed as a sequence of strings.
    pub fn entries(&self) -> Vec<String> {
        match self {
            Self::Null => Vec::new(),
            Self::Int(n) => vec![n.to_string()],
            Self::Text(s) => vec![s.clone()],
            Self::List(items) => items.clone(),
        }
    }

    /// Renders the value used as an upsert conflict key.
    ///
    /// Null, empty text and empty sequences have no key. A multi-element
    /// sequence is joined with commas so it still keys deterministically.
    pub fn identity_key(&self) -> Option<String> {
        if self.is_absent() {
            return None;
        }
        match self {
            Self::Int(n) => Some(n.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::List(items) if items.len() == 1 => Some(items[0].clone()),
            Self::List(items) => Some(items.join(",")),
            Self::Null => None,
        }
    }

    /// Text handed to the downstream text index.
    pub fn index_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join("\n"),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Int(n) => JsonValue::from(*n),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::List(items) => {
                JsonValue::Array(items.iter().cloned().map(JsonValue::String).collect())
            }
        }
    }

    /// Converts a value read back from the relational store.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Text(b.to_string()),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Text(n.to_string()),
            },
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(items) => Self::List(
                items
                    .iter()
                    .filter(|item| !item.is_null())
                    .map(|item| match item {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            JsonValue::Object(_) => Self::Text(value.to_string()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<String>> for CellValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// Flat destination-style row. Columns are kept sorted by name.
pub type NormalizedRow = BTreeMap<String, CellValue>;

/// One entry of a `cargoquery` page: `{"title": {field: value, ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawApiRecord {
    pub title: Map<String, JsonValue>,
}

impl RawApiRecord {
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: Into<String>,
    {
        Self {
            title: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("field selector is empty")]
    Empty,
    #[error("field selector `{0}` has an empty expression or alias")]
    Malformed(String),
}

/// A remote field selector: either `field` or `expression=alias`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldSelector {
    pub expression: String,
    pub alias: Option<String>,
}

impl FieldSelector {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            alias: None,
        }
    }

    pub fn aliased(expression: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            alias: Some(alias.into()),
        }
    }

    /// Name the remote API reports the field under.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.expression)
    }

    /// Destination column name.
    pub fn column_name(&self) -> String {
        self.output_name().replace(' ', "_")
    }

    /// Keys under which the value may appear in a response record.
    pub fn response_keys(&self) -> [String; 2] {
        let name = self.output_name();
        [name.to_string(), name.replace('_', " ")]
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{}={}", self.expression, alias),
            None => f.write_str(&self.expression),
        }
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SelectorError::Empty);
        }
        match s.split_once('=') {
            Some((expression, alias)) => {
                let (expression, alias) = (expression.trim(), alias.trim());
                if expression.is_empty() || alias.is_empty() {
                    return Err(SelectorError::Malformed(s.to_string()));
                }
                Ok(Self::aliased(expression, alias))
            }
            None => Ok(Self::new(s)),
        }
    }
}

impl TryFrom<String> for FieldSelector {
    type Error = SelectorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldSelector> for String {
    fn from(value: FieldSelector) -> Self {
        value.to_string()
    }
}

/// Persisted change-detection state for one destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHashRecord {
    pub table_name: String,
    pub content_hash: String,
    pub last_updated: DateTime<Utc>,
}

/// `(index_id, index_text)` pair handed to the text index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub index_id: String,
    pub index_text: String,
}

impl IndexEntry {
    /// The `_@table` suffix keeps identity values unique across tables.
    pub fn for_row(identity_key: &str, target_name: &str, text: &CellValue) -> Self {
        Self {
            index_id: format!("{identity_key}_@{target_name}"),
            index_text: text.index_text(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Skipped,
    Applied,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityViolation {
    #[error("{table}: row {row_index} has no value for identity column `{column}`")]
    Missing {
        table: String,
        column: String,
        row_index: usize,
    },
    #[error("{table}: identity `{column}` value `{value}` appears in rows {first_row} and {second_row}")]
    Duplicate {
        table: String,
        column: String,
        value: String,
        first_row: usize,
        second_row: usize,
    },
}

/// Checks that every row carries a unique, non-empty identity value.
pub fn validate_identity(
    table: &str,
    column: &str,
    rows: &[NormalizedRow],
) -> Result<(), IdentityViolation> {
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    for (row_index, row) in rows.iter().enumerate() {
        let Some(key) = row.get(column).and_then(CellValue::identity_key) else {
            return Err(IdentityViolation::Missing {
                table: table.to_string(),
                column: column.to_string(),
                row_index,
            });
        };
        if let Some(first_row) = seen.get(&key) {
            return Err(IdentityViolation::Duplicate {
                table: table.to_string(),
                column: column.to_string(),
                value: key,
                first_row: *first_row,
                second_row: row_index,
            });
        }
        seen.insert(key, row_index);
    }
    Ok(())
}
