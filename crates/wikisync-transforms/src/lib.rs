//! Record formatting, reshape steps and the declarative table registry.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use quick_xml::escape::resolve_html5_entity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use wikisync_core::{CellValue, FieldSelector, NormalizedRow, RawApiRecord};

pub const CRATE_NAME: &str = "wikisync-transforms";

const MAX_ENTITY_LEN: usize = 32;

fn line_break() -> &'static Regex {
    static LINE_BREAK: OnceLock<Regex> = OnceLock::new();
    LINE_BREAK.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").expect("line break pattern is valid"))
}

/// Named references that still decode when the trailing `;` is missing.
const LEGACY_ENTITIES: &[&str] = &[
    "AElig", "AMP", "Aacute", "Acirc", "Agrave", "Aring", "Atilde", "Auml", "COPY", "Ccedil",
    "ETH", "Eacute", "Ecirc", "Egrave", "Euml", "GT", "Iacute", "Icirc", "Igrave", "Iuml", "LT",
    "Ntilde", "Oacute", "Ocirc", "Ograve", "Oslash", "Otilde", "Ouml", "QUOT", "REG", "THORN",
    "Uacute", "Ucirc", "Ugrave", "Uuml", "Yacute", "aacute", "acirc", "acute", "aelig", "agrave",
    "amp", "aring", "atilde", "auml", "brvbar", "ccedil", "cedil", "cent", "copy", "curren",
    "deg", "divide", "eacute", "ecirc", "egrave", "eth", "euml", "frac12", "frac14", "frac34",
    "gt", "iacute", "icirc", "iexcl", "igrave", "iquest", "iuml", "laquo", "lt", "macr", "micro",
    "middot", "nbsp", "not", "ntilde", "oacute", "ocirc", "ograve", "ordf", "ordm", "oslash",
    "otilde", "ouml", "para", "plusmn", "pound", "quot", "raquo", "reg", "sect", "shy", "sup1",
    "sup2", "sup3", "szlig", "thorn", "times", "uacute", "ucirc", "ugrave", "uml", "uuml",
    "yacute", "yen", "yuml",
];

/// Decodes named, decimal and hex character references the way browsers do.
///
/// Numeric references and the legacy named set decode without a trailing
/// `;`; a legacy name may also be a prefix (`&ampx` is `&x`). Numbers that
/// are not valid scalar values become U+FFFD. Anything else is copied
/// through unchanged.
pub fn decode_html_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        match decode_reference(after) {
            Some((text, consumed)) => {
                out.push_str(&text);
                rest = &after[consumed..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Replacement text and consumed byte count for the reference opening
/// `after` (the text following `&`).
fn decode_reference(after: &str) -> Option<(Cow<'static, str>, usize)> {
    if let Some(number) = after.strip_prefix('#') {
        return decode_numeric(number).map(|(text, used)| (text, used + 1));
    }

    let name_end = after
        .char_indices()
        .take_while(|&(_, c)| !matches!(c, '\t' | '\n' | '\x0c' | ' ' | '<' | '&' | '#' | ';'))
        .take(MAX_ENTITY_LEN)
        .last()
        .map(|(i, c)| i + c.len_utf8())?;
    let name = &after[..name_end];

    if after[name_end..].starts_with(';') {
        if let Some(text) = resolve_html5_entity(name) {
            return Some((Cow::Borrowed(text), name_end + 1));
        }
    }

    (2..=name.len())
        .rev()
        .filter(|&end| name.is_char_boundary(end))
        .find_map(|end| {
            let prefix = &name[..end];
            if !LEGACY_ENTITIES.contains(&prefix) {
                return None;
            }
            resolve_html5_entity(prefix).map(|text| (Cow::Borrowed(text), end))
        })
}

fn decode_numeric(number: &str) -> Option<(Cow<'static, str>, usize)> {
    let (radix, digits_start) = match number.as_bytes().first() {
        Some(b'x' | b'X') => (16, 1),
        _ => (10, 0),
    };
    let tail = &number[digits_start..];
    let digits_len = tail
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(tail.len());
    if digits_len == 0 {
        return None;
    }

    let mut used = digits_start + digits_len;
    if number[used..].starts_with(';') {
        used += 1;
    }
    let decoded = u32::from_str_radix(&tail[..digits_len], radix)
        .ok()
        .and_then(char::from_u32)
        .filter(|&c| c != '\0')
        .unwrap_or(char::REPLACEMENT_CHARACTER);
    Some((Cow::Owned(decoded.to_string()), used))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Columns whose single-string values are additionally split on commas.
    pub split_commas: BTreeSet<String>,
    /// Columns kept as a single text value instead of a sequence.
    pub scalar: BTreeSet<String>,
}

impl FormatOptions {
    pub fn split_commas<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.split_commas.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn scalar<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scalar.extend(columns.into_iter().map(Into::into));
        self
    }
}

/// Flattens raw `cargoquery` records into normalized rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFormatter;

impl RecordFormatter {
    /// Formats one raw string value into its sequence of entries.
    pub fn format_value(raw: &str, split_commas: bool) -> Vec<String> {
        if raw.is_empty() {
            return Vec::new();
        }
        let text = decode_html_entities(raw);

        if line_break().is_match(&text) {
            return line_break().split(&text).map(str::to_string).collect();
        }
        if split_commas {
            return text.split(',').map(|s| s.trim().to_string()).collect();
        }
        vec![text.into_owned()]
    }

    fn format_json(value: &JsonValue, split_commas: bool) -> Vec<String> {
        match value {
            JsonValue::Null => Vec::new(),
            JsonValue::String(s) => Self::format_value(s, split_commas),
            JsonValue::Array(items) => items
                .iter()
                .flat_map(|item| Self::format_json(item, split_commas))
                .collect(),
            other => Self::format_value(&other.to_string(), split_commas),
        }
    }

    fn scalar_json(value: &JsonValue) -> CellValue {
        match value {
            JsonValue::Null => CellValue::Null,
            JsonValue::String(s) if s.is_empty() => CellValue::Null,
            JsonValue::String(s) => CellValue::Text(decode_html_entities(s).into_owned()),
            JsonValue::Array(items) => {
                let joined = items
                    .iter()
                    .flat_map(|item| Self::format_json(item, false))
                    .collect::<Vec<_>>()
                    .join(",");
                if joined.is_empty() {
                    CellValue::Null
                } else {
                    CellValue::Text(joined)
                }
            }
            other => CellValue::Text(other.to_string()),
        }
    }

    fn cell(column: &str, value: Option<&JsonValue>, options: &FormatOptions) -> CellValue {
        static MISSING: JsonValue = JsonValue::Null;
        let value = value.unwrap_or(&MISSING);
        if options.scalar.contains(column) {
            Self::scalar_json(value)
        } else {
            CellValue::List(Self::format_json(
                value,
                options.split_commas.contains(column),
            ))
        }
    }

    /// Produces one row per record with one column per selector. With no
    /// selectors, the record's own keys become the columns.
    pub fn normalize(
        records: &[RawApiRecord],
        fields: &[FieldSelector],
        options: &FormatOptions,
    ) -> Vec<NormalizedRow> {
        records
            .iter()
            .map(|record| {
                if fields.is_empty() {
                    return record
                        .title
                        .iter()
                        .map(|(key, value)| {
                            let column = key.replace(' ', "_");
                            let cell = Self::cell(&column, Some(value), options);
                            (column, cell)
                        })
                        .collect();
                }
                fields
                    .iter()
                    .map(|selector| {
                        let column = selector.column_name();
                        let value = selector
                            .response_keys()
                            .iter()
                            .find_map(|key| record.title.get(key));
                        let cell = Self::cell(&column, value, options);
                        (column, cell)
                    })
                    .collect()
            })
            .collect()
    }
}

fn default_separator() -> String {
    "_".to_string()
}

/// One declarative reshape operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReshapeStep {
    Rename {
        from: String,
        to: String,
    },
    Drop {
        columns: Vec<String>,
    },
    /// Joins the identity keys of `columns` into `target`.
    Concat {
        target: String,
        columns: Vec<String>,
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Writes the row position (plus `start`) into `target`.
    RowNumber {
        target: String,
        #[serde(default)]
        start: i64,
    },
    /// Drops rows whose `column` shares any entry with `values`.
    ExcludeAny {
        column: String,
        values: Vec<String>,
    },
    Strip {
        column: String,
        pattern: String,
    },
    /// Fills `target` with `template`, `{}` replaced by the value of `source`.
    Template {
        target: String,
        source: String,
        template: String,
    },
    Split {
        column: String,
        delimiter: String,
    },
}

impl ReshapeStep {
    pub fn apply(&self, rows: Vec<NormalizedRow>) -> Vec<NormalizedRow> {
        match self {
            Self::Rename { from, to } => map_rows(rows, |row| {
                if let Some(value) = row.remove(from) {
                    row.insert(to.clone(), value);
                }
            }),
            Self::Drop { columns } => map_rows(rows, |row| {
                for column in columns {
                    row.remove(column);
                }
            }),
            Self::Concat {
                target,
                columns,
                separator,
            } => map_rows(rows, |row| {
                let parts: Option<Vec<String>> = columns
                    .iter()
                    .map(|column| row.get(column).and_then(CellValue::identity_key))
                    .collect();
                let value = match parts {
                    Some(parts) => CellValue::Text(parts.join(separator)),
                    None => CellValue::Null,
                };
                row.insert(target.clone(), value);
            }),
            Self::RowNumber { target, start } => rows
                .into_iter()
                .enumerate()
                .map(|(index, mut row)| {
                    let position = i64::try_from(index).unwrap_or(i64::MAX);
                    row.insert(target.clone(), CellValue::Int(start.saturating_add(position)));
                    row
                })
                .collect(),
            Self::ExcludeAny { column, values } => {
                let blocked: HashSet<&str> = values.iter().map(String::as_str).collect();
                rows.into_iter()
                    .filter(|row| {
                        row.get(column).map_or(true, |cell| {
                            cell.entries()
                                .iter()
                                .all(|entry| !blocked.contains(entry.as_str()))
                        })
                    })
                    .collect()
            }
            Self::Strip { column, pattern } => map_rows(rows, |row| {
                if let Some(cell) = row.get_mut(column) {
                    match cell {
                        CellValue::Text(s) => *s = s.replace(pattern.as_str(), ""),
                        CellValue::List(items) => {
                            for item in items.iter_mut() {
                                *item = item.replace(pattern.as_str(), "");
                            }
                        }
                        CellValue::Null | CellValue::Int(_) => {}
                    }
                }
            }),
            Self::Template {
                target,
                source,
                template,
            } => map_rows(rows, |row| {
                let value = match row.get(source).and_then(CellValue::identity_key) {
                    Some(key) => CellValue::Text(template.replace("{}", &key)),
                    None => CellValue::Null,
                };
                row.insert(target.clone(), value);
            }),
            Self::Split { column, delimiter } => map_rows(rows, |row| {
                if let Some(cell) = row.get_mut(column) {
                    if cell.is_absent() {
                        return;
                    }
                    let entries = cell
                        .entries()
                        .iter()
                        .flat_map(|entry| entry.split(delimiter.as_str()))
                        .map(|part| part.trim().to_string())
                        .collect();
                    *cell = CellValue::List(entries);
                }
            }),
        }
    }
}

fn map_rows(
    rows: Vec<NormalizedRow>,
    mut f: impl FnMut(&mut NormalizedRow),
) -> Vec<NormalizedRow> {
    rows.into_iter()
        .map(|mut row| {
            f(&mut row);
            row
        })
        .collect()
}

/// Post-normalization step producing destination rows.
pub trait Reshape: Send + Sync {
    fn reshape(&self, rows: Vec<NormalizedRow>) -> Vec<NormalizedRow>;
}

impl<F> Reshape for F
where
    F: Fn(Vec<NormalizedRow>) -> Vec<NormalizedRow> + Send + Sync,
{
    fn reshape(&self, rows: Vec<NormalizedRow>) -> Vec<NormalizedRow> {
        self(rows)
    }
}

/// Ordered list of declarative steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPipeline(pub Vec<ReshapeStep>);

impl Reshape for StepPipeline {
    fn reshape(&self, rows: Vec<NormalizedRow>) -> Vec<NormalizedRow> {
        self.0.iter().fold(rows, |rows, step| step.apply(rows))
    }
}

/// Everything needed to move one remote table into one destination table.
#[derive(Clone)]
pub struct TableTransform {
    pub source_name: String,
    pub source_fields: Vec<FieldSelector>,
    pub target_name: String,
    pub target_fields: Vec<String>,
    pub identity_column: String,
    pub text_column: Option<String>,
    pub resource_column: Option<String>,
    pub format: FormatOptions,
    pub reshape: Arc<dyn Reshape>,
}

impl TableTransform {
    pub fn new(
        source_name: impl Into<String>,
        source_fields: Vec<FieldSelector>,
        target_name: impl Into<String>,
        identity_column: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            source_fields,
            target_name: target_name.into(),
            target_fields: Vec::new(),
            identity_column: identity_column.into(),
            text_column: None,
            resource_column: None,
            format: FormatOptions::default(),
            reshape: Arc::new(StepPipeline::default()),
        }
    }

    pub fn with_target_fields(mut self, fields: Vec<String>) -> Self {
        self.target_fields = fields;
        self
    }

    pub fn with_text_column(mut self, column: impl Into<String>) -> Self {
        self.text_column = Some(column.into());
        self
    }

    pub fn with_resource_column(mut self, column: impl Into<String>) -> Self {
        self.resource_column = Some(column.into());
        self
    }

    pub fn with_format(mut self, format: FormatOptions) -> Self {
        self.format = format;
        self
    }

    pub fn with_reshape(mut self, reshape: impl Reshape + 'static) -> Self {
        self.reshape = Arc::new(reshape);
        self
    }

    /// Normalize then reshape. Resource columns are resolved separately.
    pub fn shape(&self, records: &[RawApiRecord]) -> Vec<NormalizedRow> {
        let rows = RecordFormatter::normalize(records, &self.source_fields, &self.format);
        self.reshape.reshape(rows)
    }
}

impl fmt::Debug for TableTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableTransform")
            .field("source_name", &self.source_name)
            .field("source_fields", &self.source_fields)
            .field("target_name", &self.target_name)
            .field("target_fields", &self.target_fields)
            .field("identity_column", &self.identity_column)
            .field("text_column", &self.text_column)
            .field("resource_column", &self.resource_column)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing table registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("target table `{0}` is defined more than once")]
    DuplicateTarget(String),
    #[error("table `{0}` selects no fields")]
    NoFields(String),
    #[error("table `{table}` declares an empty {role} column")]
    EmptyColumn { table: String, role: &'static str },
}

fn default_enabled() -> bool {
    true
}

/// One entry of `tables.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub source: String,
    pub fields: Vec<FieldSelector>,
    pub target: String,
    #[serde(default)]
    pub target_fields: Vec<String>,
    pub identity: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub scalar: Vec<String>,
    #[serde(default)]
    pub split_commas: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Steps are written as single-key maps, e.g. `- rename: {from: a, to: b}`.
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub reshape: Vec<ReshapeStep>,
}

impl TableDefinition {
    pub fn to_transform(&self) -> TableTransform {
        let mut transform = TableTransform::new(
            self.source.clone(),
            self.fields.clone(),
            self.target.clone(),
            self.identity.clone(),
        )
        .with_target_fields(self.target_fields.clone())
        .with_format(
            FormatOptions::default()
                .scalar(self.scalar.iter().cloned())
                .split_commas(self.split_commas.iter().cloned()),
        )
        .with_reshape(StepPipeline(self.reshape.clone()));
        transform.text_column = self.text.clone();
        transform.resource_column = self.resource.clone();
        transform
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.fields.is_empty() {
            return Err(RegistryError::NoFields(self.target.clone()));
        }
        let roles = [
            ("identity", Some(&self.identity)),
            ("text", self.text.as_ref()),
            ("resource", self.resource.as_ref()),
        ];
        for (role, column) in roles {
            if column.is_some_and(|c| c.trim().is_empty()) {
                return Err(RegistryError::EmptyColumn {
                    table: self.target.clone(),
                    role,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegistry {
    pub tables: Vec<TableDefinition>,
}

impl TableRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut targets = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !targets.insert(table.target.as_str()) {
                return Err(RegistryError::DuplicateTarget(table.target.clone()));
            }
        }
        Ok(())
    }

    pub fn find(&self, target: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.target == target)
    }

    /// Transforms for enabled tables, in file order.
    pub fn enabled_transforms(&self) -> Vec<TableTransform> {
        self.tables
            .iter()
            .filter(|t| t.enabled)
            .map(TableDefinition::to_transform)
            .collect()
    }
}

pub fn load_table_registry(path: impl AsRef<Path>) -> Result<TableRegistry, RegistryError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    TableRegistry::from_yaml_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_records(table: &str) -> Vec<RawApiRecord> {
        let path = workspace_root().join("fixtures").join(table).join("page.json");
        let text = fs::read_to_string(&path).expect("fixture page");
        let value: JsonValue = serde_json::from_str(&text).expect("fixture json");
        serde_json::from_value(value["cargoquery"].clone()).expect("cargoquery records")
    }

    fn registry() -> TableRegistry {
        load_table_registry(workspace_root().join("tables.yaml")).expect("tables.yaml")
    }

    fn row(pairs: &[(&str, CellValue)]) -> NormalizedRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn format_value_follows_entity_break_comma_rules() {
        assert_eq!(
            RecordFormatter::format_value("A&amp;B<br>C", false),
            vec!["A&B", "C"]
        );
        assert_eq!(RecordFormatter::format_value("", false), Vec::<String>::new());
        assert_eq!(RecordFormatter::format_value("X", false), vec!["X"]);
        assert_eq!(RecordFormatter::format_value("X,Y", true), vec!["X", "Y"]);
        assert_eq!(RecordFormatter::format_value("X,Y", false), vec!["X,Y"]);
        // Line breaks win over comma splitting.
        assert_eq!(
            RecordFormatter::format_value("a,b<br/>c", true),
            vec!["a,b", "c"]
        );
        assert_eq!(
            RecordFormatter::format_value("one<BR />two", false),
            vec!["one", "two"]
        );
    }

    #[test]
    fn escaped_line_break_still_splits() {
        assert_eq!(
            RecordFormatter::format_value("x&lt;br&gt;y", false),
            vec!["x", "y"]
        );
    }

    #[test]
    fn entity_decoding_is_lenient() {
        assert_eq!(decode_html_entities("a &amp; b"), "a & b");
        assert_eq!(decode_html_entities("&#39;q&#x27;"), "'q'");
        assert_eq!(decode_html_entities("&ndash;"), "\u{2013}");
        assert_eq!(decode_html_entities("fish & chips"), "fish & chips");
        assert_eq!(decode_html_entities("&bogus; &"), "&bogus; &");
        assert!(matches!(decode_html_entities("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn legacy_and_numeric_references_decode_without_semicolon() {
        assert_eq!(decode_html_entities("Tom &amp Jerry"), "Tom & Jerry");
        assert_eq!(decode_html_entities("1 &lt 2 &gt 0"), "1 < 2 > 0");
        assert_eq!(decode_html_entities("&copy2024"), "\u{a9}2024");
        assert_eq!(decode_html_entities("&ampx;"), "&x;");
        assert_eq!(decode_html_entities("&#65&#x42 c"), "AB c");
        assert_eq!(decode_html_entities("&#1114112;"), "\u{fffd}");
        // Non-legacy names still need the semicolon.
        assert_eq!(decode_html_entities("&ndash x"), "&ndash x");
        assert_eq!(decode_html_entities("&# &x"), "&# &x");
    }

    #[test]
    fn normalize_uses_selector_aliases_and_options() {
        let records = vec![RawApiRecord::from_pairs([
            ("page name", json!("Fireball")),
            ("skill_id", json!("fire_ball")),
            ("stat_text", json!("Deals fire<br>Projectile")),
            ("tags", json!("Spell,Fire")),
        ])];
        let fields: Vec<FieldSelector> = ["_pageName=page_name", "skill_id", "stat_text", "tags", "icon"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let options = FormatOptions::default()
            .scalar(["skill_id", "icon"])
            .split_commas(["tags"]);

        let rows = RecordFormatter::normalize(&records, &fields, &options);

        assert_eq!(
            rows,
            vec![row(&[
                ("page_name", CellValue::list(["Fireball"])),
                ("skill_id", CellValue::text("fire_ball")),
                ("stat_text", CellValue::list(["Deals fire", "Projectile"])),
                ("tags", CellValue::list(["Spell", "Fire"])),
                ("icon", CellValue::Null),
            ])]
        );
    }

    #[test]
    fn normalize_without_selectors_uses_record_keys() {
        let records = vec![RawApiRecord::from_pairs([
            ("mod ids", json!("a,b")),
            ("weight", json!(5)),
        ])];
        let options = FormatOptions::default().split_commas(["mod_ids"]);
        let rows = RecordFormatter::normalize(&records, &[], &options);
        assert_eq!(rows[0]["mod_ids"], CellValue::list(["a", "b"]));
        assert_eq!(rows[0]["weight"], CellValue::list(["5"]));
    }

    #[test]
    fn normalize_is_pure() {
        let records = fixture_records("pantheon_souls");
        let transform = registry().find("pantheon_souls").unwrap().to_transform();
        let first = transform.shape(&records);
        let second = transform.shape(&records);
        assert_eq!(first, second);
    }

    #[test]
    fn concat_builds_composite_identity_and_nulls_on_missing_part() {
        let step = ReshapeStep::Concat {
            target: "id".into(),
            columns: vec!["pantheon".into(), "enemy".into()],
            separator: "_".into(),
        };
        let rows = step.apply(vec![
            row(&[
                ("pantheon", CellValue::text("Lunaris")),
                ("enemy", CellValue::list(["Eater"])),
            ]),
            row(&[("pantheon", CellValue::text("Solaris"))]),
        ]);
        assert_eq!(rows[0]["id"], CellValue::text("Lunaris_Eater"));
        assert_eq!(rows[1]["id"], CellValue::Null);
    }

    #[test]
    fn exclude_any_drops_rows_sharing_a_blocked_entry() {
        let step = ReshapeStep::ExcludeAny {
            column: "categories".into(),
            values: vec!["Map".into(), "Breachstone".into()],
        };
        let rows = step.apply(vec![
            row(&[("categories", CellValue::list(["Ring", "Map"]))]),
            row(&[("categories", CellValue::list(["Ring", "Amulet"]))]),
            row(&[("categories", CellValue::List(vec![]))]),
            row(&[("other", CellValue::text("x"))]),
        ]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["categories"], CellValue::list(["Ring", "Amulet"]));
    }

    #[test]
    fn strip_rename_template_split_and_row_number() {
        let steps = StepPipeline(vec![
            ReshapeStep::Rename {
                from: "target_area_id".into(),
                to: "location".into(),
            },
            ReshapeStep::Strip {
                column: "location".into(),
                pattern: "MapWorlds".into(),
            },
            ReshapeStep::Template {
                target: "icon".into(),
                source: "name".into(),
                template: "File:{} inventory icon.png".into(),
            },
            ReshapeStep::Split {
                column: "groups".into(),
                delimiter: ";".into(),
            },
            ReshapeStep::RowNumber {
                target: "id".into(),
                start: 0,
            },
            ReshapeStep::Drop {
                columns: vec!["unused".into()],
            },
        ]);
        let rows = steps.reshape(vec![
            row(&[
                ("target_area_id", CellValue::text("MapWorldsCourtyard")),
                ("name", CellValue::list(["Rhoa Egg"])),
                ("groups", CellValue::list(["a; b", "c"])),
                ("unused", CellValue::Int(1)),
            ]),
            row(&[("name", CellValue::List(vec![]))]),
        ]);

        assert_eq!(
            rows[0],
            row(&[
                ("location", CellValue::text("Courtyard")),
                ("name", CellValue::list(["Rhoa Egg"])),
                ("icon", CellValue::text("File:Rhoa Egg inventory icon.png")),
                ("groups", CellValue::list(["a", "b", "c"])),
                ("id", CellValue::Int(0)),
            ])
        );
        assert_eq!(rows[1]["icon"], CellValue::Null);
        assert_eq!(rows[1]["id"], CellValue::Int(1));
        assert!(!rows[1].contains_key("location"));
    }

    #[test]
    fn closures_are_reshape_functions() {
        let transform = TableTransform::new("t", vec![FieldSelector::new("id")], "t", "id")
            .with_reshape(|rows: Vec<NormalizedRow>| {
                rows.into_iter().filter(|r| !r["id"].is_absent()).collect()
            });
        let rows = transform.shape(&[
            RawApiRecord::from_pairs([("id", json!("1"))]),
            RawApiRecord::from_pairs([("id", json!(""))]),
        ]);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn reshape_steps_parse_from_yaml() {
        let steps: Vec<ReshapeStep> = serde_yaml::with::singleton_map_recursive::deserialize(
            serde_yaml::Deserializer::from_str(
                r#"
- rename: { from: id, to: pantheon_name }
- concat: { target: id, columns: [pantheon_name, enemy_name] }
- exclude_any: { column: c, values: [Map] }
- row_number: { target: id }
"#,
            ),
        )
        .unwrap();
        assert_eq!(
            steps[1],
            ReshapeStep::Concat {
                target: "id".into(),
                columns: vec!["pantheon_name".into(), "enemy_name".into()],
                separator: "_".into(),
            }
        );
        assert_eq!(
            steps[3],
            ReshapeStep::RowNumber {
                target: "id".into(),
                start: 0
            }
        );
    }

    #[test]
    fn registry_entries_accept_map_style_reshape_steps() {
        let registry = TableRegistry::from_yaml_str(
            r#"
tables:
  - source: pantheon_souls
    fields: [id, name]
    target: pantheon_souls
    identity: id
    reshape:
      - rename: { from: id, to: pantheon_name }
      - concat: { target: id, columns: [pantheon_name, name], separator: "-" }
      - strip: { column: name, pattern: MapWorlds }
"#,
        )
        .unwrap();
        let steps = &registry.tables[0].reshape;
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps[0],
            ReshapeStep::Rename {
                from: "id".into(),
                to: "pantheon_name".into()
            }
        );
        assert!(matches!(&steps[1], ReshapeStep::Concat { separator, .. } if separator == "-"));

        let rows = registry.tables[0].to_transform().shape(&[RawApiRecord::from_pairs([
            ("id", json!("Lunaris")),
            ("name", json!("Eater")),
        ])]);
        assert_eq!(rows[0]["id"].identity_key().as_deref(), Some("Lunaris-Eater"));
    }

    #[test]
    fn registry_rejects_duplicates_and_empty_columns() {
        let dup = r#"
tables:
  - { source: a, fields: [id], target: t, identity: id }
  - { source: b, fields: [id], target: t, identity: id }
"#;
        assert!(matches!(
            TableRegistry::from_yaml_str(dup),
            Err(RegistryError::DuplicateTarget(t)) if t == "t"
        ));

        let empty_text = r#"
tables:
  - { source: a, fields: [id], target: t, identity: id, text: "" }
"#;
        assert!(matches!(
            TableRegistry::from_yaml_str(empty_text),
            Err(RegistryError::EmptyColumn { role: "text", .. })
        ));

        let no_fields = r#"
tables:
  - { source: a, fields: [], target: t, identity: id }
"#;
        assert!(matches!(
            TableRegistry::from_yaml_str(no_fields),
            Err(RegistryError::NoFields(_))
        ));
    }

    #[test]
    fn shipped_registry_loads() {
        let registry = registry();
        assert!(registry.tables.len() >= 8);
        let skills = registry.find("skills").unwrap().to_transform();
        assert_eq!(skills.source_name, "skill");
        assert_eq!(skills.resource_column.as_deref(), Some("image_file_name"));
        assert_eq!(skills.source_fields[0].column_name(), "page_name");
    }
}
