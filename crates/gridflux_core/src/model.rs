use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier types that wrap a store-assigned UUID.
pub trait EntityId: Copy + Eq + std::hash::Hash + fmt::Debug + From<Uuid> + Into<Uuid> {}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl EntityId for $name {}
    };
}

entity_id!(TableId);
entity_id!(RowId);
entity_id!(ColumnId);
entity_id!(ViewId);
entity_id!(
    /// Client-generated identity for an entity the store has not confirmed yet.
    OptimisticId
);

/// Authenticated caller, as resolved by the session layer in front of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: TableId,
    pub owner: CallerId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: RowId,
    pub table_id: TableId,
    /// Display position. Not guaranteed to be contiguous.
    pub order: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnType {
    #[default]
    Text,
    Number,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(ColumnType::Text),
            "number" => Some(ColumnType::Number),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: ColumnId,
    pub table_id: TableId,
    pub label: String,
    pub order: i64,
    pub column_type: ColumnType,
}

/// Scalar cell content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn as_display_string(&self) -> String {
        match self {
            CellValue::Number(n) => n.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }

    /// Case-insensitive substring match used by global search.
    pub fn matches_search(&self, needle_lowercase: &str) -> bool {
        self.as_display_string()
            .to_lowercase()
            .contains(needle_lowercase)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display_string())
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

/// A value keyed by `(row_id, column_id)`. At most one per pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub row_id: RowId,
    pub column_id: ColumnId,
    pub value: CellValue,
}

impl Cell {
    pub fn new(row_id: RowId, column_id: ColumnId, value: impl Into<CellValue>) -> Self {
        Self {
            row_id,
            column_id,
            value: value.into(),
        }
    }

    pub fn key(&self) -> (RowId, ColumnId) {
        (self.row_id, self.column_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub id: String,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnFilter {
    pub id: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPinning {
    #[serde(default)]
    pub left: Vec<String>,
    #[serde(default)]
    pub right: Vec<String>,
}

/// Persisted view state. Opaque to the queue and executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewConfig {
    #[serde(default)]
    pub sorting: Vec<SortSpec>,
    #[serde(default)]
    pub column_filters: Vec<ColumnFilter>,
    #[serde(default)]
    pub column_visibility: BTreeMap<String, bool>,
    #[serde(default)]
    pub column_sizing: BTreeMap<String, f64>,
    #[serde(default)]
    pub column_pinning: ColumnPinning,
    #[serde(default)]
    pub global_search: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub id: ViewId,
    pub table_id: TableId,
    pub name: String,
    pub config: ViewConfig,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewView {
    pub name: String,
    pub config: ViewConfig,
    pub is_default: bool,
}

/// Partial view update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ViewConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

impl ViewPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.config.is_none() && self.is_default.is_none()
    }

    pub fn apply_to(&self, view: &mut View) {
        if let Some(name) = &self.name {
            view.name = name.clone();
        }
        if let Some(config) = &self.config {
            view.config = config.clone();
        }
        if let Some(is_default) = self.is_default {
            view.is_default = is_default;
        }
    }
}

/// Everything a client needs to open a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub table: Table,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub cells: Vec<Cell>,
    pub views: Vec<View>,
}

impl TableSnapshot {
    pub fn default_view(&self) -> Option<&View> {
        self.views.iter().find(|view| view.is_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_value_deserializes_numbers_and_strings() {
        let number: CellValue = serde_json::from_str("42.5").unwrap();
        let text: CellValue = serde_json::from_str("\"42.5\"").unwrap();

        assert_eq!(number, CellValue::Number(42.5));
        assert_eq!(text, CellValue::Text("42.5".to_string()));
    }

    #[test]
    fn view_config_fills_missing_fields() {
        let config: ViewConfig =
            serde_json::from_str(r#"{"globalSearch":"acme","columnPinning":{"left":["a"]}}"#)
                .unwrap();

        assert_eq!(config.global_search, "acme");
        assert_eq!(config.column_pinning.left, vec!["a".to_string()]);
        assert!(config.column_pinning.right.is_empty());
        assert!(config.sorting.is_empty());
    }

    #[test]
    fn view_patch_only_touches_present_fields() {
        let mut view = View {
            id: ViewId::new(),
            table_id: TableId::new(),
            name: "Grid".to_string(),
            config: ViewConfig::default(),
            is_default: true,
            created_at: Utc::now(),
        };

        ViewPatch {
            name: Some("Renamed".to_string()),
            ..ViewPatch::default()
        }
        .apply_to(&mut view);

        assert_eq!(view.name, "Renamed");
        assert!(view.is_default);
    }

    #[test]
    fn search_is_case_insensitive() {
        assert!(CellValue::from("Acme Corp").matches_search("acme"));
        assert!(CellValue::from(1250.0).matches_search("125"));
        assert!(!CellValue::from("Globex").matches_search("acme"));
    }
}
