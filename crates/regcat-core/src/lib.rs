//! Core tabular model and stage handoff types for regcat.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mapping;
pub mod transform;

pub use mapping::{apply_mapping, ColumnMapping, MappingError};
pub use transform::{run_checked, FnTransform, IdentityTransform, TransformError, TransformStrategy};

pub const CRATE_NAME: &str = "regcat-core";

pub const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "ods"];
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip"];

/// A single typed spreadsheet cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text form used when a column is coerced to `ColumnType::Text`; `None` for nulls.
    pub fn to_text(&self) -> Option<String> {
        if self.is_null() {
            None
        } else {
            Some(self.to_string())
        }
    }

    fn kind(&self) -> Option<ColumnType> {
        match self {
            CellValue::Null => None,
            CellValue::Int(_) => Some(ColumnType::Integer),
            CellValue::Float(_) => Some(ColumnType::Float),
            CellValue::Bool(_) => Some(ColumnType::Boolean),
            CellValue::DateTime(_) => Some(ColumnType::Date),
            CellValue::Text(_) => Some(ColumnType::Text),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Int(v) => write!(f, "{v}"),
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Bool(v) => write!(f, "{v}"),
            CellValue::DateTime(v) if v.time() == NaiveTime::MIN => {
                write!(f, "{}", v.format("%Y-%m-%d"))
            }
            CellValue::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S")),
            CellValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Date,
    Text,
}

impl ColumnType {
    /// Best-effort inference over the non-null cells of a column.
    ///
    /// Integers and floats widen to `Float`; every other mix, and an all-null
    /// column, falls back to `Text`.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a CellValue>) -> Self {
        let mut seen: Option<ColumnType> = None;
        for value in values {
            let Some(kind) = value.kind() else {
                continue;
            };
            seen = Some(match (seen, kind) {
                (None, kind) => kind,
                (Some(a), b) if a == b => a,
                (Some(ColumnType::Integer), ColumnType::Float)
                | (Some(ColumnType::Float), ColumnType::Integer) => ColumnType::Float,
                _ => return ColumnType::Text,
            });
        }
        seen.unwrap_or(ColumnType::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    name: String,
    column_type: ColumnType,
    values: Vec<CellValue>,
}

impl Column {
    /// Builds a column, inferring its type and coercing cells to match it.
    pub fn inferred(name: impl Into<String>, values: Vec<CellValue>) -> Self {
        let column_type = ColumnType::infer(&values);
        let values = values
            .into_iter()
            .map(|value| coerce(value, column_type))
            .collect();
        Self {
            name: name.into(),
            column_type,
            values,
        }
    }

    pub fn text(name: impl Into<String>, values: Vec<CellValue>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Text,
            values: values
                .into_iter()
                .map(|value| coerce(value, ColumnType::Text))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn renamed(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn into_values(self) -> Vec<CellValue> {
        self.values
    }

    fn take_rows(&self, indices: &[usize]) -> Self {
        Self {
            name: self.name.clone(),
            column_type: self.column_type,
            values: indices.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }
}

fn coerce(value: CellValue, column_type: ColumnType) -> CellValue {
    match (column_type, value) {
        (_, CellValue::Null) => CellValue::Null,
        (ColumnType::Float, CellValue::Int(v)) => CellValue::Float(v as f64),
        (ColumnType::Text, CellValue::Text(v)) => CellValue::Text(v),
        (ColumnType::Text, other) => CellValue::Text(other.to_string()),
        (_, other) => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasetError {
    #[error("column `{name}` has {actual} rows, expected {expected}")]
    RaggedColumn {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column name `{0}`")]
    DuplicateColumn(String),
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
}

/// Ordered named columns of equal length.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawDataset")]
pub struct TabularDataset {
    columns: Vec<Column>,
}

#[derive(Deserialize)]
struct RawDataset {
    columns: Vec<Column>,
}

impl TryFrom<RawDataset> for TabularDataset {
    type Error = DatasetError;

    fn try_from(raw: RawDataset) -> Result<Self, Self::Error> {
        TabularDataset::new(raw.columns)
    }
}

impl TabularDataset {
    pub fn new(columns: Vec<Column>) -> Result<Self, DatasetError> {
        let dataset = Self { columns };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Re-checks the shape invariants: equal column lengths, unique names.
    pub fn validate(&self) -> Result<(), DatasetError> {
        let expected = self.row_count();
        let mut names = HashSet::new();
        for column in &self.columns {
            if column.len() != expected {
                return Err(DatasetError::RaggedColumn {
                    name: column.name.clone(),
                    expected,
                    actual: column.len(),
                });
            }
            if !names.insert(column.name.as_str()) {
                return Err(DatasetError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(Column::name).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn row(&self, index: usize) -> Option<Vec<&CellValue>> {
        if index >= self.row_count() {
            return None;
        }
        Some(self.columns.iter().map(|c| &c.values[index]).collect())
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<&CellValue>> + '_ {
        (0..self.row_count()).map(move |i| self.columns.iter().map(|c| &c.values[i]).collect())
    }

    /// Keeps the rows (by original index, in the given order).
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            columns: self.columns.iter().map(|c| c.take_rows(indices)).collect(),
        }
    }

    pub fn retain_rows(&self, mut keep: impl FnMut(&[&CellValue]) -> bool) -> Self {
        let indices = self
            .rows()
            .enumerate()
            .filter(|(_, row)| keep(row))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        self.select_rows(&indices)
    }

    /// Rebuilds one column with `f`, re-inferring its type.
    pub fn map_column(
        self,
        name: &str,
        mut f: impl FnMut(CellValue) -> CellValue,
    ) -> Result<Self, DatasetError> {
        let index = self
            .column_index(name)
            .ok_or_else(|| DatasetError::UnknownColumn(name.to_string()))?;
        let mut columns = self.columns;
        let column = columns.remove(index);
        let column_name = column.name.clone();
        let values = column.into_values().into_iter().map(&mut f).collect();
        columns.insert(index, Column::inferred(column_name, values));
        Self::new(columns)
    }

    pub fn insert_column(self, index: usize, column: Column) -> Result<Self, DatasetError> {
        let mut columns = self.columns;
        let index = index.min(columns.len());
        columns.insert(index, column);
        Self::new(columns)
    }

    pub fn push_column(self, column: Column) -> Result<Self, DatasetError> {
        let len = self.columns.len();
        self.insert_column(len, column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Spreadsheet,
    Archive,
}

impl ArtifactKind {
    pub fn from_extension(extension: &str) -> Option<Self> {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
            Some(ArtifactKind::Archive)
        } else if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            Some(ArtifactKind::Spreadsheet)
        } else {
            None
        }
    }
}

/// A downloadable link discovered on the source page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLink {
    pub url: String,
    pub file_name: String,
    pub extension: String,
    pub kind: ArtifactKind,
    pub anchor_text: Option<String>,
    pub position: usize,
}

/// Local result of acquisition. Owns the extracted member path for archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub extracted: Option<PathBuf>,
    pub content_hash: String,
    pub byte_size: usize,
}

impl DownloadedArtifact {
    pub fn spreadsheet_path(&self) -> &Path {
        self.extracted.as_deref().unwrap_or(&self.path)
    }

    pub fn paths(&self) -> Vec<&Path> {
        let mut out = vec![self.path.as_path()];
        if let Some(extracted) = &self.extracted {
            out.push(extracted.as_path());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceOutcome {
    pub success: bool,
    pub rows_written: usize,
    pub error: Option<String>,
}

impl PersistenceOutcome {
    pub fn written(rows_written: usize) -> Self {
        Self {
            success: true,
            rows_written,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            rows_written: 0,
            error: Some(error.into()),
        }
    }
}
