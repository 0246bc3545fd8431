//! Source header -> canonical column renames.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{DatasetError, TabularDataset};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("mapping declares source column `{0}` more than once")]
    DuplicateKey(String),
    #[error("renaming would produce duplicate column `{0}`")]
    Collision(String),
    #[error("strict mapping matched none of the dataset columns")]
    NoMappedColumns,
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Ordered rename table. Unmapped columns pass through unless `strict`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    renames: Vec<(String, String)>,
    #[serde(default)]
    strict: bool,
    #[serde(default)]
    normalize_names: bool,
}

impl ColumnMapping {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, MappingError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mapping = Self {
            renames: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            strict: false,
            normalize_names: false,
        };
        mapping.lookup()?;
        Ok(mapping)
    }

    /// Drop columns that have no entry in the table.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Compare headers and keys after trimming and lowercasing.
    pub fn normalize_names(mut self, normalize: bool) -> Self {
        self.normalize_names = normalize;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn renames(&self) -> &[(String, String)] {
        &self.renames
    }

    fn key(&self, name: &str) -> String {
        if self.normalize_names {
            name.trim().to_lowercase()
        } else {
            name.to_string()
        }
    }

    fn lookup(&self) -> Result<HashMap<String, &str>, MappingError> {
        let mut lookup = HashMap::with_capacity(self.renames.len());
        for (source, target) in &self.renames {
            if lookup.insert(self.key(source), target.as_str()).is_some() {
                return Err(MappingError::DuplicateKey(source.clone()));
            }
        }
        Ok(lookup)
    }
}

/// Renames columns per `mapping`. Row count is never changed.
pub fn apply_mapping(
    dataset: TabularDataset,
    mapping: &ColumnMapping,
) -> Result<TabularDataset, MappingError> {
    let lookup = mapping.lookup()?;
    let had_columns = dataset.column_count() > 0;
    let mut used = HashSet::new();
    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(dataset.column_count());

    for column in dataset.into_columns() {
        let key = mapping.key(column.name());
        let name = match lookup.get(&key) {
            Some(target) => {
                used.insert(key);
                (*target).to_string()
            }
            None if mapping.strict => continue,
            None => column.name().to_string(),
        };
        if !seen.insert(name.clone()) {
            return Err(MappingError::Collision(name));
        }
        columns.push(column.renamed(name));
    }

    if mapping.strict && had_columns && columns.is_empty() {
        return Err(MappingError::NoMappedColumns);
    }

    let unused = mapping
        .renames
        .iter()
        .filter(|(source, _)| !used.contains(&mapping.key(source)))
        .map(|(source, _)| source.as_str())
        .collect::<Vec<_>>();
    if !unused.is_empty() {
        debug!(?unused, "mapping entries matched no dataset column");
    }

    Ok(TabularDataset::new(columns)?)
}
