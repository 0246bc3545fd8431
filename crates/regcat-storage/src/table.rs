//! SQLite-backed relational store with whole-table replace semantics.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regcat_core::{CellValue, ColumnType, DatasetError, PersistenceOutcome, TabularDataset};
use serde::{Deserialize, Serialize};
use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bound parameters per INSERT statement stay under SQLite's historical limit.
const MAX_BIND_PARAMS: usize = 900;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPolicy {
    /// The incoming column set must equal the existing table's column set.
    #[default]
    Strict,
    /// Any incoming schema replaces the existing one.
    Replace,
}

#[derive(Debug, Error)]
pub enum TableStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("creating database directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid table name `{0}`")]
    InvalidTableName(String),
    #[error("dataset for table `{0}` has no columns")]
    EmptySchema(String),
    #[error("table `{table}` columns [{}] do not match incoming columns [{}]", .existing.join(", "), .incoming.join(", "))]
    SchemaMismatch {
        table: String,
        existing: Vec<String>,
        incoming: Vec<String>,
    },
    #[error("table `{0}` does not exist")]
    UnknownTable(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Text rendering of a table, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSnapshot {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone)]
pub struct SqliteTableStore {
    pool: SqlitePool,
}

impl SqliteTableStore {
    /// Accepts `sqlite://path`, `sqlite:path`, a bare path, or `:memory:`.
    pub async fn connect(location: &str) -> Result<Self, TableStoreError> {
        let location = location.trim();
        let path = location
            .strip_prefix("sqlite://")
            .or_else(|| location.strip_prefix("sqlite:"))
            .unwrap_or(location);

        let pool = if path == ":memory:" || path.is_empty() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let path = Path::new(path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| TableStoreError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?
        };

        debug!(location, "connected table store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Column names of `table` in declaration order, or `None` if it does not exist.
    pub async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, TableStoreError> {
        let mut conn = self.pool.acquire().await?;
        existing_columns(&mut conn, table).await
    }

    pub async fn row_count(&self, table: &str) -> Result<usize, TableStoreError> {
        validate_table_name(table)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    /// Replaces the full contents of `table` with `dataset`.
    ///
    /// Rows are loaded into a staging table and swapped in inside one
    /// transaction, so readers see either the old contents or the new ones.
    pub async fn replace_table(
        &self,
        table: &str,
        dataset: &TabularDataset,
        policy: SchemaPolicy,
    ) -> Result<usize, TableStoreError> {
        validate_table_name(table)?;
        dataset.validate()?;
        if dataset.column_count() == 0 {
            return Err(TableStoreError::EmptySchema(table.to_string()));
        }

        let incoming = dataset
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let staging = format!("{table}__staging");

        let mut tx = self.pool.begin().await?;

        if let Some(existing) = existing_columns(&mut tx, table).await? {
            let same = existing.iter().collect::<BTreeSet<_>>() == incoming.iter().collect::<BTreeSet<_>>();
            match policy {
                SchemaPolicy::Strict if !same => {
                    return Err(TableStoreError::SchemaMismatch {
                        table: table.to_string(),
                        existing,
                        incoming,
                    });
                }
                SchemaPolicy::Replace if !same => {
                    info!(table, ?existing, ?incoming, "replacing table schema");
                }
                _ => {}
            }
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&staging)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(&staging, dataset))
            .execute(&mut *tx)
            .await?;

        let columns = dataset.columns();
        let insert_prefix = format!(
            "INSERT INTO {} ({}) ",
            quote_ident(&staging),
            columns
                .iter()
                .map(|c| quote_ident(c.name()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
        let total = dataset.row_count();
        let mut start = 0;
        while start < total {
            let end = (start + rows_per_statement).min(total);
            let mut builder = QueryBuilder::<Sqlite>::new(insert_prefix.as_str());
            builder.push_values(start..end, |mut row, index| {
                for column in columns {
                    bind_cell(&mut row, &column.values()[index]);
                }
            });
            builder.build().execute(&mut *tx).await?;
            start = end;
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&staging),
            quote_ident(table)
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(table, rows = total, columns = columns.len(), "replaced table");
        Ok(total)
    }

    /// Like [`replace_table`](Self::replace_table) but never errors; failures
    /// are carried in the outcome.
    pub async fn persist(
        &self,
        table: &str,
        dataset: &TabularDataset,
        policy: SchemaPolicy,
    ) -> PersistenceOutcome {
        match self.replace_table(table, dataset, policy).await {
            Ok(rows) => PersistenceOutcome::written(rows),
            Err(err) => {
                warn!(table, error = %err, "persistence failed, previous contents kept");
                PersistenceOutcome::failed(err.to_string())
            }
        }
    }

    pub async fn snapshot(&self, table: &str) -> Result<TableSnapshot, TableStoreError> {
        let columns = self
            .table_columns(table)
            .await?
            .ok_or_else(|| TableStoreError::UnknownTable(table.to_string()))?;
        let select = columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select} FROM {} ORDER BY rowid", quote_ident(table));

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| row.try_get::<Option<String>, _>(i))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TableSnapshot { columns, rows })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn existing_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<Vec<String>>, TableStoreError> {
    validate_table_name(table)?;
    let names: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
    Ok(if names.is_empty() { None } else { Some(names) })
}

fn validate_table_name(table: &str) -> Result<(), TableStoreError> {
    if table.trim().is_empty() || table.contains('\0') {
        return Err(TableStoreError::InvalidTableName(table.to_string()));
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer | ColumnType::Boolean => "INTEGER",
        ColumnType::Float => "REAL",
        ColumnType::Date | ColumnType::Text => "TEXT",
    }
}

fn create_table_sql(table: &str, dataset: &TabularDataset) -> String {
    let columns = dataset
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(c.name()), sql_type(c.column_type())))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({columns})", quote_ident(table))
}

fn bind_cell<'args>(row: &mut Separated<'_, 'args, Sqlite, &'static str>, cell: &CellValue) {
    match cell {
        CellValue::Null => row.push_bind(None::<String>),
        CellValue::Int(v) => row.push_bind(*v),
        CellValue::Float(v) => row.push_bind(*v),
        CellValue::Bool(v) => row.push_bind(*v),
        CellValue::DateTime(_) => row.push_bind(cell.to_string()),
        CellValue::Text(v) => row.push_bind(v.clone()),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use regcat_core::Column;
    use tempfile::tempdir;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn catalog(rows: &[(&str, &str)]) -> TabularDataset {
        TabularDataset::new(vec![
            Column::inferred("name", rows.iter().map(|(n, _)| text(n)).collect()),
            Column::inferred("code", rows.iter().map(|(_, c)| text(c)).collect()),
        ])
        .unwrap()
    }

    async fn file_store() -> (tempfile::TempDir, SqliteTableStore) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("db/catalog.db").display());
        let store = SqliteTableStore::connect(&url).await.unwrap();
        (dir, store)
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("codigo pais"), "\"codigo pais\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[tokio::test]
    async fn replace_overwrites_previous_contents() {
        let (_dir, store) = file_store().await;

        let written = store
            .replace_table("countries", &catalog(&[("Mexico", "MX"), ("Peru", "PE")]), SchemaPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(written, 2);

        store
            .replace_table("countries", &catalog(&[("Chile", "CL")]), SchemaPolicy::Strict)
            .await
            .unwrap();

        let snapshot = store.snapshot("countries").await.unwrap();
        assert_eq!(snapshot.columns, vec!["name", "code"]);
        assert_eq!(
            snapshot.rows,
            vec![vec![Some("Chile".to_string()), Some("CL".to_string())]]
        );
        assert_eq!(store.table_columns("countries__staging").await.unwrap(), None);
    }

    #[tokio::test]
    async fn typed_cells_round_trip_as_text() {
        let store = SqliteTableStore::connect(":memory:").await.unwrap();
        let dataset = TabularDataset::new(vec![
            Column::inferred("id", vec![CellValue::Int(1), CellValue::Int(2)]),
            Column::inferred("ratio", vec![CellValue::Float(0.5), CellValue::Null]),
            Column::inferred("active", vec![CellValue::Bool(true), CellValue::Bool(false)]),
        ])
        .unwrap();
        store
            .replace_table("typed", &dataset, SchemaPolicy::Strict)
            .await
            .unwrap();

        let snapshot = store.snapshot("typed").await.unwrap();
        assert_eq!(
            snapshot.rows,
            vec![
                vec![Some("1".into()), Some("0.5".into()), Some("1".into())],
                vec![Some("2".into()), None, Some("0".into())],
            ]
        );
    }

    #[tokio::test]
    async fn large_datasets_are_chunked() {
        let store = SqliteTableStore::connect("sqlite::memory:").await.unwrap();
        let rows = (0..2_500)
            .map(|i| (format!("n{i}"), format!("c{i}")))
            .collect::<Vec<_>>();
        let borrowed = rows
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_str()))
            .collect::<Vec<_>>();
        let written = store
            .replace_table("big", &catalog(&borrowed), SchemaPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(written, 2_500);
        assert_eq!(store.row_count("big").await.unwrap(), 2_500);
    }

    #[tokio::test]
    async fn strict_schema_mismatch_keeps_existing_table() {
        let (_dir, store) = file_store().await;
        store
            .replace_table("countries", &catalog(&[("Mexico", "MX")]), SchemaPolicy::Strict)
            .await
            .unwrap();

        let other = TabularDataset::new(vec![Column::inferred("pais", vec![text("Peru")])]).unwrap();
        let outcome = store.persist("countries", &other, SchemaPolicy::Strict).await;
        assert!(!outcome.success);
        assert_eq!(outcome.rows_written, 0);
        assert!(outcome.error.unwrap().contains("do not match"));

        let snapshot = store.snapshot("countries").await.unwrap();
        assert_eq!(snapshot.columns, vec!["name", "code"]);
        assert_eq!(snapshot.rows.len(), 1);

        let outcome = store.persist("countries", &other, SchemaPolicy::Replace).await;
        assert_eq!(outcome, PersistenceOutcome::written(1));
        assert_eq!(
            store.table_columns("countries").await.unwrap(),
            Some(vec!["pais".to_string()])
        );
    }

    #[tokio::test]
    async fn column_order_changes_are_not_schema_changes() {
        let store = SqliteTableStore::connect(":memory:").await.unwrap();
        store
            .replace_table("t", &catalog(&[("a", "b")]), SchemaPolicy::Strict)
            .await
            .unwrap();
        let swapped = TabularDataset::new(vec![
            Column::inferred("code", vec![text("x")]),
            Column::inferred("name", vec![text("y")]),
        ])
        .unwrap();
        assert!(store.replace_table("t", &swapped, SchemaPolicy::Strict).await.is_ok());
    }

    #[tokio::test]
    async fn empty_datasets_and_unknown_tables_are_errors() {
        let store = SqliteTableStore::connect(":memory:").await.unwrap();
        let err = store
            .replace_table("t", &TabularDataset::default(), SchemaPolicy::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, TableStoreError::EmptySchema(_)));
        assert!(matches!(
            store.snapshot("missing").await.unwrap_err(),
            TableStoreError::UnknownTable(_)
        ));

        let zero_rows = catalog(&[]);
        assert_eq!(store.replace_table("t", &zero_rows, SchemaPolicy::Strict).await.unwrap(), 0);
        assert_eq!(store.snapshot("t").await.unwrap().rows.len(), 0);
    }
}
