//! Injected domain transformation contract.

use thiserror::Error;

use crate::{DatasetError, TabularDataset};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("row count changed from {before} to {after}")]
    UndeclaredRowChange { before: usize, after: usize },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Domain-specific cleaning/validation/enrichment applied between mapping
/// and persistence. Implementations must not perform I/O.
pub trait TransformStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Strategies that filter or de-duplicate rows must say so; otherwise the
    /// engine rejects any change in row count.
    fn changes_row_count(&self) -> bool {
        false
    }

    fn apply(&self, dataset: TabularDataset) -> Result<TabularDataset, TransformError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl TransformStrategy for IdentityTransform {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, dataset: TabularDataset) -> Result<TabularDataset, TransformError> {
        Ok(dataset)
    }
}

/// Adapts a plain function into a strategy.
pub struct FnTransform<F> {
    name: String,
    changes_row_count: bool,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(TabularDataset) -> Result<TabularDataset, TransformError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            changes_row_count: false,
            f,
        }
    }

    pub fn changing_row_count(mut self) -> Self {
        self.changes_row_count = true;
        self
    }
}

impl<F> TransformStrategy for FnTransform<F>
where
    F: Fn(TabularDataset) -> Result<TabularDataset, TransformError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn changes_row_count(&self) -> bool {
        self.changes_row_count
    }

    fn apply(&self, dataset: TabularDataset) -> Result<TabularDataset, TransformError> {
        (self.f)(dataset)
    }
}

/// Runs `strategy` and enforces the shape contract on its output.
pub fn run_checked(
    strategy: &dyn TransformStrategy,
    dataset: TabularDataset,
) -> Result<TabularDataset, TransformError> {
    let before = dataset.row_count();
    let output = strategy.apply(dataset)?;
    output.validate()?;
    let after = output.row_count();
    if before != after && !strategy.changes_row_count() {
        return Err(TransformError::UndeclaredRowChange { before, after });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CellValue, Column};

    fn numbers(n: i64) -> TabularDataset {
        TabularDataset::new(vec![Column::inferred(
            "n",
            (0..n).map(CellValue::Int).collect(),
        )])
        .unwrap()
    }

    fn drop_odd(dataset: TabularDataset) -> Result<TabularDataset, TransformError> {
        Ok(dataset.retain_rows(|row| matches!(row[0], CellValue::Int(v) if v % 2 == 0)))
    }

    #[test]
    fn identity_passes_dataset_through() {
        let out = run_checked(&IdentityTransform, numbers(3)).unwrap();
        assert_eq!(out, numbers(3));
    }

    #[test]
    fn undeclared_row_drop_is_rejected() {
        let strategy = FnTransform::new("drop-odd", drop_odd);
        let err = run_checked(&strategy, numbers(4)).unwrap_err();
        assert_eq!(err, TransformError::UndeclaredRowChange { before: 4, after: 2 });
    }

    #[test]
    fn declared_row_drop_is_accepted() {
        let strategy = FnTransform::new("drop-odd", drop_odd).changing_row_count();
        let out = run_checked(&strategy, numbers(4)).unwrap();
        assert_eq!(out.row_count(), 2);
    }

    #[test]
    fn strategy_errors_propagate() {
        let strategy = FnTransform::new("reject", |_| {
            Err(TransformError::Validation("bad codes".to_string()))
        });
        let err = run_checked(&strategy, numbers(1)).unwrap_err();
        assert_eq!(err.to_string(), "validation failed: bad codes");
    }
}
