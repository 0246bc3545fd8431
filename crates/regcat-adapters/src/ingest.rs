//! Spreadsheet file -> `TabularDataset`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, DataType, Range, Reader};
use regcat_core::{CellValue, Column, DatasetError, TabularDataset};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot open spreadsheet {}: {message}", .path.display())]
    Open { path: PathBuf, message: String },
    #[error("spreadsheet {} has no worksheets", .path.display())]
    NoSheets { path: PathBuf },
    #[error("sheet `{sheet}` not found (available: {})", .available.join(", "))]
    MissingSheet { sheet: String, available: Vec<String> },
    #[error("cannot read sheet `{sheet}`: {message}")]
    Read { sheet: String, message: String },
    #[error("sheet `{sheet}` has no header row")]
    NoHeaderRow { sheet: String },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Reads the first worksheet (or `sheet_name`) with the first row as header.
///
/// Short rows are padded with nulls. Cells to the right of the last header
/// cell are kept under `unnamed_<n>` columns, `n` being the 1-based position.
pub fn read_spreadsheet(path: &Path, sheet_name: Option<&str>) -> Result<TabularDataset, IngestError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| IngestError::Open {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let available = workbook.sheet_names();
    let sheet = match sheet_name {
        Some(name) if available.iter().any(|s| s == name) => name.to_string(),
        Some(name) => {
            return Err(IngestError::MissingSheet {
                sheet: name.to_string(),
                available,
            })
        }
        None => available
            .first()
            .cloned()
            .ok_or_else(|| IngestError::NoSheets {
                path: path.to_path_buf(),
            })?,
    };

    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| IngestError::Read {
            sheet: sheet.clone(),
            message: e.to_string(),
        })?;

    let dataset = dataset_from_range(&range, &sheet)?;
    info!(
        path = %path.display(),
        sheet = %sheet,
        rows = dataset.row_count(),
        columns = dataset.column_count(),
        "ingested spreadsheet"
    );
    Ok(dataset)
}

fn dataset_from_range(range: &Range<Data>, sheet: &str) -> Result<TabularDataset, IngestError> {
    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Err(IngestError::NoHeaderRow {
            sheet: sheet.to_string(),
        });
    };
    if header.iter().all(is_blank) {
        return Err(IngestError::NoHeaderRow {
            sheet: sheet.to_string(),
        });
    }

    let width = range.rows().map(<[Data]>::len).max().unwrap_or(0);
    let names = header_names(header, width);
    let mut values: Vec<Vec<CellValue>> = vec![Vec::with_capacity(range.height()); names.len()];
    for row in rows {
        for (index, column) in values.iter_mut().enumerate() {
            column.push(row.get(index).map(cell_value).unwrap_or(CellValue::Null));
        }
    }

    let columns = names
        .into_iter()
        .zip(values)
        .map(|(name, values)| Column::inferred(name, values))
        .collect::<Vec<_>>();
    for column in &columns {
        debug!(column = column.name(), kind = ?column.column_type(), "inferred column type");
    }
    Ok(TabularDataset::new(columns)?)
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Verbatim header text; blanks become `unnamed_<n>` and repeats get `.1`, `.2` suffixes.
fn header_names(header: &[Data], width: usize) -> Vec<String> {
    let raw = (0..width.max(header.len()))
        .map(|index| match header.get(index) {
            Some(cell) if !is_blank(cell) => match cell {
                Data::String(s) => s.clone(),
                other => cell_value(other).to_string(),
            },
            _ => format!("unnamed_{}", index + 1),
        })
        .collect::<Vec<_>>();

    let mut used: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(raw.len());
    for name in raw {
        let mut candidate = name.clone();
        let mut suffix = 0;
        while used.contains(&candidate) {
            suffix += 1;
            candidate = format!("{name}.{suffix}");
        }
        used.insert(candidate.clone());
        names.push(candidate);
    }
    names
}

/// Largest float that still converts to i64 without losing integral precision.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Null,
        Data::String(s) if s.trim().is_empty() => CellValue::Null,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(v) => CellValue::Int(*v),
        Data::Float(v) if v.fract() == 0.0 && v.abs() <= MAX_EXACT_FLOAT => CellValue::Int(*v as i64),
        Data::Float(v) => CellValue::Float(*v),
        Data::Bool(v) => CellValue::Bool(*v),
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_datetime()
            .map(CellValue::DateTime)
            .unwrap_or_else(|| CellValue::Text(cell.to_string())),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_xlsx;
    use regcat_core::ColumnType;
    use tempfile::tempdir;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    #[test]
    fn header_names_are_verbatim_with_blank_and_duplicate_handling() {
        let header = vec![
            Data::String("Nombre".into()),
            Data::Empty,
            Data::String("Nombre".into()),
            Data::Float(2024.0),
            Data::String("Nombre".into()),
        ];
        assert_eq!(
            header_names(&header, header.len()),
            vec!["Nombre", "unnamed_2", "Nombre.1", "2024", "Nombre.2"]
        );
        assert_eq!(
            header_names(&header[..1], 3),
            vec!["Nombre", "unnamed_2", "unnamed_3"]
        );
    }

    #[test]
    fn cells_past_the_last_header_get_unnamed_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.xlsx");
        write_xlsx(&path, &[&["Nombre", "Clave"], &["Mexico", "484", "extra"], &["Peru", "604"]]).unwrap();

        let dataset = read_spreadsheet(&path, None).unwrap();
        assert_eq!(dataset.column_names(), vec!["Nombre", "Clave", "unnamed_3"]);
        assert_eq!(
            dataset.column("unnamed_3").unwrap().values(),
            &[text("extra"), CellValue::Null]
        );
    }

    #[test]
    fn cells_map_to_typed_values() {
        assert_eq!(cell_value(&Data::Float(3.0)), CellValue::Int(3));
        assert_eq!(cell_value(&Data::Float(2.5)), CellValue::Float(2.5));
        assert_eq!(cell_value(&Data::String("  ".into())), CellValue::Null);
        assert_eq!(cell_value(&Data::Bool(true)), CellValue::Bool(true));
        assert!(matches!(
            cell_value(&Data::DateTimeIso("2024-03-01T10:30:00".into())),
            CellValue::DateTime(_)
        ));
    }

    #[test]
    fn reads_generated_workbook_with_type_inference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.xlsx");
        write_xlsx(
            &path,
            &[
                &["Nombre", "Clave", "Poblacion", "Nota"],
                &["Mexico", "484", "126.7", "x"],
                &["Peru", "604", "34", ""],
                &["Chile", "152"],
                &["Bolivia", "", "12.1"],
            ],
        )
        .unwrap();

        let dataset = read_spreadsheet(&path, None).unwrap();
        assert_eq!(dataset.column_names(), vec!["Nombre", "Clave", "Poblacion", "Nota"]);
        assert_eq!(dataset.row_count(), 4);

        let clave = dataset.column("Clave").unwrap();
        assert_eq!(clave.column_type(), ColumnType::Integer);
        assert_eq!(clave.values()[0], CellValue::Int(484));
        assert_eq!(clave.values()[3], CellValue::Null);

        assert_eq!(dataset.column("Poblacion").unwrap().column_type(), ColumnType::Float);
        let nota = dataset.column("Nota").unwrap();
        assert_eq!(nota.column_type(), ColumnType::Text);
        assert_eq!(nota.values(), &[text("x"), CellValue::Null, CellValue::Null, CellValue::Null]);
    }

    #[test]
    fn missing_sheet_and_unreadable_files_are_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.xlsx");
        write_xlsx(&path, &[&["a"], &["1"]]).unwrap();

        let err = read_spreadsheet(&path, Some("Otra")).unwrap_err();
        assert!(matches!(err, IngestError::MissingSheet { ref available, .. } if available == &["Sheet1"]));
        assert!(read_spreadsheet(&path, Some("Sheet1")).is_ok());

        let garbage = dir.path().join("broken.xlsx");
        std::fs::write(&garbage, b"definitely not a workbook").unwrap();
        assert!(matches!(
            read_spreadsheet(&garbage, None).unwrap_err(),
            IngestError::Open { .. }
        ));
    }

    #[test]
    fn empty_sheet_has_no_header_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.xlsx");
        write_xlsx(&path, &[]).unwrap();
        assert!(matches!(
            read_spreadsheet(&path, None).unwrap_err(),
            IngestError::NoHeaderRow { .. }
        ));
    }
}
