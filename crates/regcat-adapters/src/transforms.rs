//! Reference transform strategies and the name -> strategy registry.

use std::collections::HashSet;
use std::sync::Arc;

use regcat_core::{
    CellValue, Column, IdentityTransform, TabularDataset, TransformError, TransformStrategy,
};
use tracing::{debug, warn};

pub const CODE_COLUMN: &str = "codigo_pais";
pub const COUNTRY_COLUMN: &str = "pais";
pub const NATIONALITY_COLUMN: &str = "clave_nacionalidad";
pub const SOURCE_COLUMN: &str = "fuente";
pub const ROW_ID_COLUMN: &str = "id";

/// Per-pipeline inputs a strategy may need at construction time.
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    pub source_url: String,
    pub add_row_id: bool,
}

pub fn known_transforms() -> &'static [&'static str] {
    &["identity", "nationalities"]
}

pub fn transform_for_name(name: &str, ctx: &TransformContext) -> Option<Arc<dyn TransformStrategy>> {
    match name {
        "identity" => Some(Arc::new(IdentityTransform)),
        "nationalities" | "nacionalidades" => Some(Arc::new(NationalitiesTransform {
            source_url: ctx.source_url.clone(),
            add_row_id: ctx.add_row_id,
        })),
        _ => None,
    }
}

/// Cleans the country/nationality catalog.
///
/// Drops empty rows and rows without a code or country name, normalizes the
/// code to three digits, title-cases country names, keeps the first row per
/// code, sorts by code and stamps the source URL.
#[derive(Debug, Clone)]
pub struct NationalitiesTransform {
    pub source_url: String,
    pub add_row_id: bool,
}

impl NationalitiesTransform {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            add_row_id: false,
        }
    }

    pub fn with_row_id(mut self, add_row_id: bool) -> Self {
        self.add_row_id = add_row_id;
        self
    }
}

fn trimmed(value: CellValue) -> CellValue {
    match value {
        CellValue::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                CellValue::Null
            } else if t.len() == s.len() {
                CellValue::Text(s)
            } else {
                CellValue::Text(t.to_string())
            }
        }
        other => other,
    }
}

fn country_code(value: CellValue) -> CellValue {
    match trimmed(value) {
        CellValue::Int(v) if v >= 0 => CellValue::Text(format!("{v:03}")),
        CellValue::Text(s) if !s.is_empty() && s.len() < 3 && s.bytes().all(|b| b.is_ascii_digit()) => {
            CellValue::Text(format!("{s:0>3}"))
        }
        CellValue::Null => CellValue::Null,
        other => CellValue::Text(other.to_string()),
    }
}

fn title_case(value: CellValue) -> CellValue {
    match trimmed(value) {
        CellValue::Text(s) => {
            let mut out = String::with_capacity(s.len());
            let mut previous_is_letter = false;
            for c in s.chars() {
                if c.is_alphabetic() {
                    if previous_is_letter {
                        out.extend(c.to_lowercase());
                    } else {
                        out.extend(c.to_uppercase());
                    }
                    previous_is_letter = true;
                } else {
                    out.push(c);
                    previous_is_letter = false;
                }
            }
            CellValue::Text(out)
        }
        other => other,
    }
}

fn is_valid_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit())
}

impl TransformStrategy for NationalitiesTransform {
    fn name(&self) -> &str {
        "nationalities"
    }

    fn changes_row_count(&self) -> bool {
        true
    }

    fn apply(&self, dataset: TabularDataset) -> Result<TabularDataset, TransformError> {
        let missing = [CODE_COLUMN, COUNTRY_COLUMN]
            .into_iter()
            .filter(|name| dataset.column(name).is_none())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(TransformError::MissingColumns(missing));
        }

        let before = dataset.row_count();
        let mut dataset = dataset
            .retain_rows(|row| row.iter().any(|cell| !cell.is_null()))
            .map_column(CODE_COLUMN, country_code)?
            .map_column(COUNTRY_COLUMN, title_case)?;
        if dataset.column(NATIONALITY_COLUMN).is_some() {
            dataset = dataset.map_column(NATIONALITY_COLUMN, trimmed)?;
        }

        let code_index = dataset
            .column_index(CODE_COLUMN)
            .ok_or_else(|| TransformError::MissingColumns(vec![CODE_COLUMN.to_string()]))?;
        let country_index = dataset
            .column_index(COUNTRY_COLUMN)
            .ok_or_else(|| TransformError::MissingColumns(vec![COUNTRY_COLUMN.to_string()]))?;
        let dataset = dataset.retain_rows(|row| !row[code_index].is_null() && !row[country_index].is_null());

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        let dataset = dataset.retain_rows(|row| {
            let code = row[code_index].to_string();
            if seen.insert(code.clone()) {
                true
            } else {
                duplicates.push(code);
                false
            }
        });
        if !duplicates.is_empty() {
            warn!(?duplicates, "duplicate country codes dropped, first occurrence kept");
        }

        let codes = dataset
            .column(CODE_COLUMN)
            .map(|c| c.values().iter().map(|v| v.to_string()).collect::<Vec<_>>())
            .unwrap_or_default();
        let invalid = codes
            .iter()
            .filter(|code| !is_valid_code(code))
            .cloned()
            .collect::<Vec<_>>();
        if !invalid.is_empty() {
            warn!(?invalid, "country codes not made of three digits");
        }

        let mut order = (0..dataset.row_count()).collect::<Vec<_>>();
        order.sort_by(|a, b| codes[*a].cmp(&codes[*b]));
        let rows = order.len();
        let mut dataset = dataset
            .select_rows(&order)
            .push_column(Column::text(
                SOURCE_COLUMN,
                vec![CellValue::Text(self.source_url.clone()); rows],
            ))?;

        if self.add_row_id {
            let ids = (1..=rows as i64).map(CellValue::Int).collect();
            dataset = dataset.insert_column(0, Column::inferred(ROW_ID_COLUMN, ids))?;
        }

        debug!(before, after = rows, "nationalities catalog cleaned");
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regcat_core::{run_checked, ColumnType};

    const SOURCE: &str = "http://www.dgis.salud.gob.mx/contenidos/intercambio/nacionalidades_gobmx.html";

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn catalog() -> TabularDataset {
        TabularDataset::new(vec![
            Column::inferred(
                CODE_COLUMN,
                vec![
                    CellValue::Int(484),
                    CellValue::Int(32),
                    CellValue::Null,
                    CellValue::Int(484),
                    CellValue::Null,
                    CellValue::Int(999),
                ],
            ),
            Column::inferred(
                COUNTRY_COLUMN,
                vec![
                    text("  MÉXICO "),
                    text("argentina"),
                    text("sin codigo"),
                    text("Mexico duplicado"),
                    CellValue::Null,
                    CellValue::Null,
                ],
            ),
            Column::inferred(
                NATIONALITY_COLUMN,
                vec![text(" MEX"), text("ARG "), text("X"), text("MEX"), CellValue::Null, text("ZZZ")],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn cleans_sorts_and_stamps_the_catalog() {
        let strategy = NationalitiesTransform::new(SOURCE);
        let out = run_checked(&strategy, catalog()).unwrap();

        assert_eq!(out.column_names(), vec![CODE_COLUMN, COUNTRY_COLUMN, NATIONALITY_COLUMN, SOURCE_COLUMN]);
        assert_eq!(out.column(CODE_COLUMN).unwrap().values(), &[text("032"), text("484")]);
        assert_eq!(out.column(COUNTRY_COLUMN).unwrap().values(), &[text("Argentina"), text("México")]);
        assert_eq!(out.column(NATIONALITY_COLUMN).unwrap().values(), &[text("ARG"), text("MEX")]);
        assert_eq!(out.column(SOURCE_COLUMN).unwrap().values(), &[text(SOURCE), text(SOURCE)]);
    }

    #[test]
    fn output_is_stable_across_runs() {
        let strategy = NationalitiesTransform::new(SOURCE).with_row_id(true);
        let first = run_checked(&strategy, catalog()).unwrap();
        let second = run_checked(&strategy, catalog()).unwrap();
        assert_eq!(first, second);

        let ids = first.column(ROW_ID_COLUMN).unwrap();
        assert_eq!(first.column_names()[0], ROW_ID_COLUMN);
        assert_eq!(ids.column_type(), ColumnType::Integer);
        assert_eq!(ids.values(), &[CellValue::Int(1), CellValue::Int(2)]);
    }

    #[test]
    fn required_columns_are_checked() {
        let dataset = TabularDataset::new(vec![Column::inferred("pais", vec![text("Peru")])]).unwrap();
        let err = NationalitiesTransform::new(SOURCE).apply(dataset).unwrap_err();
        assert_eq!(err, TransformError::MissingColumns(vec![CODE_COLUMN.to_string()]));
    }

    #[test]
    fn text_codes_are_zero_padded_and_names_title_cased() {
        assert_eq!(country_code(text(" 4 ")), text("004"));
        assert_eq!(country_code(text("ABC")), text("ABC"));
        assert_eq!(title_case(text("ESTADOS UNIDOS DE AMÉRICA")), text("Estados Unidos De América"));
        assert_eq!(title_case(text("guinea-bissau")), text("Guinea-Bissau"));
    }

    #[test]
    fn registry_resolves_known_names_only() {
        let ctx = TransformContext {
            source_url: SOURCE.to_string(),
            add_row_id: false,
        };
        for name in known_transforms() {
            let strategy = transform_for_name(name, &ctx).unwrap();
            assert_eq!(strategy.name(), *name);
        }
        assert!(transform_for_name("unknown", &ctx).is_none());
    }
}
