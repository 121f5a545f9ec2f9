// Filterable tabular listings
//
// A listing is a set of rows plus an optional filter; the row type supplies the column headers and cell text.
// The instrument listing is the only configuration in use.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::database::consistency::{ConsistencyChecker, ValidationVerdict};
use crate::database::schema_inspector::SchemaInspector;
use crate::installation::files::{InstrumentFiles, InstrumentKind};

pub trait ListingRow {
    fn headers() -> &'static [&'static str];
    fn cells(&self) -> Vec<String>;
}

type RowFilter<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

pub struct TabularListing<R: ListingRow> {
    rows: Vec<R>,
    filter: Option<RowFilter<R>>,
}

impl<R: ListingRow> TabularListing<R> {
    pub fn new(rows: Vec<R>) -> Self {
        Self { rows, filter: None }
    }

    pub fn with_filter(mut self, filter: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Rows that pass the filter, in their original order.
    pub fn visible_rows(&self) -> Vec<&R> {
        self.rows
            .iter()
            .filter(|r| self.filter.as_ref().map_or(true, |f| f(r)))
            .collect()
    }

    /// Column-aligned plain text: header, rule, then one line per visible row.
    pub fn render_text(&self) -> String {
        let headers = R::headers();
        let body: Vec<Vec<String>> = self.visible_rows().iter().map(|r| r.cells()).collect();

        let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
        for cells in &body {
            for (w, cell) in widths.iter_mut().zip(cells) {
                *w = (*w).max(cell.chars().count());
            }
        }

        let render_line = |cells: &[String]| {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<width$}", c, width = *w))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        };

        let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let mut out = vec![render_line(&header_cells)];
        out.push(
            widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("  "),
        );
        out.extend(body.iter().map(|cells| render_line(cells)));
        out.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableStatus {
    Exists,
    Missing,
    /// The lookup failed.
    Unchecked,
}

impl TableStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TableStatus::Exists => "Exists",
            TableStatus::Missing => "Missing",
            TableStatus::Unchecked => "?",
        }
    }
}

/// Cell text for a check that could not run; the detail goes to the log.
pub const CHECK_FAILED: &str = "Check failed";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentRow {
    pub instrument: String,
    pub instrument_type: InstrumentKind,
    pub table_installed: TableStatus,
    pub table_valid: ValidationVerdict,
    pub pages_valid: ValidationVerdict,
}

impl ListingRow for InstrumentRow {
    fn headers() -> &'static [&'static str] {
        &[
            "Instrument",
            "Instrument_Type",
            "Table_Installed",
            "Table_Valid",
            "Pages_Valid",
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.instrument.clone(),
            self.instrument_type.label().to_string(),
            self.table_installed.label().to_string(),
            self.table_valid.display_text().to_string(),
            self.pages_valid.display_text().to_string(),
        ]
    }
}

/// Case-insensitive substring match on the instrument name.
pub fn name_filter(needle: &str) -> impl Fn(&InstrumentRow) -> bool + Send + Sync + 'static {
    let needle = needle.to_lowercase();
    move |row| row.instrument.to_lowercase().contains(&needle)
}

fn verdict_or_failure(instrument: &str, check: &str, result: Result<ValidationVerdict>) -> ValidationVerdict {
    result.unwrap_or_else(|e| {
        warn!(
            "[PHASE: listing] [STEP: {}] {} could not be checked: {:#}",
            check, instrument, e
        );
        ValidationVerdict::Invalid(CHECK_FAILED.to_string())
    })
}

/// One row per registered instrument. Both checks are re-run on every call.
///
/// Only the registry lookup is fatal; a failing check marks its own cell and the other rows are still built.
pub async fn build_instrument_rows(
    inspector: &Arc<dyn SchemaInspector>,
    checker: &ConsistencyChecker,
    files: &InstrumentFiles,
) -> Result<Vec<InstrumentRow>> {
    let names = inspector
        .registered_instruments()
        .await
        .context("Failed to list registered instruments")?;
    debug!(
        "[PHASE: listing] [STEP: build] Building rows for {} instruments",
        names.len()
    );

    let mut rows = Vec::with_capacity(names.len());
    for name in names {
        let table_installed = match inspector.table_exists(&name).await {
            Ok(true) => TableStatus::Exists,
            Ok(false) => TableStatus::Missing,
            Err(e) => {
                warn!(
                    "[PHASE: listing] [STEP: table_exists] {} could not be checked: {:#}",
                    name, e
                );
                TableStatus::Unchecked
            }
        };
        let table_valid = verdict_or_failure(&name, "check_schema", checker.check_schema(&name).await);
        let pages_valid = verdict_or_failure(&name, "check_pages", checker.check_pages(&name).await);
        rows.push(InstrumentRow {
            instrument_type: files.kind_of(&name).await,
            table_installed,
            table_valid,
            pages_valid,
            instrument: name,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::schema_inspector::fake::FakeSchema;

    fn row(name: &str, verdict: ValidationVerdict) -> InstrumentRow {
        InstrumentRow {
            instrument: name.to_string(),
            instrument_type: InstrumentKind::InstrumentBuilder,
            table_installed: TableStatus::Exists,
            table_valid: verdict,
            pages_valid: ValidationVerdict::Unknown,
        }
    }

    #[test]
    fn filter_hides_non_matching_rows() {
        let listing = TabularListing::new(vec![
            row("bmi", ValidationVerdict::Valid),
            row("mri_parameter_form", ValidationVerdict::Valid),
        ])
        .with_filter(name_filter("MRI"));
        let visible = listing.visible_rows();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].instrument, "mri_parameter_form");
    }

    #[test]
    fn render_aligns_columns_and_shows_unknown_as_question_mark() {
        let listing = TabularListing::new(vec![row(
            "bmi",
            ValidationVerdict::Invalid("Column height invalid".to_string()),
        )]);
        let text = listing.render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Instrument  Instrument_Type"));
        assert!(lines[1].starts_with("----------  "));
        assert!(lines[2].contains("Instrument Builder"));
        assert!(lines[2].contains("Column height invalid"));
        assert!(lines[2].ends_with('?'));
    }

    #[tokio::test]
    async fn rows_cover_every_registered_instrument() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bmi.linst"),
            "page{@}p1{@}Measurements\ntext{@}height{@}Height\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("NDB_BVL_Instrument_legacy.class.inc"), "<?php").unwrap();

        let schema: Arc<dyn SchemaInspector> = Arc::new(
            FakeSchema::default()
                .with_column("bmi", "height", "varchar(255)")
                .with_registered("legacy")
                .with_registered("bmi"),
        );
        let checker = ConsistencyChecker::new(schema.clone(), dir.path().to_path_buf());
        let files = InstrumentFiles::new(dir.path().to_path_buf(), 0o644);

        let rows = build_instrument_rows(&schema, &checker, &files).await.unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].instrument, "bmi");
        assert_eq!(rows[0].table_installed, TableStatus::Exists);
        assert_eq!(rows[0].table_valid, ValidationVerdict::Valid);
        assert_eq!(
            rows[0].pages_valid,
            ValidationVerdict::Invalid("Missing page 'Measurements'".to_string())
        );

        assert_eq!(rows[1].instrument, "legacy");
        assert_eq!(rows[1].instrument_type, InstrumentKind::Php);
        assert_eq!(rows[1].table_installed, TableStatus::Missing);
        assert_eq!(rows[1].table_valid, ValidationVerdict::Unknown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_definition_only_affects_its_own_row() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.linst"), "text{@}height{@}Height\n").unwrap();
        std::fs::create_dir(dir.path().join("bad.linst")).unwrap();

        let schema: Arc<dyn SchemaInspector> = Arc::new(
            FakeSchema::default()
                .with_column("good", "height", "varchar(255)")
                .with_registered("good")
                .with_registered("bad"),
        );
        let checker = ConsistencyChecker::new(schema.clone(), dir.path().to_path_buf());
        let files = InstrumentFiles::new(dir.path().to_path_buf(), 0o644);

        let rows = build_instrument_rows(&schema, &checker, &files).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].instrument, "bad");
        assert_eq!(
            rows[0].table_valid,
            ValidationVerdict::Invalid(CHECK_FAILED.to_string())
        );
        assert_eq!(
            rows[0].pages_valid,
            ValidationVerdict::Invalid(CHECK_FAILED.to_string())
        );
        assert_eq!(rows[1].instrument, "good");
        assert_eq!(rows[1].table_valid, ValidationVerdict::Valid);
    }

    #[tokio::test]
    async fn registry_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let schema: Arc<dyn SchemaInspector> = Arc::new(FakeSchema::failing());
        let checker = ConsistencyChecker::new(schema.clone(), dir.path().to_path_buf());
        let files = InstrumentFiles::new(dir.path().to_path_buf(), 0o644);
        assert!(build_instrument_rows(&schema, &checker, &files).await.is_err());
    }
}
