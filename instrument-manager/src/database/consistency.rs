// Definition-to-schema consistency checks
//
// Both checks walk the definition in declaration order and stop at the first problem.

use anyhow::Result;
use log::{debug, info};
use serde::ser::SerializeStruct;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::database::schema_inspector::{ColumnType, SchemaInspector};
use crate::instrument::definition::{
    definition_path, parse_file, Definition, DefinitionError, Field, FieldType,
};

pub const APPEARS_VALID: &str = "Appears Valid";

/// Reason attached to `Unknown` in structured output.
pub const NO_DEFINITION_REASON: &str = "no definition file present";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Valid,
    Invalid(String),
    /// No definition file exists for the instrument.
    Unknown,
}

impl ValidationVerdict {
    /// Listing cell text: `Appears Valid`, the failure reason, or `?`.
    pub fn display_text(&self) -> &str {
        match self {
            ValidationVerdict::Valid => APPEARS_VALID,
            ValidationVerdict::Invalid(reason) => reason,
            ValidationVerdict::Unknown => "?",
        }
    }
}

/// `{"verdict": "valid"}`, `{"verdict": "invalid", "reason": ...}` or `{"verdict": "unknown", "reason": ...}`.
impl Serialize for ValidationVerdict {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (verdict, reason) = match self {
            ValidationVerdict::Valid => ("valid", None),
            ValidationVerdict::Invalid(reason) => ("invalid", Some(reason.as_str())),
            ValidationVerdict::Unknown => ("unknown", Some(NO_DEFINITION_REASON)),
        };
        let mut state = serializer.serialize_struct("ValidationVerdict", 1 + reason.is_some() as usize)?;
        state.serialize_field("verdict", verdict)?;
        if let Some(reason) = reason {
            state.serialize_field("reason", reason)?;
        }
        state.end()
    }
}

impl std::fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_text())
    }
}

fn required_column_type(field_type: FieldType) -> Option<ColumnType> {
    match field_type {
        // Multi-valued selections are stored as delimited text in a varchar column.
        FieldType::Text | FieldType::SelectMultiple => Some(ColumnType::Varchar),
        FieldType::TextArea => Some(ColumnType::Text),
        FieldType::Date => Some(ColumnType::Date),
        FieldType::Select => None,
    }
}

pub struct ConsistencyChecker {
    inspector: Arc<dyn SchemaInspector>,
    instruments_dir: PathBuf,
}

impl ConsistencyChecker {
    pub fn new(inspector: Arc<dyn SchemaInspector>, instruments_dir: PathBuf) -> Self {
        Self {
            inspector,
            instruments_dir,
        }
    }

    async fn load(&self, instrument: &str) -> Result<Option<Definition>> {
        match parse_file(&definition_path(&self.instruments_dir, instrument)).await {
            Ok(def) => Ok(Some(def)),
            Err(DefinitionError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Does the instrument's table match its definition's fields?
    pub async fn check_schema(&self, instrument: &str) -> Result<ValidationVerdict> {
        let Some(definition) = self.load(instrument).await? else {
            debug!(
                "[PHASE: validate] [STEP: check_schema] No definition file for {}",
                instrument
            );
            return Ok(ValidationVerdict::Unknown);
        };

        for field in definition.fields() {
            if let Some(reason) = self.check_field(instrument, field).await? {
                info!(
                    "[PHASE: validate] [STEP: check_schema] {} invalid: {}",
                    instrument, reason
                );
                return Ok(ValidationVerdict::Invalid(reason));
            }
        }

        Ok(ValidationVerdict::Valid)
    }

    async fn check_field(&self, table: &str, field: &Field) -> Result<Option<String>> {
        if let Some(expected) = required_column_type(field.field_type) {
            let ok = self
                .inspector
                .column_exists(table, &field.name, expected)
                .await?;
            return Ok((!ok).then(|| format!("Column {} invalid", field.name)));
        }

        // Enum options are compared as the literal stored signature, so order matters.
        let stored = self.inspector.enum_definition(table, &field.name).await?;
        if stored.as_deref() != Some(field.expected_enum_signature().as_str()) {
            return Ok(Some(format!("{} enum invalid", field.name)));
        }
        Ok(None)
    }

    /// Does every declared page have a description row?
    pub async fn check_pages(&self, instrument: &str) -> Result<ValidationVerdict> {
        let Some(definition) = self.load(instrument).await? else {
            return Ok(ValidationVerdict::Unknown);
        };

        for title in definition.page_titles() {
            if !self
                .inspector
                .page_description_exists(instrument, title)
                .await?
            {
                info!(
                    "[PHASE: validate] [STEP: check_pages] {} is missing page '{}'",
                    instrument, title
                );
                return Ok(ValidationVerdict::Invalid(format!("Missing page '{}'", title)));
            }
        }

        Ok(ValidationVerdict::Valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::schema_inspector::fake::FakeSchema;
    use std::sync::atomic::Ordering;

    fn checker(dir: &tempfile::TempDir, schema: FakeSchema) -> (ConsistencyChecker, Arc<FakeSchema>) {
        let schema = Arc::new(schema);
        (
            ConsistencyChecker::new(schema.clone(), dir.path().to_path_buf()),
            schema,
        )
    }

    fn write_def(dir: &tempfile::TempDir, name: &str, contents: &str) {
        std::fs::write(definition_path(dir.path(), name), contents).unwrap();
    }

    #[tokio::test]
    async fn text_field_against_varchar_then_int() {
        let dir = tempfile::tempdir().unwrap();
        write_def(&dir, "scores", "text{@}Score{@}Score\n");

        let (c, _) = checker(&dir, FakeSchema::default().with_column("scores", "Score", "varchar(255)"));
        assert_eq!(c.check_schema("scores").await.unwrap(), ValidationVerdict::Valid);

        let (c, _) = checker(&dir, FakeSchema::default().with_column("scores", "Score", "int(11)"));
        assert_eq!(
            c.check_schema("scores").await.unwrap(),
            ValidationVerdict::Invalid("Column Score invalid".to_string())
        );
    }

    #[tokio::test]
    async fn each_column_type_mapping_accepts_its_data_type() {
        let dir = tempfile::tempdir().unwrap();
        write_def(
            &dir,
            "all",
            "text{@}t\ntextarea{@}ta\ndate{@}d\nselectmultiple{@}sm{@}SM{@}'x'=>'X'\nselect{@}s{@}S{@}'a'=>'A'\n",
        );
        let schema = FakeSchema::default()
            .with_column("all", "t", "varchar(255)")
            .with_column("all", "ta", "text")
            .with_column("all", "d", "date")
            .with_column("all", "sm", "varchar(255)")
            .with_column("all", "s", "enum('a')");
        let (c, _) = checker(&dir, schema);
        assert_eq!(c.check_schema("all").await.unwrap(), ValidationVerdict::Valid);
    }

    #[tokio::test]
    async fn date_and_textarea_reject_other_data_types() {
        let dir = tempfile::tempdir().unwrap();
        write_def(&dir, "d", "date{@}when\n");
        let (c, _) = checker(&dir, FakeSchema::default().with_column("d", "when", "date"));
        assert_eq!(c.check_schema("d").await.unwrap(), ValidationVerdict::Valid);
        let (c, _) = checker(&dir, FakeSchema::default().with_column("d", "when", "datetime"));
        assert_eq!(
            c.check_schema("d").await.unwrap(),
            ValidationVerdict::Invalid("Column when invalid".to_string())
        );

        write_def(&dir, "n", "textarea{@}notes\n");
        let (c, _) = checker(&dir, FakeSchema::default().with_column("n", "notes", "text"));
        assert_eq!(c.check_schema("n").await.unwrap(), ValidationVerdict::Valid);
        let (c, _) = checker(&dir, FakeSchema::default().with_column("n", "notes", "varchar(255)"));
        assert_eq!(
            c.check_schema("n").await.unwrap(),
            ValidationVerdict::Invalid("Column notes invalid".to_string())
        );
    }

    #[tokio::test]
    async fn missing_definition_is_unknown_regardless_of_database() {
        let dir = tempfile::tempdir().unwrap();
        let (c, schema) = checker(&dir, FakeSchema::failing());
        assert_eq!(c.check_schema("nope").await.unwrap(), ValidationVerdict::Unknown);
        assert_eq!(c.check_pages("nope").await.unwrap(), ValidationVerdict::Unknown);
        assert_eq!(schema.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_mismatch_in_declaration_order_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_def(
            &dir,
            "multi",
            "text{@}a\ntextarea{@}b\ndate{@}c\nselectmultiple{@}d{@}D{@}'x'=>'X'\n",
        );
        let schema = FakeSchema::default()
            .with_column("multi", "a", "varchar(255)")
            .with_column("multi", "b", "varchar(255)")
            .with_column("multi", "c", "varchar(10)");
        let (c, schema) = checker(&dir, schema);

        assert_eq!(
            c.check_schema("multi").await.unwrap(),
            ValidationVerdict::Invalid("Column b invalid".to_string())
        );
        // Stops after the first failing field.
        assert_eq!(schema.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reordering_later_fields_keeps_the_same_error() {
        let dir = tempfile::tempdir().unwrap();
        let schema = || {
            FakeSchema::default()
                .with_column("inst", "a", "date")
                .with_column("inst", "b", "varchar(255)")
                .with_column("inst", "c", "text")
        };

        write_def(&dir, "inst", "text{@}a\ntext{@}b\ntextarea{@}c\n");
        let (c, _) = checker(&dir, schema());
        let first = c.check_schema("inst").await.unwrap();

        write_def(&dir, "inst", "text{@}a\ntextarea{@}c\ntext{@}b\n");
        let (c, _) = checker(&dir, schema());
        assert_eq!(c.check_schema("inst").await.unwrap(), first);
        assert_eq!(first, ValidationVerdict::Invalid("Column a invalid".to_string()));
    }

    #[tokio::test]
    async fn enum_check_is_order_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        write_def(&dir, "e", "select{@}choice{@}Choice{@}NULL=>''{-}'A'=>'A'{-}'B'=>'B'\n");

        let (c, _) = checker(&dir, FakeSchema::default().with_column("e", "choice", "enum('A','B')"));
        assert_eq!(c.check_schema("e").await.unwrap(), ValidationVerdict::Valid);

        let (c, _) = checker(&dir, FakeSchema::default().with_column("e", "choice", "enum('B','A')"));
        assert_eq!(
            c.check_schema("e").await.unwrap(),
            ValidationVerdict::Invalid("choice enum invalid".to_string())
        );
    }

    #[tokio::test]
    async fn enum_check_fails_when_column_is_not_an_enum() {
        let dir = tempfile::tempdir().unwrap();
        write_def(&dir, "e", "select{@}choice{@}Choice{@}'A'=>'A'\n");
        let (c, _) = checker(&dir, FakeSchema::default().with_column("e", "choice", "varchar(255)"));
        assert_eq!(
            c.check_schema("e").await.unwrap(),
            ValidationVerdict::Invalid("choice enum invalid".to_string())
        );
    }

    #[tokio::test]
    async fn examiner_and_decorative_lines_need_no_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_def(
            &dir,
            "deco",
            "table{@}deco\ntitle{@}Deco\npage{@}p1{@}One\nselect{@}Examiner{@}Examiner{@}NULL=>''\nstatic{@}s{@}S\n",
        );
        let (c, _) = checker(&dir, FakeSchema::default());
        assert_eq!(c.check_schema("deco").await.unwrap(), ValidationVerdict::Valid);
    }

    #[tokio::test]
    async fn pages_are_matched_on_trimmed_titles() {
        let dir = tempfile::tempdir().unwrap();
        write_def(&dir, "p", "page{@}p1{@} First \npage{@}p2{@}Second\npage{@}p3{@}Third\n");
        let schema = FakeSchema::default()
            .with_page("p", "First")
            .with_page("p", "Third");
        let (c, _) = checker(&dir, schema);
        assert_eq!(
            c.check_pages("p").await.unwrap(),
            ValidationVerdict::Invalid("Missing page 'Second'".to_string())
        );
    }

    #[tokio::test]
    async fn definition_without_pages_has_valid_pages() {
        let dir = tempfile::tempdir().unwrap();
        write_def(&dir, "np", "text{@}a\n");
        let (c, _) = checker(&dir, FakeSchema::default());
        assert_eq!(c.check_pages("np").await.unwrap(), ValidationVerdict::Valid);
    }

    #[tokio::test]
    async fn store_failure_propagates_as_error() {
        let dir = tempfile::tempdir().unwrap();
        write_def(&dir, "x", "text{@}a\n");
        let (c, _) = checker(&dir, FakeSchema::failing());
        assert!(c.check_schema("x").await.is_err());
    }

    #[test]
    fn verdict_json_carries_reasons() {
        assert_eq!(
            serde_json::to_value(ValidationVerdict::Valid).unwrap(),
            serde_json::json!({"verdict": "valid"})
        );
        assert_eq!(
            serde_json::to_value(ValidationVerdict::Unknown).unwrap(),
            serde_json::json!({"verdict": "unknown", "reason": "no definition file present"})
        );
        assert_eq!(
            serde_json::to_value(ValidationVerdict::Invalid("Column x invalid".to_string())).unwrap(),
            serde_json::json!({"verdict": "invalid", "reason": "Column x invalid"})
        );
    }

    #[test]
    fn verdict_display_text() {
        assert_eq!(ValidationVerdict::Valid.to_string(), "Appears Valid");
        assert_eq!(ValidationVerdict::Unknown.to_string(), "?");
        assert_eq!(
            ValidationVerdict::Invalid("Column x invalid".to_string()).to_string(),
            "Column x invalid"
        );
    }
}
