// Schema inspection
// Read-only lookups against information_schema and the instrument metadata tables

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;

use crate::database::connection::DatabaseConnection;

/// Registry of installed instruments (one row per instrument).
pub const REGISTRY_TABLE: &str = "test_names";
/// Page/subtest descriptions per instrument.
pub const PAGE_TABLE: &str = "instrument_subtests";

/// Column types the checker asks about (`information_schema.columns.DATA_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Varchar,
    Text,
    Date,
}

impl ColumnType {
    pub fn data_type(&self) -> &'static str {
        match self {
            ColumnType::Varchar => "varchar",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
        }
    }
}

/// Read-only view of the live schema and instrument metadata tables.
///
/// Absence (missing table, column or row) is reported as `false`/`None`, never as an error.
/// Errors are reserved for the store itself being unreachable.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn column_exists(&self, table: &str, column: &str, expected: ColumnType) -> Result<bool>;

    /// The stored `COLUMN_TYPE` (e.g. `enum('yes','no')`) if `column` is an enum column.
    async fn enum_definition(&self, table: &str, column: &str) -> Result<Option<String>>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn page_description_exists(&self, instrument: &str, title: &str) -> Result<bool>;

    async fn instrument_registered(&self, instrument: &str) -> Result<bool>;

    /// Registered instrument names, ordered by name.
    async fn registered_instruments(&self) -> Result<Vec<String>>;
}

pub struct MySqlSchemaInspector {
    connection: DatabaseConnection,
}

impl MySqlSchemaInspector {
    pub fn new(connection: DatabaseConnection) -> Self {
        MySqlSchemaInspector { connection }
    }

    async fn count(&self, sql: &str, binds: &[&str]) -> Result<i64> {
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        for b in binds {
            query = query.bind(*b);
        }
        query
            .fetch_one(self.connection.pool())
            .await
            .with_context(|| format!("Count query failed: {}", sql.trim()))
    }
}

#[async_trait]
impl SchemaInspector for MySqlSchemaInspector {
    async fn column_exists(&self, table: &str, column: &str, expected: ColumnType) -> Result<bool> {
        let n = self
            .count(
                r#"
                SELECT COUNT(*)
                FROM information_schema.columns
                WHERE TABLE_SCHEMA = ?
                AND TABLE_NAME = ?
                AND COLUMN_NAME = ?
                AND DATA_TYPE = ?
                "#,
                &[
                    self.connection.database_name(),
                    table,
                    column,
                    expected.data_type(),
                ],
            )
            .await?;
        debug!(
            "[PHASE: validate] [STEP: column_exists] {}.{} as {} -> {}",
            table,
            column,
            expected.data_type(),
            n
        );
        Ok(n > 0)
    }

    async fn enum_definition(&self, table: &str, column: &str) -> Result<Option<String>> {
        let column_type: Option<String> = sqlx::query_scalar::<_, String>(
            r#"
            SELECT CAST(COLUMN_TYPE AS CHAR)
            FROM information_schema.columns
            WHERE TABLE_SCHEMA = ?
            AND TABLE_NAME = ?
            AND COLUMN_NAME = ?
            AND DATA_TYPE = 'enum'
            "#,
        )
        .bind(self.connection.database_name())
        .bind(table)
        .bind(column)
        .fetch_optional(self.connection.pool())
        .await
        .with_context(|| format!("Failed to read enum definition for {}.{}", table, column))?;

        debug!(
            "[PHASE: validate] [STEP: enum_definition] {}.{} -> {:?}",
            table, column, column_type
        );
        Ok(column_type)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let n = self
            .count(
                r#"
                SELECT COUNT(*)
                FROM information_schema.tables
                WHERE TABLE_SCHEMA = ?
                AND TABLE_NAME = ?
                "#,
                &[self.connection.database_name(), table],
            )
            .await?;
        Ok(n > 0)
    }

    async fn page_description_exists(&self, instrument: &str, title: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE Test_name = ? AND Description = ?",
            PAGE_TABLE
        );
        Ok(self.count(&sql, &[instrument, title]).await? > 0)
    }

    async fn instrument_registered(&self, instrument: &str) -> Result<bool> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE Test_name = ?", REGISTRY_TABLE);
        Ok(self.count(&sql, &[instrument]).await? > 0)
    }

    async fn registered_instruments(&self) -> Result<Vec<String>> {
        let sql = format!("SELECT Test_name FROM {} ORDER BY Test_name", REGISTRY_TABLE);
        sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(self.connection.pool())
            .await
            .context("Failed to list registered instruments")
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeSchema;
    use super::*;

    #[test]
    fn column_type_maps_to_information_schema_data_type() {
        assert_eq!(ColumnType::Varchar.data_type(), "varchar");
        assert_eq!(ColumnType::Text.data_type(), "text");
        assert_eq!(ColumnType::Date.data_type(), "date");
    }

    #[tokio::test]
    async fn fake_schema_distinguishes_data_types() {
        let schema = FakeSchema::default()
            .with_column("bmi", "Score", "varchar(255)")
            .with_column("bmi", "unit", "enum('metric','imperial')");

        assert!(schema.column_exists("bmi", "Score", ColumnType::Varchar).await.unwrap());
        assert!(!schema.column_exists("bmi", "Score", ColumnType::Text).await.unwrap());
        assert_eq!(
            schema.enum_definition("bmi", "unit").await.unwrap().as_deref(),
            Some("enum('metric','imperial')")
        );
        assert_eq!(schema.enum_definition("bmi", "Score").await.unwrap(), None);
        assert!(schema.table_exists("bmi").await.unwrap());
        assert!(!schema.table_exists("other").await.unwrap());
    }
}
