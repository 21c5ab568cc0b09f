//! Module target tables.
//!
//! Each module writes its results into a per-run table with a declared field
//! schema. The table is set up once at worker initialization (existing
//! tables are extended with missing columns) and the registry row's
//! timestamp is updated on every successful write batch.

use super::{Database, DbError, check_identifier};

/// One declared column of a target table.
#[derive(Debug, Clone)]
pub struct TargetField {
    pub name: String,
    pub sql_type: String,
}

impl TargetField {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// A dynamically-typed value bound into a target-table insert.
#[derive(Debug, Clone)]
pub enum DbValue {
    Text(String),
    Int(i64),
    Float(f64),
    Null,
}

impl From<String> for DbValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<i64> for DbValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for DbValue {
    fn from(value: u64) -> Self {
        Self::Int(value as i64)
    }
}

impl Database {
    /// Create or extend a target table with the declared fields and register
    /// it under its namespace.
    pub async fn init_target_table(
        &self,
        ns: &str,
        table: &str,
        fields: &[TargetField],
    ) -> Result<(), DbError> {
        check_identifier(ns)?;
        check_identifier(table)?;

        for field in fields {
            check_identifier(&field.name)?;
        }

        let columns = fields
            .iter()
            .map(|field| format!("{} {}", field.name, field.sql_type))
            .collect::<Vec<_>>()
            .join(", ");

        let body = if columns.is_empty() {
            String::new()
        } else {
            format!(", {columns}")
        };

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY AUTOINCREMENT{body})"
        ))
        .execute(self.pool())
        .await?;

        // extend an existing table with newly-declared columns
        let existing = self.table_columns(table).await?;

        for field in fields {
            if !existing.iter().any(|column| column == &field.name) {
                sqlx::query(&format!(
                    "ALTER TABLE {table} ADD COLUMN {} {}",
                    field.name, field.sql_type
                ))
                .execute(self.pool())
                .await?;
            }
        }

        sqlx::query(
            "INSERT INTO targets (namespace, name) VALUES (?, ?) \
             ON CONFLICT(namespace, name) DO NOTHING",
        )
        .bind(ns)
        .bind(table)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Insert one row of `(column, value)` pairs into a target table.
    pub async fn insert_target_row(
        &self,
        table: &str,
        row: &[(String, DbValue)],
    ) -> Result<(), DbError> {
        check_identifier(table)?;

        if row.is_empty() {
            return Ok(());
        }

        for (column, _) in row {
            check_identifier(column)?;
        }

        let columns = row
            .iter()
            .map(|(column, _)| column.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; row.len()].join(", ");

        let sql = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");
        let mut query = sqlx::query(&sql);

        for (_, value) in row {
            query = match value {
                DbValue::Text(text) => query.bind(text.clone()),
                DbValue::Int(number) => query.bind(*number),
                DbValue::Float(number) => query.bind(*number),
                DbValue::Null => query.bind(None::<String>),
            };
        }

        query.execute(self.pool()).await?;

        Ok(())
    }

    /// Update the registry timestamp after a successful write batch.
    pub async fn touch_target(&self, ns: &str, table: &str) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE targets SET updated = datetime('now') WHERE namespace = ? AND name = ?",
        )
        .bind(ns)
        .bind(table)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Read one column of the latest row keyed by `url_id`, as a string.
    /// Used by extractor variables sourced from previously-parsed columns.
    pub async fn target_value(
        &self,
        table: &str,
        url_id: i64,
        column: &str,
    ) -> Result<Option<String>, DbError> {
        check_identifier(table)?;
        check_identifier(column)?;

        let row: Option<(Option<String>,)> = sqlx::query_as(&format!(
            "SELECT CAST({column} AS TEXT) FROM {table} \
             WHERE url_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(url_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.and_then(|(value,)| value))
    }

    /// Rows feeding a corpus: `(url_id, article id, datetime, text)` in
    /// article-id order.
    pub async fn fetch_corpus_rows(
        &self,
        table: &str,
        id_column: &str,
        datetime_column: &str,
        text_column: &str,
    ) -> Result<Vec<(i64, String, Option<String>, String)>, DbError> {
        check_identifier(table)?;
        check_identifier(id_column)?;
        check_identifier(datetime_column)?;
        check_identifier(text_column)?;

        Ok(sqlx::query_as(&format!(
            "SELECT url_id, CAST({id_column} AS TEXT), {datetime_column}, \
             COALESCE(CAST({text_column} AS TEXT), '') \
             FROM {table} ORDER BY {id_column}"
        ))
        .fetch_all(self.pool())
        .await?)
    }

    /// Number of rows in a target table, mostly for tests and the export
    /// path.
    pub async fn count_target_rows(&self, table: &str) -> Result<i64, DbError> {
        check_identifier(table)?;

        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn declared_schema_is_created_and_extended() {
        let db = Database::open_in_memory().await.unwrap();

        let fields = vec![
            TargetField::new("extracted_id", "TEXT"),
            TargetField::new("extracted_datetime", "TEXT"),
        ];

        db.init_target_table("ns", "ns_extracted_articles", &fields)
            .await
            .unwrap();

        // re-initializing with an extra field alters the table in place
        let mut extended = fields.clone();

        extended.push(TargetField::new("extracted__title", "TEXT"));

        db.init_target_table("ns", "ns_extracted_articles", &extended)
            .await
            .unwrap();

        let columns = db.table_columns("ns_extracted_articles").await.unwrap();

        assert!(columns.contains(&"extracted__title".to_owned()));
    }

    #[tokio::test]
    async fn rows_insert_with_mixed_types() {
        let db = Database::open_in_memory().await.unwrap();

        db.init_target_table(
            "ns",
            "ns_analyzed_words",
            &[
                TargetField::new("analyzed_date", "TEXT"),
                TargetField::new("analyzed_n", "INTEGER"),
            ],
        )
        .await
        .unwrap();

        db.insert_target_row(
            "ns_analyzed_words",
            &[
                ("analyzed_date".to_owned(), DbValue::Text("2020-01".to_owned())),
                ("analyzed_n".to_owned(), DbValue::Int(5)),
            ],
        )
        .await
        .unwrap();

        assert_eq!(db.count_target_rows("ns_analyzed_words").await.unwrap(), 1);

        let row = sqlx::query("SELECT analyzed_date, analyzed_n FROM ns_analyzed_words")
            .fetch_one(db.pool())
            .await
            .unwrap();

        assert_eq!(row.get::<String, _>(0), "2020-01");
        assert_eq!(row.get::<i64, _>(1), 5);
    }

    #[tokio::test]
    async fn touch_updates_the_registry_timestamp() {
        let db = Database::open_in_memory().await.unwrap();

        db.init_target_table("ns", "ns_t", &[TargetField::new("v", "TEXT")])
            .await
            .unwrap();

        db.touch_target("ns", "ns_t").await.unwrap();

        let (updated,): (String,) =
            sqlx::query_as("SELECT updated FROM targets WHERE namespace = 'ns' AND name = 'ns_t'")
                .fetch_one(db.pool())
                .await
                .unwrap();

        assert!(!updated.is_empty());
    }
}
