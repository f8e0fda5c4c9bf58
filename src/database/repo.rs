use std::path::Path;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::database::schema::{add_column_sql, create_table_sql, hash_index_sql, quote_ident};
use crate::error::Result;
use crate::ingest::record::{fields, ColumnSet, MetadataRecord};

/// Relational operations the schema and dedup reconcilers rely on.
/// All columns are text; rows are addressed by their `SHA256` value.
pub trait Store {
    /// Column names in table order, or `None` when the table is missing.
    fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>>;

    /// Returns `true` if the table had to be created.
    fn ensure_table(&self, table: &str, columns: &ColumnSet) -> Result<bool>;

    /// Adds whatever of `columns` the table lacks and returns those names.
    fn ensure_columns(&self, table: &str, columns: &ColumnSet) -> Result<Vec<String>>;

    fn ensure_hash_index(&self, table: &str) -> Result<()>;

    fn count_by_hash(&self, table: &str, sha256: &str) -> Result<u64>;

    fn fetch_by_hash(
        &self,
        table: &str,
        sha256: &str,
        columns: &ColumnSet,
    ) -> Result<Option<Vec<String>>>;

    fn insert(&self, table: &str, columns: &ColumnSet, record: &MetadataRecord) -> Result<()>;

    /// Overwrites every column in `columns`; returns the number of rows hit.
    fn update_by_hash(
        &self,
        table: &str,
        sha256: &str,
        columns: &ColumnSet,
        record: &MetadataRecord,
    ) -> Result<usize>;

    /// Opens a write-locked unit of work; other writers wait for it.
    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// `false` when another process added the column first.
    fn add_column(&self, table: &str, column: &str) -> Result<bool> {
        match self.conn.execute_batch(&add_column_sql(table, column)) {
            Ok(()) => Ok(true),
            Err(e) => {
                let present = self
                    .table_columns(table)?
                    .is_some_and(|names| names.iter().any(|c| c == column));
                if present {
                    debug!(table, column, "Column appeared concurrently");
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Stored values read back as the string they would print as; NULL is empty.
fn value_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => hex::encode(b),
    }
}

impl Store for SqliteStore {
    fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(if names.is_empty() { None } else { Some(names) })
    }

    fn ensure_table(&self, table: &str, columns: &ColumnSet) -> Result<bool> {
        if self.table_columns(table)?.is_some() {
            return Ok(false);
        }
        self.conn
            .execute_batch(&create_table_sql(table, columns.names()))?;
        Ok(true)
    }

    fn ensure_columns(&self, table: &str, columns: &ColumnSet) -> Result<Vec<String>> {
        let existing = self.table_columns(table)?.unwrap_or_default();
        let mut added = Vec::new();
        for column in columns.names() {
            if existing.iter().any(|c| c == column) {
                continue;
            }
            if self.add_column(table, column)? {
                added.push(column.clone());
            }
        }
        Ok(added)
    }

    fn ensure_hash_index(&self, table: &str) -> Result<()> {
        self.conn.execute_batch(&hash_index_sql(table))?;
        Ok(())
    }

    fn count_by_hash(&self, table: &str, sha256: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                quote_ident(table),
                quote_ident(fields::SHA256)
            ),
            [sha256],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn fetch_by_hash(
        &self,
        table: &str,
        sha256: &str,
        columns: &ColumnSet,
    ) -> Result<Option<Vec<String>>> {
        let select_columns: Vec<String> = columns.names().iter().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 LIMIT 1",
            select_columns.join(", "),
            quote_ident(table),
            quote_ident(fields::SHA256)
        );
        let row = self
            .conn
            .query_row(&sql, [sha256], |row| {
                (0..columns.len())
                    .map(|i| row.get_ref(i).map(value_to_string))
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
            })
            .optional()?;
        Ok(row)
    }

    fn insert(&self, table: &str, columns: &ColumnSet, record: &MetadataRecord) -> Result<()> {
        let names: Vec<String> = columns.names().iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            placeholders.join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(record.values_for(columns)))?;
        Ok(())
    }

    fn update_by_hash(
        &self,
        table: &str,
        sha256: &str,
        columns: &ColumnSet,
        record: &MetadataRecord,
    ) -> Result<usize> {
        let assignments: Vec<String> = columns
            .names()
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(fields::SHA256),
            columns.len() + 1
        );
        let mut values = record.values_for(columns);
        values.push(sha256.to_string());
        Ok(self.conn.execute(&sql, params_from_iter(values))?)
    }

    fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::schema::SchemaReconciler;

    fn record(sha: &str, name: &str) -> MetadataRecord {
        MetadataRecord::from_pairs(&[("FileName", name), ("SHA256", sha)])
    }

    fn store_with_table() -> (SqliteStore, ColumnSet) {
        let store = SqliteStore::open_in_memory().unwrap();
        let columns = ColumnSet::canonical();
        SchemaReconciler::new("T", columns.clone())
            .reconcile(&store)
            .unwrap();
        (store, columns)
    }

    #[test]
    fn test_missing_table_has_no_columns() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.table_columns("nope").unwrap().is_none());
    }

    #[test]
    fn test_insert_fetch_update() {
        let (store, columns) = store_with_table();
        let sha = "f".repeat(64);

        assert_eq!(store.count_by_hash("T", &sha).unwrap(), 0);
        assert!(store.fetch_by_hash("T", &sha, &columns).unwrap().is_none());

        store.insert("T", &columns, &record(&sha, "one")).unwrap();
        assert_eq!(store.count_by_hash("T", &sha).unwrap(), 1);

        let row = store.fetch_by_hash("T", &sha, &columns).unwrap().unwrap();
        assert_eq!(row, record(&sha, "one").values_for(&columns));

        let hit = store
            .update_by_hash("T", &sha, &columns, &record(&sha, "two"))
            .unwrap();
        assert_eq!(hit, 1);
        let row = store.fetch_by_hash("T", &sha, &columns).unwrap().unwrap();
        assert_eq!(row[0], "two");
    }

    #[test]
    fn test_null_and_numeric_cells_read_as_strings() {
        let (store, columns) = store_with_table();
        store
            .connection()
            .execute(
                "INSERT INTO \"T\" (\"FileName\", \"FileSize\", \"SHA256\") VALUES (NULL, 123, 'h')",
                [],
            )
            .unwrap();
        let row = store.fetch_by_hash("T", "h", &columns).unwrap().unwrap();
        assert_eq!(row[0], "");
        assert_eq!(row[2], "123");
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (store, columns) = store_with_table();
        store.begin().unwrap();
        store.insert("T", &columns, &record("x", "tmp")).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.count_by_hash("T", "x").unwrap(), 0);
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        {
            let columns = ColumnSet::canonical();
            let store = SqliteStore::open(&path, Duration::from_millis(100)).unwrap();
            SchemaReconciler::new("T", columns.clone())
                .reconcile(&store)
                .unwrap();
            store.insert("T", &columns, &record("k", "persisted")).unwrap();
        }
        let reopened = SqliteStore::open(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(reopened.count_by_hash("T", "k").unwrap(), 1);
    }

    #[test]
    fn test_column_added_by_another_process_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        let first = SqliteStore::open(&path, Duration::from_millis(500)).unwrap();
        let second = SqliteStore::open(&path, Duration::from_millis(500)).unwrap();
        SchemaReconciler::new("T", ColumnSet::canonical())
            .reconcile(&first)
            .unwrap();

        assert!(first.add_column("T", "ClipSkip").unwrap());
        // the second process saw the column as missing before the first added it
        assert!(!second.add_column("T", "ClipSkip").unwrap());

        let columns = second.table_columns("T").unwrap().unwrap();
        assert_eq!(columns.iter().filter(|c| *c == "ClipSkip").count(), 1);
    }

    #[test]
    fn test_add_column_to_missing_table_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.add_column("Nope", "ClipSkip").is_err());
    }
}
