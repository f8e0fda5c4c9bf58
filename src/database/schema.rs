use tracing::{debug, info};

use crate::database::repo::Store;
use crate::error::{ExtractError, Result};
use crate::ingest::record::{fields, ColumnSet, FIELD_SET_VERSION};

pub const ID_COLUMN: &str = "id";

/// Double-quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn create_table_sql(table: &str, columns: &[String]) -> String {
    let mut definitions = vec![format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(ID_COLUMN))];
    definitions.extend(
        columns
            .iter()
            .map(|c| format!("{} TEXT DEFAULT ''", quote_ident(c))),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(table),
        definitions.join(",\n    ")
    )
}

pub(crate) fn add_column_sql(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} TEXT DEFAULT ''",
        quote_ident(table),
        quote_ident(column)
    )
}

pub(crate) fn hash_index_sql(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("idx_{table}_sha256")),
        quote_ident(table),
        quote_ident(fields::SHA256)
    )
}

/// What a schema reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaChanges {
    pub table_created: bool,
    pub columns_added: Vec<String>,
}

/// Brings the destination table up to the expected `ColumnSet`.
///
/// Migration is additive only: missing columns are added, nothing is ever
/// dropped, renamed or narrowed. The check runs once per process; later
/// calls return without touching the store.
pub struct SchemaReconciler {
    table: String,
    columns: ColumnSet,
    reconciled: bool,
}

impl SchemaReconciler {
    pub fn new(table: impl Into<String>, columns: ColumnSet) -> Self {
        Self {
            table: table.into(),
            columns,
            reconciled: false,
        }
    }

    pub fn reconcile<S: Store>(&mut self, store: &S) -> Result<SchemaChanges> {
        if self.reconciled {
            debug!(table = %self.table, "Schema already reconciled");
            return Ok(SchemaChanges::default());
        }

        let table_created = store
            .ensure_table(&self.table, &self.columns)
            .map_err(|e| schema_error(&self.table, "create table", e))?;
        if table_created {
            info!(
                table = %self.table,
                columns = self.columns.len(),
                field_set_version = FIELD_SET_VERSION,
                "Table created"
            );
        }

        let columns_added = store
            .ensure_columns(&self.table, &self.columns)
            .map_err(|e| schema_error(&self.table, "add columns", e))?;
        for column in &columns_added {
            info!(table = %self.table, %column, "Column added");
        }

        store
            .ensure_hash_index(&self.table)
            .map_err(|e| schema_error(&self.table, "index SHA256", e))?;

        self.reconciled = true;
        Ok(SchemaChanges {
            table_created,
            columns_added,
        })
    }
}

fn schema_error(table: &str, action: &str, err: ExtractError) -> ExtractError {
    ExtractError::Schema(format!("{action} on {table} failed: {err}"))
}
