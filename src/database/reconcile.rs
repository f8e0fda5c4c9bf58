use std::fmt;

use tracing::{debug, error, warn};

use crate::database::repo::Store;
use crate::error::{ExtractError, Result};
use crate::ingest::record::{ColumnSet, MetadataRecord};

/// Result of reconciling one record against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    Inserted,
    Updated,
    Unchanged,
    Error(String),
}

impl fmt::Display for DedupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupOutcome::Inserted => write!(f, "inserted"),
            DedupOutcome::Updated => write!(f, "updated"),
            DedupOutcome::Unchanged => write!(f, "unchanged"),
            DedupOutcome::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Decides insert, update or no-op for each record, keyed by `SHA256`.
///
/// Lookup and write happen inside one store transaction, so two writers
/// racing on the same hash cannot both take the insert path.
pub struct DedupReconciler<S: Store> {
    store: S,
    table: String,
    columns: ColumnSet,
}

impl<S: Store> DedupReconciler<S> {
    pub fn new(store: S, table: impl Into<String>, columns: ColumnSet) -> Self {
        Self {
            store,
            table: table.into(),
            columns,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn reconcile(&self, record: &MetadataRecord) -> DedupOutcome {
        match self.try_reconcile(record) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    file = record.file_name(),
                    directory = record.directory(),
                    sha256 = record.sha256(),
                    error = %e,
                    "Reconciliation failed"
                );
                DedupOutcome::Error(e.to_string())
            }
        }
    }

    fn try_reconcile(&self, record: &MetadataRecord) -> Result<DedupOutcome> {
        if record.sha256().is_empty() {
            return Ok(DedupOutcome::Error("record has no SHA256".to_string()));
        }

        self.store.begin()?;
        match self.decide_and_write(record) {
            Ok(outcome) => {
                self.store.commit()?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = self.store.rollback() {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn decide_and_write(&self, record: &MetadataRecord) -> Result<DedupOutcome> {
        let sha256 = record.sha256();
        let rows = self.store.count_by_hash(&self.table, sha256)?;
        debug!(sha256, rows, "Existing rows for hash");

        match rows {
            0 => {
                self.store.insert(&self.table, &self.columns, record)?;
                Ok(DedupOutcome::Inserted)
            }
            1 => {
                let stored = self
                    .store
                    .fetch_by_hash(&self.table, sha256, &self.columns)?
                    .unwrap_or_default();
                let fresh = record.values_for(&self.columns);
                if stored == fresh {
                    return Ok(DedupOutcome::Unchanged);
                }

                for ((column, old), new) in self.columns.names().iter().zip(&stored).zip(&fresh) {
                    if old != new {
                        debug!(sha256, %column, stored = %old, extracted = %new, "Field differs");
                    }
                }
                let hit = self
                    .store
                    .update_by_hash(&self.table, sha256, &self.columns, record)?;
                if hit != 1 {
                    return Err(rusqlite::Error::StatementChangedRows(hit).into());
                }
                Ok(DedupOutcome::Updated)
            }
            rows => Err(ExtractError::InvariantViolation {
                sha256: sha256.to_string(),
                rows,
            }),
        }
    }
}
