// =====================================================
// TABLE ABSTRACTION
// Narrow contract the mapping engine expects from every
// database backend: schema introspection plus the bulk
// primitives used by the transfer loop.
// =====================================================

use crate::db_types::{ColumnMeta, DatabaseType, DedupCriteria};
use crate::frame::Frame;
use crate::sql_builder::SqlDialect;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;


/// Hard cap on rows per fetch regardless of the memory budget.
pub const MAX_CHUNK_ROWS: usize = 100_000;
/// Fixed chunk size when the source carries LOB/XML columns, whose per-row
/// payload cannot be estimated from column metadata.
pub const LOB_CHUNK_ROWS: usize = 1_000;
/// Commit rate of the block import used by the masked path.
pub const DEFAULT_COMMIT_RATE: usize = 5_000;
/// Default memory budget per transfer, 100 MB.
pub const DEFAULT_MAX_MEMORY: u64 = 104_857_600;
/// Upper bound on repeated duplicate-removal passes before giving up.
const MAX_DEDUP_PASSES: usize = 100;

/// Resolved structure of one physical table or view. An empty column list
/// signals "object does not exist" and every caller must check it.
#[derive(Debug, Clone, Default)]
pub struct TableHandle {
    pub dsn: String,
    pub schema: String,
    pub name: String,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub column_types: HashMap<String, ColumnMeta>,
}

impl TableHandle {
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn lob_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| {
                self.column_types
                    .get(c.as_str())
                    .map(|meta| meta.is_lob())
                    .unwrap_or(false)
            })
            .map(|c| c.as_str())
            .collect()
    }

    /// Worst-case byte size of one row, estimated from declared column
    /// lengths. Columns without a declared length count a fixed 32 bytes.
    pub fn max_row_bytes(&self) -> u64 {
        let total: u64 = self
            .columns
            .iter()
            .map(|c| {
                self.column_types
                    .get(c.as_str())
                    .and_then(|meta| meta.length.or(meta.precision))
                    .map(|len| len.max(1) as u64)
                    .unwrap_or(32)
            })
            .sum();
        total.max(1)
    }

    /// Rows per fetch for the given memory budget. LOB columns force the
    /// small fixed chunk because their payload size is unpredictable.
    pub fn chunk_size(&self, max_memory_bytes: u64) -> usize {
        if !self.lob_columns().is_empty() {
            return LOB_CHUNK_ROWS;
        }
        let rows = (max_memory_bytes / self.max_row_bytes()) as usize;
        rows.clamp(1, MAX_CHUNK_ROWS)
    }
}

/// Incremental read cursor over one executed source query.
#[async_trait]
pub trait RowStream: Send {
    /// Returns up to `max_rows` rows; an empty result means the cursor is
    /// exhausted.
    async fn fetch_chunk(&mut self, max_rows: usize) -> Result<Vec<Vec<Value>>, String>;
}

/// One implementation per database engine. Oracle, DB2, HANA and Netezza
/// implementations live outside this crate; their dialects ship here so the
/// generated SQL is correct regardless of where the driver runs.
#[async_trait]
pub trait DbEngine: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    fn dialect(&self) -> &dyn SqlDialect;

    /// Introspects one table/view. A missing object yields a handle with an
    /// empty column list, not an error.
    async fn load_table(
        &self,
        dsn: &str,
        schema: &str,
        table: &str,
    ) -> Result<TableHandle, String>;

    /// Executes one statement and returns the affected row count. Used for
    /// TRUNCATE, MERGE and the deduplication deletes.
    async fn execute(&self, dsn: &str, query: &str) -> Result<u64, String>;

    /// Opens a chunked read cursor over the given query.
    async fn open_stream(&self, dsn: &str, query: &str) -> Result<Box<dyn RowStream>, String>;

    /// Runs a selection completely and returns it with the result-set
    /// column names. Used for the lookup caches, which are small enough to
    /// hold in memory.
    async fn query_frame(&self, dsn: &str, query: &str) -> Result<Frame, String>;

    /// Writes one batch of rows through the prepared DML and commits. The
    /// row values are bound positionally in `columns` order.
    async fn write_batch(
        &self,
        dsn: &str,
        dml: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, String>;

    /// Bulk import of a masked block, internally committing every
    /// `commit_rate` rows.
    async fn import_block(
        &self,
        table: &TableHandle,
        block: &Frame,
        dml: &str,
        commit_rate: usize,
    ) -> Result<u64, String>;

    async fn truncate_table(&self, table: &TableHandle) -> Result<(), String> {
        let stmt = format!(
            "TRUNCATE TABLE {}",
            self.dialect().qualified_table(&table.schema, &table.name)
        );
        self.execute(&table.dsn, &stmt).await.map(|_| ())
    }

    /// Deletes rows in excess of one per key group, keeping the row the
    /// criteria selects.
    async fn deduplicate_rows(
        &self,
        table: &TableHandle,
        criteria: DedupCriteria,
        keys: &[String],
    ) -> Result<(), String> {
        if keys.is_empty() {
            return Err(format!(
                "Deduplication on {}.{} requires a business key",
                table.schema, table.name
            ));
        }
        let stmt = self
            .dialect()
            .dedup_statement(&table.schema, &table.name, criteria, keys)?;
        // rowid/ctid based statements remove one surplus row per group and
        // pass, so repeat until the statement no longer hits anything.
        for _ in 0..MAX_DEDUP_PASSES {
            let affected = self.execute(&table.dsn, &stmt).await?;
            if affected == 0 {
                return Ok(());
            }
        }
        Err(format!(
            "Deduplication on {}.{} did not converge after {} passes",
            table.schema, table.name, MAX_DEDUP_PASSES
        ))
    }
}

/// Static map from database type to engine implementation, resolved once at
/// startup.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<DatabaseType, Arc<dyn DbEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn DbEngine>) {
        self.engines.insert(engine.db_type(), engine);
    }

    pub fn get(&self, db_type: DatabaseType) -> Result<Arc<dyn DbEngine>, String> {
        self.engines
            .get(&db_type)
            .cloned()
            .ok_or_else(|| format!("No engine registered for database type {}", db_type.as_str()))
    }
}
