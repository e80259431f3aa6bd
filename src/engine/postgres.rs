// =====================================================
// POSTGRESQL ENGINE
// =====================================================

use std::collections::HashMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, PgPool, Row};
use tokio::sync::{mpsc, RwLock};

use crate::db_types::{ColumnMeta, DatabaseType};
use crate::frame::Frame;
use crate::sql_builder::{PostgresDialect, SqlDialect};
use crate::table::{DbEngine, RowStream, TableHandle};

#[cfg(test)]
mod tests;

/// PostgreSQL implementation of the engine contract. Pools are created
/// lazily per DSN and kept for the lifetime of the process.
pub struct PostgresEngine {
    dialect: PostgresDialect,
    pools: RwLock<HashMap<String, PgPool>>,
}

impl Default for PostgresEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresEngine {
    pub fn new() -> Self {
        Self {
            dialect: PostgresDialect,
            pools: RwLock::new(HashMap::new()),
        }
    }

    async fn pool(&self, dsn: &str) -> Result<PgPool, String> {
        if let Some(pool) = self.pools.read().await.get(dsn) {
            return Ok(pool.clone());
        }
        log::debug!("Opening connection pool for {}.", dsn);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(dsn)
            .await
            .map_err(|e| format!("Failed to create pool for {}: {}", dsn, e))?;
        self.pools
            .write()
            .await
            .insert(dsn.to_string(), pool.clone());
        Ok(pool)
    }
}

/// Decodes one cell without consulting the declared column type; the type
/// chain covers everything the mapping tables actually hold.
fn decode_cell(row: &sqlx::postgres::PgRow, index: usize) -> Value {
    row.try_get_unchecked::<i64, _>(index)
        .map(|v| serde_json::json!(v))
        .or_else(|_| {
            row.try_get_unchecked::<i32, _>(index)
                .map(|v| serde_json::json!(v))
        })
        .or_else(|_| {
            row.try_get_unchecked::<i16, _>(index)
                .map(|v| serde_json::json!(v))
        })
        .or_else(|_| {
            row.try_get_unchecked::<f64, _>(index)
                .map(|v| serde_json::json!(v))
        })
        .or_else(|_| {
            row.try_get_unchecked::<f32, _>(index)
                .map(|v| serde_json::json!(v))
        })
        .or_else(|_| {
            row.try_get_unchecked::<bool, _>(index)
                .map(|v| serde_json::json!(v))
        })
        .or_else(|_| {
            row.try_get_unchecked::<String, _>(index)
                .map(|v| serde_json::json!(v))
        })
        .or_else(|_| {
            row.try_get_unchecked::<chrono::NaiveDateTime, _>(index)
                .map(|v| serde_json::json!(v.format("%Y-%m-%d %H:%M:%S").to_string()))
        })
        .or_else(|_| {
            row.try_get_unchecked::<chrono::NaiveDate, _>(index)
                .map(|v| serde_json::json!(v.format("%Y-%m-%d").to_string()))
        })
        .or_else(|_| {
            row.try_get_unchecked::<Vec<u8>, _>(index)
                .map(|bytes| serde_json::json!(String::from_utf8_lossy(&bytes).to_string()))
        })
        .unwrap_or(Value::Null)
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Vec<Value> {
    (0..row.columns().len())
        .map(|i| decode_cell(row, i))
        .collect()
}

/// Renders one cell as a SQL literal for the batched writes.
fn value_to_sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Replaces the `$n` placeholders with literals, highest position first so
/// `$1` never clips `$10`.
fn bind_literals(dml: &str, row: &[Value]) -> String {
    let mut statement = dml.to_string();
    for (ix, value) in row.iter().enumerate().rev() {
        statement = statement.replace(
            &format!("${}", ix + 1),
            &value_to_sql_literal(value),
        );
    }
    statement
}

/// Rows buffered ahead of the consumer by the reader task.
const FETCH_BUFFER_ROWS: usize = 1_000;

/// Chunked read cursor over an arbitrary selection. The selection is
/// executed exactly once; a reader task streams the result set into a
/// bounded channel so chunks never overlap or skip rows and at most one
/// buffer of decoded rows is held ahead of the consumer.
struct PgRowStream {
    rows: mpsc::Receiver<Result<Vec<Value>, String>>,
}

#[async_trait]
impl RowStream for PgRowStream {
    async fn fetch_chunk(&mut self, max_rows: usize) -> Result<Vec<Vec<Value>>, String> {
        collect_chunk(&mut self.rows, max_rows).await
    }
}

/// Drains up to `max_rows` rows from the reader channel. A short result
/// only occurs at the end of the result set.
async fn collect_chunk(
    rows: &mut mpsc::Receiver<Result<Vec<Value>, String>>,
    max_rows: usize,
) -> Result<Vec<Vec<Value>>, String> {
    let mut chunk = Vec::new();
    while chunk.len() < max_rows {
        match rows.recv().await {
            Some(Ok(row)) => chunk.push(row),
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(chunk)
}

#[async_trait]
impl DbEngine for PostgresEngine {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn load_table(
        &self,
        dsn: &str,
        schema: &str,
        table: &str,
    ) -> Result<TableHandle, String> {
        let pool = self.pool(dsn).await?;
        let column_rows = sqlx::query(
            "SELECT column_name, data_type, character_maximum_length, \
                    numeric_precision, numeric_scale, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| format!("Failed to introspect {}.{}: {}", schema, table, e))?;

        let mut columns = Vec::with_capacity(column_rows.len());
        let mut column_types = HashMap::with_capacity(column_rows.len());
        for row in &column_rows {
            let name: String = row
                .try_get("column_name")
                .map_err(|e| format!("Failed to read column metadata: {}", e))?;
            let data_type: String = row
                .try_get("data_type")
                .map_err(|e| format!("Failed to read column metadata: {}", e))?;
            let length: Option<i32> = row
                .try_get("character_maximum_length")
                .map_err(|e| format!("Failed to read column metadata: {}", e))?;
            let precision: Option<i32> = row
                .try_get("numeric_precision")
                .map_err(|e| format!("Failed to read column metadata: {}", e))?;
            let scale: Option<i32> = row
                .try_get("numeric_scale")
                .map_err(|e| format!("Failed to read column metadata: {}", e))?;
            let is_nullable: String = row
                .try_get("is_nullable")
                .map_err(|e| format!("Failed to read column metadata: {}", e))?;
            column_types.insert(
                name.clone(),
                ColumnMeta {
                    data_type,
                    precision,
                    scale,
                    length,
                    is_nullable: is_nullable == "YES",
                },
            );
            columns.push(name);
        }

        let mut primary_key = Vec::new();
        if !columns.is_empty() {
            let key_rows = sqlx::query(
                "SELECT kcu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 WHERE tc.constraint_type = 'PRIMARY KEY' \
                   AND tc.table_schema = $1 AND tc.table_name = $2 \
                 ORDER BY kcu.ordinal_position",
            )
            .bind(schema)
            .bind(table)
            .fetch_all(&pool)
            .await
            .map_err(|e| format!("Failed to read the key of {}.{}: {}", schema, table, e))?;
            for row in &key_rows {
                let name: String = row
                    .try_get("column_name")
                    .map_err(|e| format!("Failed to read key metadata: {}", e))?;
                primary_key.push(name);
            }
        }

        Ok(TableHandle {
            dsn: dsn.to_string(),
            schema: schema.to_string(),
            name: table.to_string(),
            columns,
            primary_key,
            column_types,
        })
    }

    async fn execute(&self, dsn: &str, query: &str) -> Result<u64, String> {
        let pool = self.pool(dsn).await?;
        let result = sqlx::query(query)
            .execute(&pool)
            .await
            .map_err(|e| format!("Statement failed: {}", e))?;
        Ok(result.rows_affected())
    }

    async fn open_stream(&self, dsn: &str, query: &str) -> Result<Box<dyn RowStream>, String> {
        let pool = self.pool(dsn).await?;
        let statement = query.trim().trim_end_matches(';').to_string();
        let (tx, rx) = mpsc::channel(FETCH_BUFFER_ROWS);
        tokio::spawn(async move {
            let mut rows = sqlx::query(&statement).fetch(&pool);
            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => {
                        // send fails once the consumer dropped the cursor
                        if tx.send(Ok(decode_row(&row))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(format!("Source read failed: {}", e))).await;
                        break;
                    }
                }
            }
        });
        Ok(Box::new(PgRowStream { rows: rx }))
    }

    async fn query_frame(&self, dsn: &str, query: &str) -> Result<Frame, String> {
        let pool = self.pool(dsn).await?;
        let rows = sqlx::query(query)
            .fetch_all(&pool)
            .await
            .map_err(|e| format!("Cache read failed: {}", e))?;
        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        Frame::from_rows(columns, rows.iter().map(decode_row).collect())
    }

    async fn write_batch(
        &self,
        dsn: &str,
        dml: &str,
        _columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, String> {
        let pool = self.pool(dsn).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| format!("Failed to open a transaction: {}", e))?;
        let mut written = 0u64;
        for row in rows {
            let statement = bind_literals(dml, row);
            let result = sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| format!("Batch write failed: {}", e))?;
            written += result.rows_affected();
        }
        tx.commit()
            .await
            .map_err(|e| format!("Commit failed: {}", e))?;
        Ok(written)
    }

    async fn import_block(
        &self,
        table: &TableHandle,
        block: &Frame,
        dml: &str,
        commit_rate: usize,
    ) -> Result<u64, String> {
        let mut written = 0u64;
        for chunk in block.rows().chunks(commit_rate.max(1)) {
            written += self
                .write_batch(&table.dsn, dml, block.columns(), chunk)
                .await?;
        }
        log::debug!(
            "Imported {} rows into {}.{}.",
            written,
            table.schema,
            table.name
        );
        Ok(written)
    }
}
