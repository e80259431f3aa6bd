use super::*;
use crate::db_types::{ColumnMeta, DatabaseType};
use crate::masking::cache::RuleCaches;
use crate::repository::{MaskRule, MaskRuleSet, RuleName};
use crate::sql_builder::{PostgresDialect, SqlDialect};
use crate::table::RowStream;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct MockStream {
    remaining: usize,
    row: Vec<Value>,
}

#[async_trait]
impl RowStream for MockStream {
    async fn fetch_chunk(&mut self, max_rows: usize) -> Result<Vec<Vec<Value>>, String> {
        let take = self.remaining.min(max_rows);
        self.remaining -= take;
        Ok(vec![self.row.clone(); take])
    }
}

#[derive(Default)]
struct MockEngine {
    dialect: PostgresDialect,
    stream_rows: usize,
    stream_row: Vec<Value>,
    batches: Mutex<Vec<usize>>,
    imported: Mutex<Vec<Frame>>,
}

#[async_trait]
impl DbEngine for MockEngine {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn load_table(
        &self,
        _dsn: &str,
        _schema: &str,
        _table: &str,
    ) -> Result<TableHandle, String> {
        Err("not used".to_string())
    }

    async fn execute(&self, _dsn: &str, _query: &str) -> Result<u64, String> {
        Ok(0)
    }

    async fn open_stream(
        &self,
        _dsn: &str,
        _query: &str,
    ) -> Result<Box<dyn RowStream>, String> {
        Ok(Box::new(MockStream {
            remaining: self.stream_rows,
            row: self.stream_row.clone(),
        }))
    }

    async fn query_frame(&self, _dsn: &str, _query: &str) -> Result<Frame, String> {
        Err("not used".to_string())
    }

    async fn write_batch(
        &self,
        _dsn: &str,
        _dml: &str,
        _columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, String> {
        self.batches.lock().unwrap().push(rows.len());
        Ok(rows.len() as u64)
    }

    async fn import_block(
        &self,
        _table: &TableHandle,
        block: &Frame,
        _dml: &str,
        _commit_rate: usize,
    ) -> Result<u64, String> {
        self.imported.lock().unwrap().push(block.clone());
        Ok(block.len() as u64)
    }
}

fn handle(columns: &[&str], lengths: &[(&str, i32)]) -> TableHandle {
    let mut column_types = HashMap::new();
    for (name, length) in lengths {
        column_types.insert(
            name.to_string(),
            ColumnMeta {
                data_type: "VARCHAR".to_string(),
                precision: None,
                scale: None,
                length: Some(*length),
                is_nullable: true,
            },
        );
    }
    TableHandle {
        dsn: "mock".to_string(),
        schema: "TDM".to_string(),
        name: "PARTNER".to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        primary_key: vec!["ID".to_string()],
        column_types,
    }
}

#[tokio::test]
async fn copy_runs_in_memory_bounded_cycles() {
    let engine = MockEngine {
        stream_rows: 250_000,
        stream_row: vec![json!(1)],
        ..Default::default()
    };
    let source = handle(&["ID"], &[("ID", 100)]);
    let target = handle(&["ID"], &[("ID", 100)]);
    let columns = vec!["ID".to_string()];
    // 5 MB budget over 100-byte rows gives 50k-row chunks.
    let written = copy_data(
        &engine,
        &engine,
        &source,
        &target,
        "SELECT 1",
        "INSERT",
        &columns,
        5_000_000,
    )
    .await
    .unwrap();
    assert_eq!(written, 250_000);
    assert_eq!(*engine.batches.lock().unwrap(), vec![50_000; 5]);
}

#[tokio::test]
async fn copy_of_an_empty_selection_writes_nothing() {
    let engine = MockEngine::default();
    let source = handle(&["ID"], &[("ID", 100)]);
    let target = handle(&["ID"], &[("ID", 100)]);
    let columns = vec!["ID".to_string()];
    let written = copy_data(
        &engine,
        &engine,
        &source,
        &target,
        "SELECT 1",
        "INSERT",
        &columns,
        5_000_000,
    )
    .await
    .unwrap();
    assert_eq!(written, 0);
    assert!(engine.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn masked_blocks_pass_through_the_rule_set() {
    let engine = MockEngine {
        stream_rows: 3,
        stream_row: vec![json!(1), json!("Müller")],
        ..Default::default()
    };
    let source = handle(&["ID", "NACHNAME"], &[]);
    let target = handle(&["ID", "NACHNAME"], &[]);
    let columns = vec!["ID".to_string(), "NACHNAME".to_string()];
    let rules = MaskRuleSet::from_rows(vec![MaskRule {
        application: "KVS".to_string(),
        table: "PARTNER".to_string(),
        attributes: vec!["NACHNAME".to_string()],
        rule_name: RuleName::R16,
        rule_over: false,
        lkp_dsn: None,
        lkp_schema: None,
        lkp_obj: None,
        lkp_cols: vec![None],
        lkp_id: None,
        translate_expression: None,
        default_value_1: Some("ANONYM".to_string()),
        default_value_2: None,
        default_value_3: None,
        format_string: None,
        column_lengths: vec![None],
    }]);
    let written = mask_data(
        &engine,
        &engine,
        &source,
        &target,
        "SELECT 1",
        "INSERT",
        &columns,
        &rules,
        &RuleCaches::default(),
        DuplicatePolicy::DropKeepFirst,
        5_000_000,
    )
    .await
    .unwrap();
    assert_eq!(written, 3);
    let imported = engine.imported.lock().unwrap();
    assert_eq!(imported.len(), 1);
    let col = imported[0].require_column("NACHNAME").unwrap();
    assert!(imported[0].rows().iter().all(|r| r[col] == json!("ANONYM")));
}
