use super::*;
use serde_json::json;

#[test]
fn literals_escape_quotes_and_pass_numbers_through() {
    assert_eq!(value_to_sql_literal(&Value::Null), "NULL");
    assert_eq!(value_to_sql_literal(&json!(42)), "42");
    assert_eq!(value_to_sql_literal(&json!(1.5)), "1.5");
    assert_eq!(value_to_sql_literal(&json!(true)), "true");
    assert_eq!(value_to_sql_literal(&json!("O'Brien")), "'O''Brien'");
}

#[test]
fn binding_replaces_placeholders_highest_first() {
    let dml = "INSERT INTO t (a, b, c, d, e, f, g, h, i, j) \
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";
    let row: Vec<Value> = (1..=9)
        .map(|n| json!(n))
        .chain(std::iter::once(json!("ten")))
        .collect();
    let bound = bind_literals(dml, &row);
    // $10 must not be clipped by the $1 substitution
    assert!(bound.ends_with("VALUES (1, 2, 3, 4, 5, 6, 7, 8, 9, 'ten')"));
}

#[test]
fn binding_renders_null_cells() {
    let bound = bind_literals("INSERT INTO t (a) VALUES ($1)", &[Value::Null]);
    assert_eq!(bound, "INSERT INTO t (a) VALUES (NULL)");
}

#[tokio::test]
async fn chunks_partition_one_result_set_without_overlap() {
    let (tx, mut rx) = mpsc::channel(10);
    tokio::spawn(async move {
        for n in 0..25 {
            if tx.send(Ok(vec![json!(n)])).await.is_err() {
                break;
            }
        }
    });
    let mut seen = Vec::new();
    loop {
        let chunk = collect_chunk(&mut rx, 10).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        seen.push(chunk);
    }
    // full chunks until the tail, every row exactly once and in order
    assert_eq!(
        seen.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![10, 10, 5]
    );
    let flat: Vec<Value> = seen.into_iter().flatten().map(|mut r| r.remove(0)).collect();
    assert_eq!(flat, (0..25).map(|n| json!(n)).collect::<Vec<_>>());
}

#[tokio::test]
async fn cursor_errors_surface_to_the_reader() {
    let (tx, mut rx) = mpsc::channel(4);
    tx.send(Ok(vec![json!(1)])).await.unwrap();
    tx.send(Err("Source read failed: connection reset".to_string()))
        .await
        .unwrap();
    drop(tx);
    let first = collect_chunk(&mut rx, 1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(collect_chunk(&mut rx, 1).await.is_err());
}
