use super::*;
use crate::db_types::ColumnMeta;

fn table(schema: &str, name: &str, columns: &[&str], pk: &[&str]) -> TableHandle {
    TableHandle {
        dsn: String::new(),
        schema: schema.to_string(),
        name: name.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        primary_key: pk.iter().map(|c| c.to_string()).collect(),
        column_types: Default::default(),
    }
}

fn typed(mut handle: TableHandle, column: &str, data_type: &str) -> TableHandle {
    handle.column_types.insert(
        column.to_string(),
        ColumnMeta {
            data_type: data_type.to_string(),
            ..Default::default()
        },
    );
    handle
}

fn cols(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| c.to_string()).collect()
}

#[test]
fn selector_projects_in_given_order() {
    let src = table("STG", "PARTNER", &["ID", "NAME"], &["ID"]);
    let sql = create_selector(&cols(&["ID", "NAME"]), &src, &PostgresDialect);
    assert_eq!(
        sql,
        "SELECT \"STG\".\"PARTNER\".\"ID\", \"STG\".\"PARTNER\".\"NAME\" FROM \"STG\".\"PARTNER\""
    );
    // regeneration is deterministic
    assert_eq!(sql, create_selector(&cols(&["ID", "NAME"]), &src, &PostgresDialect));
}

#[test]
fn oracle_casts_xmltype_and_raw_on_select() {
    let src = typed(
        typed(table("STG", "DOC", &["ID", "PAYLOAD", "HASH"], &["ID"]), "PAYLOAD", "XMLTYPE"),
        "HASH",
        "RAW",
    );
    let sql = create_selector(&cols(&["ID", "PAYLOAD", "HASH"]), &src, &OracleDialect);
    assert!(sql.contains("xmltype.getclobval(\"STG\".\"DOC\".\"PAYLOAD\") AS \"PAYLOAD\""));
    assert!(sql.contains("RAWTOHEX(\"STG\".\"DOC\".\"HASH\") AS \"HASH\""));
    assert!(sql.contains("\"STG\".\"DOC\".\"ID\""));
}

#[test]
fn oracle_insert_uses_named_placeholders_and_xml_constructor() {
    let tgt = typed(table("TDM", "DOC", &["ID", "PAYLOAD"], &["ID"]), "PAYLOAD", "XMLTYPE");
    let src = table("STG", "DOC", &["ID", "PAYLOAD"], &["ID"]);
    let sql = create_dml(&cols(&["ID", "PAYLOAD"]), &src, &tgt, &tgt.primary_key, "", DmlAction::Insert, &OracleDialect);
    assert_eq!(
        sql,
        "INSERT INTO \"TDM\".\"DOC\" (\"ID\", \"PAYLOAD\") VALUES (:\"ID\", xmltype.createxml(:\"PAYLOAD\"))"
    );
}

#[test]
fn postgres_insert_uses_positional_placeholders() {
    let tgt = table("TDM", "PARTNER", &["ID", "NAME"], &["ID"]);
    let src = table("STG", "PARTNER", &["ID", "NAME"], &["ID"]);
    let sql = create_dml(&cols(&["ID", "NAME"]), &src, &tgt, &tgt.primary_key, "", DmlAction::Insert, &PostgresDialect);
    assert_eq!(
        sql,
        "INSERT INTO \"TDM\".\"PARTNER\" (\"ID\", \"NAME\") VALUES ($1, $2)"
    );
}

#[test]
fn mask_action_builds_the_same_insert() {
    let tgt = table("TDM", "PARTNER", &["ID", "NAME"], &["ID"]);
    let src = table("STG", "PARTNER", &["ID", "NAME"], &["ID"]);
    let insert = create_dml(&cols(&["ID", "NAME"]), &src, &tgt, &tgt.primary_key, "", DmlAction::Insert, &PostgresDialect);
    let mask = create_dml(&cols(&["ID", "NAME"]), &src, &tgt, &tgt.primary_key, "", DmlAction::Mask, &PostgresDialect);
    assert_eq!(insert, mask);
}

#[test]
fn postgres_upsert_updates_non_key_attributes() {
    let tgt = table("TDM", "PARTNER", &["ID", "NAME", "CITY"], &["ID"]);
    let src = table("STG", "PARTNER", &["ID", "NAME", "CITY"], &["ID"]);
    let sql = create_dml(
        &cols(&["ID", "NAME", "CITY"]),
        &src,
        &tgt,
        &tgt.primary_key,
        "",
        DmlAction::Upsert,
        &PostgresDialect,
    );
    assert_eq!(
        sql,
        "INSERT INTO \"TDM\".\"PARTNER\" (\"ID\", \"NAME\", \"CITY\") VALUES ($1, $2, $3) \
         ON CONFLICT (\"ID\") DO UPDATE SET \"NAME\" = EXCLUDED.\"NAME\", \"CITY\" = EXCLUDED.\"CITY\""
    );
}

#[test]
fn hana_upsert_relies_on_the_primary_key() {
    let tgt = table("TDM", "PARTNER", &["ID", "NAME"], &["ID"]);
    let src = table("STG", "PARTNER", &["ID", "NAME"], &["ID"]);
    let sql = create_dml(&cols(&["ID", "NAME"]), &src, &tgt, &tgt.primary_key, "", DmlAction::UpsertMask, &HanaDialect);
    assert_eq!(
        sql,
        "UPSERT \"TDM\".\"PARTNER\" (\"ID\", \"NAME\") VALUES (:1, :2) WITH PRIMARY KEY"
    );
}

#[test]
fn oracle_upsert_is_a_single_row_merge() {
    let tgt = table("TDM", "PARTNER", &["ID", "NAME"], &["ID"]);
    let src = table("STG", "PARTNER", &["ID", "NAME"], &["ID"]);
    let sql = create_dml(&cols(&["ID", "NAME"]), &src, &tgt, &tgt.primary_key, "", DmlAction::Upsert, &OracleDialect);
    assert!(sql.starts_with("MERGE INTO \"TDM\".\"PARTNER\" tgt USING (SELECT :\"ID\" AS \"ID\", :\"NAME\" AS \"NAME\" FROM dual) src"));
    assert!(sql.contains("ON (src.\"ID\" = tgt.\"ID\")"));
    assert!(sql.contains("WHEN MATCHED THEN UPDATE SET tgt.\"NAME\" = src.\"NAME\""));
    assert!(sql.contains("WHEN NOT MATCHED THEN INSERT (\"ID\", \"NAME\") VALUES (src.\"ID\", src.\"NAME\")"));
}

#[test]
fn merge_reads_the_source_set_directly() {
    let src = table("STG", "PARTNER", &["ID", "NAME"], &["ID"]);
    let tgt = table("TDM", "PARTNER", &["ID", "NAME"], &["ID"]);
    let sql = create_dml(&[], &src, &tgt, &tgt.primary_key, "WHERE \"ID\" IS NOT NULL", DmlAction::Merge, &OracleDialect);
    assert!(sql.contains(
        "USING (SELECT \"ID\", \"NAME\" FROM \"STG\".\"PARTNER\" WHERE \"ID\" IS NOT NULL) src"
    ));
    assert!(!sql.contains(ERROR_FLAG_COLUMN));
}

#[test]
fn merge_joins_on_the_resolved_business_key() {
    let src = table("STG", "PARTNER", &["ID", "BK", "NAME"], &["ID"]);
    let tgt = table("TDM", "PARTNER", &["ID", "BK", "NAME"], &["ID"]);
    let key = cols(&["BK"]);
    let sql = create_dml(&[], &src, &tgt, &key, "", DmlAction::Merge, &OracleDialect);
    assert!(sql.contains("ON (src.\"BK\" = tgt.\"BK\")"));
    // the table primary key is an ordinary attribute here
    assert!(sql.contains("tgt.\"ID\" = src.\"ID\""));
    assert!(!sql.contains("tgt.\"BK\" = src.\"BK\""));
}

#[test]
fn merge_with_trailing_error_flag_column_injects_the_marker() {
    let src = table("STG", "PARTNER", &["ID", "NAME"], &["ID"]);
    let tgt = table("TDM", "PARTNER", &["ID", "NAME", "TA_FEHLER"], &["ID"]);
    let sql = create_dml(&[], &src, &tgt, &tgt.primary_key, "", DmlAction::Merge, &OracleDialect);
    assert!(sql.contains(&format!(
        "'{}' AS \"{}\"",
        INCOMPLETE_PK_MARKER, ERROR_FLAG_COLUMN
    )));
}

#[test]
fn union_builds_one_join_per_key_pair() {
    let src = table("STG", "VERTRAG", &["ID", "PARTNER_ID"], &["ID"]);
    let fil = table("TDM", "PARTNER_FILTER", &["P_ID"], &[]);
    let sql = create_union_stmt(
        &src,
        &fil,
        &cols(&["ID", "PARTNER_ID"]),
        &cols(&["P_ID", "P_ID"]),
        &PostgresDialect,
    );
    assert_eq!(sql.matches(" UNION ").count(), 1);
    assert_eq!(sql.matches("JOIN \"TDM\".\"PARTNER_FILTER\"").count(), 2);
    assert!(sql.contains(
        "ON \"STG\".\"VERTRAG\".\"PARTNER_ID\" = \"TDM\".\"PARTNER_FILTER\".\"P_ID\""
    ));
}

#[test]
fn validity_clauses_are_complements() {
    let keys = cols(&["ID", "MANDANT"]);
    assert_eq!(
        filter_invalid_clause(&keys, &PostgresDialect),
        "WHERE \"ID\" IS NOT NULL AND \"MANDANT\" IS NOT NULL"
    );
    assert_eq!(
        error_rows_clause(&keys, &PostgresDialect),
        "WHERE \"ID\" IS NULL OR \"MANDANT\" IS NULL"
    );
}

#[test]
fn join_filter_pairs_keys_positionally() {
    let src = table("STG", "VERTRAG", &["ID"], &["ID"]);
    let fil = table("TDM", "FILTER", &["F_ID"], &[]);
    let sql = join_filter_clause(&src, &fil, &cols(&["ID"]), &cols(&["F_ID"]), &PostgresDialect);
    assert_eq!(
        sql,
        "JOIN \"TDM\".\"FILTER\" ON \"STG\".\"VERTRAG\".\"ID\" = \"TDM\".\"FILTER\".\"F_ID\""
    );
}

#[test]
fn dedup_statements_use_the_engine_row_identifier() {
    let keys = cols(&["ID"]);
    let oracle = OracleDialect
        .dedup_statement("TDM", "PARTNER", DedupCriteria::Min, &keys)
        .unwrap();
    assert!(oracle.contains("WHERE rowid IN"));
    assert!(oracle.contains("SELECT MIN(rowid)"));
    assert!(oracle.contains("HAVING COUNT(*) > 1"));

    let pg = PostgresDialect
        .dedup_statement("TDM", "PARTNER", DedupCriteria::Max, &keys)
        .unwrap();
    assert!(pg.contains("WHERE ctid IN"));
    assert!(pg.contains("SELECT MAX(ctid)"));

    let hana = HanaDialect
        .dedup_statement("TDM", "PARTNER", DedupCriteria::Min, &keys)
        .unwrap();
    assert!(hana.contains("ROW_NUMBER() OVER (PARTITION BY \"ID\""));
    assert!(hana.contains("WHERE rn > 1"));
}

#[test]
fn dialect_lookup_covers_all_engines() {
    for db_type in [
        DatabaseType::Oracle,
        DatabaseType::Db2,
        DatabaseType::Hana,
        DatabaseType::Postgres,
        DatabaseType::Netezza,
    ] {
        assert_eq!(dialect_for(db_type).db_type(), db_type);
    }
}
