use super::*;

#[test]
fn test_database_type_round_trip() {
    for value in ["ORACLE", "DB2", "HANA", "POSTGRES", "NETEZZA"] {
        let db_type = DatabaseType::from_db(value).unwrap();
        assert_eq!(db_type.as_str(), value);
    }
    assert!(DatabaseType::from_db("MYSQL").is_err());
    assert!(DatabaseType::from_db("").is_err());
}

#[test]
fn test_database_type_is_case_insensitive() {
    assert_eq!(
        DatabaseType::from_db(" postgres ").unwrap(),
        DatabaseType::Postgres
    );
}

#[test]
fn test_lob_detection() {
    let xml = ColumnMeta {
        data_type: "XMLTYPE".to_string(),
        ..Default::default()
    };
    assert!(xml.is_lob());

    let varchar = ColumnMeta {
        data_type: "VARCHAR2".to_string(),
        length: Some(200),
        ..Default::default()
    };
    assert!(!varchar.is_lob());
}
