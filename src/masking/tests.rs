use super::cache::{AddressCache, HouseNumberCache, LookupCache, RuleCaches};
use super::rules;
use super::*;
use crate::db_types::ColumnMeta;
use crate::repository::{MaskRule, MaskRuleSet, RuleName};
use serde_json::{json, Value};

fn rule(attribute: &str, name: RuleName) -> MaskRule {
    MaskRule {
        application: "KVS".to_string(),
        table: "PARTNER".to_string(),
        attributes: vec![attribute.to_string()],
        rule_name: name,
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
    }
}

fn frame_of(column: &str, values: Vec<Value>) -> Frame {
    Frame::from_rows(
        vec![column.to_string()],
        values.into_iter().map(|v| vec![v]).collect(),
    )
    .unwrap()
}

fn column(frame: &Frame, name: &str) -> Vec<Value> {
    let ix = frame.require_column(name).unwrap();
    frame.rows().iter().map(|r| r[ix].clone()).collect()
}

fn word_cache(rows: Vec<(&str, &str)>) -> LookupCache {
    let rows = rows
        .into_iter()
        .map(|(orig, mask)| vec![json!(orig), json!(mask)])
        .collect();
    LookupCache::new(
        Frame::from_rows(vec!["WORT_ORIG".to_string(), "WORT_MASK".to_string()], rows).unwrap(),
    )
}

#[test]
fn constant_rule_spares_null_and_blank() {
    let r = rule("NACHNAME", RuleName::R16);
    let mut frame = frame_of(
        "NACHNAME",
        vec![json!("Müller"), Value::Null, json!(""), json!("Schmidt")],
    );
    rules::rule_constant(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "NACHNAME"),
        vec![json!("ANONYM"), Value::Null, json!(""), json!("ANONYM")]
    );
}

#[test]
fn r37_also_replaces_blank_strings() {
    let r = rule("KLAUSEL", RuleName::R37);
    let mut frame = frame_of("KLAUSEL", vec![json!(""), Value::Null, json!("geheim")]);
    rules::rule_r37(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "KLAUSEL"),
        vec![json!("ANONYM"), Value::Null, json!("ANONYM")]
    );
}

#[test]
fn phone_digits_are_swapped() {
    let r = rule("TELEFON", RuleName::R13);
    let mut frame = frame_of("TELEFON", vec![json!("0221-3678"), Value::Null]);
    rules::rule_r13(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "TELEFON"),
        vec![json!("0221-2559"), Value::Null]
    );
}

#[test]
fn surname_lookup_falls_back_to_default_and_truncates() {
    let mut r = rule("NACHNAME", RuleName::R01);
    r.lkp_cols = vec![Some("WORT_ORIG,WORT_MASK".to_string())];
    r.column_lengths = vec![Some(6)];
    let cache = word_cache(vec![("müller", "Beispielmann")]);
    let mut frame = frame_of(
        "NACHNAME",
        vec![json!("Müller"), json!("Unbekannt"), Value::Null],
    );
    rules::rule_r01(&r, &mut frame, &cache).unwrap();
    // hit is truncated to the column length, miss takes the default
    assert_eq!(
        column(&frame, "NACHNAME"),
        vec![json!("Beispi"), json!("ANONYM"), Value::Null]
    );
}

#[test]
fn first_char_lookup_does_not_truncate() {
    let mut r = rule("GEBURTSORT", RuleName::R04);
    r.lkp_cols = vec![Some("WORT_ORIG,WORT_MASK".to_string())];
    r.column_lengths = vec![Some(2)];
    let cache = word_cache(vec![("k", "Musterstadt")]);
    let mut frame = frame_of("GEBURTSORT", vec![json!("Köln")]);
    rules::rule_r04(&r, &mut frame, &cache).unwrap();
    assert_eq!(column(&frame, "GEBURTSORT"), vec![json!("Musterstadt")]);
}

#[test]
fn date_banding_on_temporal_values() {
    let mut r = rule("GEBDAT", RuleName::R03);
    r.default_value_1 = Some("01".to_string());
    r.default_value_2 = Some("15".to_string());
    r.format_string = Some("DATE".to_string());
    let mut frame = frame_of(
        "GEBDAT",
        vec![
            json!("2023-05-14"),
            json!("2023-05-20"),
            json!("9999-12-31"),
            Value::Null,
        ],
    );
    rules::rule_r03(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "GEBDAT"),
        vec![
            json!("2023-05-01"),
            json!("2023-05-15"),
            json!("9999-12-31"),
            Value::Null,
        ]
    );
}

#[test]
fn date_banding_on_character_dates() {
    let mut r = rule("GEBDAT", RuleName::R03);
    r.default_value_1 = Some("01".to_string());
    r.default_value_2 = Some("15".to_string());
    r.format_string = Some("YYYYMMDD".to_string());
    let mut frame = frame_of(
        "GEBDAT",
        vec![
            json!("20230514"),
            json!("20230520"),
            json!("99991231"),
            json!("00000000"),
        ],
    );
    rules::rule_r03(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "GEBDAT"),
        vec![
            json!("20230501"),
            json!("20230515"),
            json!("99991231"),
            json!("00000000"),
        ]
    );
}

#[test]
fn postbox_numbers_fold_into_the_synthetic_band() {
    let r = rule("POSTFACH", RuleName::R11);
    let mut frame = frame_of("POSTFACH", vec![json!("PF 1234"), json!("")]);
    rules::rule_r11(&r, &mut frame).unwrap();
    assert_eq!(column(&frame, "POSTFACH"), vec![json!(505014), json!("")]);
}

#[test]
fn social_insurance_number_gets_a_new_check_digit() {
    let mut r = rule("SVNR", RuleName::R17);
    r.default_value_1 = Some("01".to_string());
    r.default_value_2 = Some("15".to_string());
    r.default_value_3 = Some("X".to_string());
    let mut frame = frame_of("SVNR", vec![json!("12345678A012"), json!("too short")]);
    rules::rule_r17(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "SVNR"),
        vec![json!("12155678X019"), json!("too short")]
    );
}

#[test]
fn document_ids_depend_on_the_document_type() {
    let mut r = rule("DOK_ID", RuleName::R19);
    r.lkp_id = Some(31);
    let mut frame = frame_of("DOK_ID", vec![json!("GEHEIM-77")]);
    rules::rule_r19(&r, &mut frame).unwrap();
    assert_eq!(column(&frame, "DOK_ID"), vec![json!("1111111111")]);

    r.lkp_id = Some(99);
    let mut frame = frame_of("DOK_ID", vec![json!("GEHEIM-77")]);
    rules::rule_r19(&r, &mut frame).unwrap();
    assert_eq!(column(&frame, "DOK_ID"), vec![json!("ANONYM")]);
}

#[test]
fn number_plates_keep_letters_and_remap_digits() {
    let r = rule("KFZ_KZ", RuleName::R23);
    let mut frame = frame_of("KFZ_KZ", vec![json!("K-AB 123"), json!("ABC"), json!("123")]);
    rules::rule_r23(&r, &mut frame).unwrap();
    // (123 * 1117 + ord('K')) % 900 + 100
    assert_eq!(
        column(&frame, "KFZ_KZ"),
        vec![json!("K-AB 766"), json!("ABC"), json!("123")]
    );
}

#[test]
fn vehicle_identification_numbers_are_blanked_positionally() {
    let mut r = rule("FIN", RuleName::R24);
    r.default_value_1 = Some("X".to_string());
    let mut frame = frame_of("FIN", vec![json!("WAAUE31090E072401"), json!("AB")]);
    rules::rule_r24(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "FIN"),
        vec![json!("WXXUXX1XX0XX7XX0X"), json!("XX")]
    );
}

#[test]
fn illness_codes_fold_by_residue_class() {
    let r = rule("ERKRANKUNG", RuleName::R69);
    let mut frame = frame_of(
        "ERKRANKUNG",
        vec![json!(7), json!(9), json!(15000), json!(0), Value::Null],
    );
    rules::rule_r69(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "ERKRANKUNG"),
        vec![json!(15012), json!(15002), json!(15000), json!(0), Value::Null]
    );
}

#[test]
fn email_and_url_use_separate_word_classes() {
    let mut r = rule("EMAIL", RuleName::R14);
    r.lkp_cols = vec![Some("WORT_ORIG,WORT_MASK,WORT_ART".to_string())];
    let rows = vec![
        vec![json!("a"), json!("anon@mask.de"), json!(7)],
        vec![json!("a"), json!("www.mask.de"), json!(8)],
    ];
    let cache = LookupCache::new(
        Frame::from_rows(
            vec![
                "WORT_ORIG".to_string(),
                "WORT_MASK".to_string(),
                "WORT_ART".to_string(),
            ],
            rows,
        )
        .unwrap(),
    );
    let mut frame = frame_of("EMAIL", vec![json!("a@b.de"), json!("abc.de")]);
    rules::rule_r14(&r, &mut frame, &cache).unwrap();
    assert_eq!(
        column(&frame, "EMAIL"),
        vec![json!("anon@mask.de"), json!("www.mask.de")]
    );
}

#[test]
fn combined_names_are_split_and_masked_per_entity() {
    let mut r = rule("NAME", RuleName::R46);
    r.lkp_cols = vec![Some("ID,WORT_ORIG,WORT_MASK".to_string())];
    r.format_string = Some("NACHNAME,VORNAME| ".to_string());
    r.default_value_1 = Some("Muster,Max".to_string());
    let rows = vec![
        vec![json!(1), json!("müller"), json!("Meier"), json!(1)],
        vec![json!(2), json!("hans"), json!("Karl"), json!(5)],
    ];
    let cache = LookupCache::new(
        Frame::from_rows(
            vec![
                "ID".to_string(),
                "WORT_ORIG".to_string(),
                "WORT_MASK".to_string(),
                "WORT_ART".to_string(),
            ],
            rows,
        )
        .unwrap(),
    );
    let mut frame = frame_of("NAME", vec![json!("Müller Hans"), json!("Einwort")]);
    rules::rule_r46(&r, &mut frame, &cache).unwrap();
    // second value has no forename part, so the forename default fills in
    assert_eq!(
        column(&frame, "NAME"),
        vec![json!("Meier Karl"), json!("Muster Max")]
    );
}

#[test]
fn keep_first_word_appends_suffix() {
    let mut r = rule("INFO", RuleName::R56);
    r.default_value_1 = Some(" etc.".to_string());
    let mut frame = frame_of("INFO", vec![json!("Wichtige Anmerkung dazu")]);
    rules::rule_r56(&r, &mut frame).unwrap();
    assert_eq!(column(&frame, "INFO"), vec![json!("Wichtige etc.")]);
}

#[test]
fn referral_marker_clears_the_text() {
    let r = rule("TEXT", RuleName::R65);
    let mut frame = Frame::from_rows(
        vec!["TEXT".to_string(), "REFERRAL".to_string()],
        vec![
            vec![json!("vertraulich"), json!(" ")],
            vec![json!("bleibt"), json!("X")],
        ],
    )
    .unwrap();
    rules::rule_r65(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "TEXT"),
        vec![Value::Null, json!("bleibt")]
    );
}

#[test]
fn process_parameters_anonymize_the_name_list() {
    let mut r = rule("PARAMS", RuleName::R82);
    r.lkp_cols = vec![Some("PROZESS".to_string())];
    let mut frame = Frame::from_rows(
        vec!["PARAMS".to_string(), "PROZESS".to_string()],
        vec![
            vec![json!("a;b;Hans|Peter;rest"), json!("uv.ba.pr")],
            vec![json!("a;b;Hans|Peter;rest"), json!("other")],
        ],
    )
    .unwrap();
    rules::rule_r82(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "PARAMS"),
        vec![json!("a;b;Anonym|Anonym;rest"), json!("a;b;Hans|Peter;rest")]
    );
}

#[test]
fn high_dates_are_reformatted_or_defaulted() {
    let mut r = rule("ABLAUF", RuleName::R83);
    r.format_string = Some("%Y%m%d".to_string());
    r.default_value_1 = Some("20991231".to_string());
    let mut frame = frame_of(
        "ABLAUF",
        vec![json!("2023-05-17 00:00:00"), json!("garbage"), Value::Null],
    );
    rules::rule_r83(&r, &mut frame).unwrap();
    assert_eq!(
        column(&frame, "ABLAUF"),
        vec![json!("20230517"), json!("20991231"), json!("20991231")]
    );
}

fn address_rule() -> MaskRule {
    let mut r = rule("STR", RuleName::R12);
    r.attributes = vec![
        "STR".to_string(),
        "HNR".to_string(),
        "PLZ".to_string(),
        "ORT".to_string(),
    ];
    r.lkp_cols = vec![
        Some("STRASSE".to_string()),
        Some("HSN".to_string()),
        Some("PLZ".to_string()),
        Some("ORT".to_string()),
    ];
    r.column_lengths = vec![None; 4];
    r.default_value_1 = Some("Musterweg".to_string());
    r.default_value_2 = Some("1".to_string());
    r
}

fn address_caches() -> (AddressCache, HouseNumberCache) {
    let adr = LookupCache::new(
        Frame::from_rows(
            vec![
                "ADR_ID".to_string(),
                "ORG_ADR".to_string(),
                "MASK_STR".to_string(),
                "MASK_HSN".to_string(),
            ],
            vec![vec![
                json!(7),
                json!("hauptstraße12345köln"),
                json!("Ersatzweg"),
                json!("3"),
            ]],
        )
        .unwrap(),
    );
    let hsn = LookupCache::new(
        Frame::from_rows(
            vec![
                "ADR_ID".to_string(),
                "ORG_ADR".to_string(),
                "ORG_HSN".to_string(),
                "MASK_STR".to_string(),
                "MASK_HSN".to_string(),
            ],
            vec![vec![
                json!(7),
                json!("hauptstraße12345köln"),
                json!("5"),
                json!("Ersatzweg"),
                json!("9"),
            ]],
        )
        .unwrap(),
    );
    (
        AddressCache::from_frame(&adr).unwrap(),
        HouseNumberCache::from_frame(&hsn).unwrap(),
    )
}

fn address_frame(rows: Vec<Vec<Value>>) -> Frame {
    Frame::from_rows(
        vec![
            "STR".to_string(),
            "HNR".to_string(),
            "PLZ".to_string(),
            "ORT".to_string(),
        ],
        rows,
    )
    .unwrap()
}

#[test]
fn addresses_resolve_through_the_two_level_cache() {
    let r = address_rule();
    let (adr, hsn) = address_caches();
    let mut frame = address_frame(vec![
        vec![json!("Hauptstraße"), json!("5"), json!("12345"), json!("Köln")],
        vec![json!("Unbekannt"), json!("2"), json!("99999"), json!("Nirgendwo")],
        vec![json!("Hauptstraße"), json!("5"), Value::Null, json!("Köln")],
    ]);
    let dropped = rules::rule_r12(&r, &mut frame, &adr, &hsn, &[], DuplicatePolicy::DropKeepFirst)
        .unwrap();
    assert_eq!(dropped, 0);
    // exact house number match, cache miss with defaults, missing zip
    assert_eq!(
        column(&frame, "STR"),
        vec![json!("Ersatzweg"), json!("Musterweg"), json!("Musterweg")]
    );
    assert_eq!(
        column(&frame, "HNR"),
        vec![json!("9"), json!("1"), json!("1")]
    );
}

#[test]
fn address_house_number_falls_back_to_street_level() {
    let r = address_rule();
    let (adr, hsn) = address_caches();
    let mut frame = address_frame(vec![vec![
        json!("Hauptstraße"),
        json!("77"),
        json!("12345"),
        json!("Köln"),
    ]]);
    rules::rule_r12(&r, &mut frame, &adr, &hsn, &[], DuplicatePolicy::DropKeepFirst).unwrap();
    assert_eq!(column(&frame, "STR"), vec![json!("Ersatzweg")]);
    assert_eq!(column(&frame, "HNR"), vec![json!("3")]);
}

#[test]
fn social_insurance_replacement_is_written_verbatim() {
    let mut r = rule("SVNR", RuleName::R17);
    r.default_value_1 = Some("01".to_string());
    r.default_value_2 = Some("15".to_string());
    r.default_value_3 = Some("x".to_string());
    let mut frame = frame_of("SVNR", vec![json!("12345678A012")]);
    rules::rule_r17(&r, &mut frame).unwrap();
    // the configured value lands in the number unchanged, casing included
    assert_eq!(column(&frame, "SVNR"), vec![json!("12155678x019")]);
}

#[test]
fn address_duplicate_keys_must_exist_in_the_block() {
    let r = address_rule();
    let (adr, hsn) = address_caches();
    let mut frame = address_frame(vec![vec![
        json!("Hauptstraße"),
        json!("5"),
        json!("12345"),
        json!("Köln"),
    ]]);
    let result = rules::rule_r12(
        &r,
        &mut frame,
        &adr,
        &hsn,
        &["PARTNER_ID".to_string()],
        DuplicatePolicy::DropKeepFirst,
    );
    assert!(result.is_err());
}

#[test]
fn duplicate_policy_controls_address_collisions() {
    let r = address_rule();
    let (adr, hsn) = address_caches();
    let rows = vec![
        vec![json!("Hauptstraße"), json!("5"), json!("12345"), json!("Köln")],
        vec![json!("Hauptstraße"), json!("5"), json!("12345"), json!("Köln")],
    ];
    let mut frame = address_frame(rows.clone());
    let dropped = rules::rule_r12(&r, &mut frame, &adr, &hsn, &[], DuplicatePolicy::DropKeepFirst)
        .unwrap();
    assert_eq!(dropped, 1);
    assert_eq!(frame.len(), 1);

    let mut frame = address_frame(rows);
    let result = rules::rule_r12(&r, &mut frame, &adr, &hsn, &[], DuplicatePolicy::Fail);
    assert!(result.is_err());
}

fn handle(columns: &[&str]) -> crate::table::TableHandle {
    crate::table::TableHandle {
        dsn: String::new(),
        schema: "TDM".to_string(),
        name: "PARTNER".to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        primary_key: vec!["ID".to_string()],
        column_types: Default::default(),
    }
}

#[test]
fn mask_frame_keeps_the_row_count_and_reorders_to_target() {
    let source = handle(&["ID", "NACHNAME"]);
    let target = handle(&["NACHNAME", "ID"]);
    let rules = MaskRuleSet::from_rows(vec![rule("NACHNAME", RuleName::R16)]);
    let caches = RuleCaches::default();
    let frame = Frame::from_rows(
        vec!["ID".to_string(), "NACHNAME".to_string()],
        vec![
            vec![json!(1), json!("Müller")],
            vec![json!(2), Value::Null],
        ],
    )
    .unwrap();
    let masked = mask_frame(
        frame,
        &rules,
        &source,
        &target,
        &caches,
        DuplicatePolicy::DropKeepFirst,
    )
    .unwrap();
    assert_eq!(masked.len(), 2);
    assert_eq!(masked.columns(), ["NACHNAME".to_string(), "ID".to_string()]);
    assert_eq!(
        column(&masked, "NACHNAME"),
        vec![json!("ANONYM"), Value::Null]
    );
    // reconciliation is stable when reapplied
    let again = masked.select_columns(&target.columns).unwrap();
    assert_eq!(again, masked);
}

#[test]
fn mask_frame_requires_a_cache_for_lookup_rules() {
    let source = handle(&["NACHNAME"]);
    let target = handle(&["NACHNAME"]);
    let mut r = rule("NACHNAME", RuleName::R01);
    r.lkp_cols = vec![Some("WORT_ORIG,WORT_MASK".to_string())];
    let rules = MaskRuleSet::from_rows(vec![r]);
    let frame = frame_of("NACHNAME", vec![json!("Müller")]);
    let result = mask_frame(
        frame,
        &rules,
        &source,
        &target,
        &RuleCaches::default(),
        DuplicatePolicy::DropKeepFirst,
    );
    assert!(result.is_err());
}

#[test]
fn column_lengths_resolve_from_target_metadata() {
    let mut target = handle(&["NACHNAME"]);
    target.column_types.insert(
        "NACHNAME".to_string(),
        ColumnMeta {
            data_type: "VARCHAR2".to_string(),
            precision: None,
            scale: None,
            length: Some(30),
            is_nullable: true,
        },
    );
    let mut rules = MaskRuleSet::from_rows(vec![rule("NACHNAME", RuleName::R01)]);
    resolve_column_lengths(&mut rules, &target);
    assert_eq!(
        rules.iter().next().unwrap().column_lengths,
        vec![Some(30)]
    );
}
