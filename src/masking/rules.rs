// =====================================================
// MASKING RULE TRANSFORMS
// One function per rule, operating in place on a block.
// Blank cells (NULL or whitespace-only) pass through
// unchanged unless a rule states otherwise.
// =====================================================

use crate::frame::{cell_i64, cell_string, is_blank, Frame};
use crate::masking::cache::{canonical_key, AddressCache, HouseNumberCache, LookupCache};
use crate::masking::DuplicatePolicy;
use crate::repository::MaskRule;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Character-safe prefix, lowercased with trailing blanks removed. This is
/// the lookup key shape shared by the word-replacement rules.
fn prefix_key(value: &str, len: usize) -> String {
    let prefix: String = value.chars().take(len).collect();
    prefix.to_lowercase().trim_end().to_string()
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn column_length(rule: &MaskRule) -> Option<usize> {
    rule.column_lengths
        .first()
        .copied()
        .flatten()
        .map(|l| l.max(0) as usize)
}

fn default_1(rule: &MaskRule) -> String {
    rule.default_value_1.clone().unwrap_or_default()
}

fn required_value<'a>(value: &'a Option<String>, what: &str, rule: &MaskRule) -> Result<&'a str, String> {
    value
        .as_deref()
        .ok_or_else(|| format!("Rule {} is missing {}", rule.rule_name.as_str(), what))
}

/// Numeric-looking replacement text keeps its numeric type in the block.
fn text_or_number(value: String) -> Value {
    match value.trim().parse::<i64>() {
        Ok(n) if value.trim() == n.to_string() => Value::from(n),
        _ => Value::String(value),
    }
}

fn lookup_columns(rule: &MaskRule, expected: usize) -> Result<Vec<String>, String> {
    let cols: Vec<String> = rule
        .lkp_col_list()
        .iter()
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cols.len() < expected {
        return Err(format!(
            "Rule {} expects {} lookup columns, found {}",
            rule.rule_name.as_str(),
            expected,
            cols.len()
        ));
    }
    Ok(cols)
}

/// Shared body of the word-replacement rules: key on a lowercased prefix of
/// the original value, look it up, fall back to the first default value.
fn lookup_replace(
    rule: &MaskRule,
    frame: &mut Frame,
    map: &HashMap<String, String>,
    prefix_len: usize,
    truncate: bool,
) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    let default = default_1(rule);
    let max_len = column_length(rule);
    if truncate {
        log::info!(
            "Truncating attribute {} to length {:?}",
            rule.primary_attribute(),
            max_len
        );
    }
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let original = cell_string(&row[col]);
        let key = prefix_key(&original, prefix_len);
        let mut masked = map.get(&key).cloned().unwrap_or_else(|| default.clone());
        if truncate {
            if let Some(max) = max_len {
                masked = truncate_chars(&masked, max);
            }
        }
        row[col] = Value::String(masked);
    }
    Ok(())
}

/// Non-blank values become the configured constant. R37 additionally
/// replaces blank-but-present values, so the blank handling is a parameter.
fn constant_replace(rule: &MaskRule, frame: &mut Frame, value: &str, include_blank: bool) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    for row in frame.rows_mut() {
        let hit = if include_blank {
            !row[col].is_null()
        } else {
            !is_blank(&row[col])
        };
        if hit {
            row[col] = Value::String(value.to_string());
        }
    }
    Ok(())
}

// --- Word replacement against a lookup table ---

/// R01: surname, keyed on a 10-character prefix, truncated to the column length.
pub(super) fn rule_r01(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    let cols = lookup_columns(rule, 2)?;
    let map = cache.map(&cols[0], &cols[1])?;
    lookup_replace(rule, frame, &map, 10, true)
}

/// R02: forename, same mechanics as R01.
pub(super) fn rule_r02(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    rule_r01(rule, frame, cache)
}

/// R04: birthplace, keyed on the first character.
pub(super) fn rule_r04(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    let cols = lookup_columns(rule, 2)?;
    let map = cache.map(&cols[0], &cols[1])?;
    lookup_replace(rule, frame, &map, 1, false)
}

/// R05: birth name, keyed on the first character.
pub(super) fn rule_r05(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    rule_r04(rule, frame, cache)
}

/// R06: institution name, keyed on a 10-character prefix.
pub(super) fn rule_r06(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    let cols = lookup_columns(rule, 2)?;
    let map = cache.map(&cols[0], &cols[1])?;
    lookup_replace(rule, frame, &map, 10, false)
}

/// R10: care-of name, keyed on the first character.
pub(super) fn rule_r10(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    rule_r04(rule, frame, cache)
}

// --- Dates ---

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// R03: date banding. Days before the threshold collapse to the first
/// replacement day, the rest to the threshold day. Year 9999 is a
/// technical high date and stays untouched, as does the literal "00000000".
pub(super) fn rule_r03(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    let dv1 = required_value(&rule.default_value_1, "replacement day 1", rule)?.to_string();
    let dv2 = required_value(&rule.default_value_2, "replacement day 2", rule)?.to_string();
    let format = rule.format_string.as_deref();

    if format == Some("DATE") {
        let d1: u32 = dv1
            .trim()
            .parse()
            .map_err(|_| format!("Rule R03: replacement day {} is not numeric", dv1))?;
        let d2: u32 = dv2
            .trim()
            .parse()
            .map_err(|_| format!("Rule R03: replacement day {} is not numeric", dv2))?;
        for row in frame.rows_mut() {
            if is_blank(&row[col]) {
                continue;
            }
            let text = cell_string(&row[col]);
            if text == "00000000" {
                continue;
            }
            let ts = match parse_datetime(&text) {
                Some(ts) => ts,
                None => continue,
            };
            if ts.year() == 9999 {
                continue;
            }
            let day = if ts.day() < d2 { d1 } else { d2 };
            if let Some(banded) = ts.with_day(day) {
                let rendered = if text.len() <= 10 {
                    banded.format("%Y-%m-%d").to_string()
                } else {
                    banded.format("%Y-%m-%d %H:%M:%S").to_string()
                };
                row[col] = Value::String(rendered);
            }
        }
        return Ok(());
    }

    // Character dates: the format string locates the day and year digits.
    let fmt = format.ok_or_else(|| "Rule R03 requires a format string".to_string())?;
    let pos_day = fmt
        .find("DD")
        .ok_or_else(|| format!("Rule R03: format {} has no day component", fmt))?;
    let len_day = fmt.matches('D').count();
    let pos_year = fmt
        .find("YY")
        .ok_or_else(|| format!("Rule R03: format {} has no year component", fmt))?;
    let len_year = fmt.matches('Y').count();
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let text = cell_string(&row[col]);
        if text == "00000000" || !text.is_ascii() || text.len() < pos_day + len_day {
            continue;
        }
        let day = &text[pos_day..pos_day + len_day];
        let year = if text.len() >= pos_year + len_year {
            &text[pos_year..pos_year + len_year]
        } else {
            ""
        };
        if year == "9999" {
            continue;
        }
        let replacement = if day < dv2.as_str() { &dv1 } else { &dv2 };
        let mut banded = String::with_capacity(text.len());
        banded.push_str(&text[..pos_day]);
        banded.push_str(replacement);
        banded.push_str(&text[pos_day + len_day..]);
        row[col] = Value::String(banded);
    }
    Ok(())
}

/// R83: high dates. Every parseable value is reformatted with the configured
/// strftime pattern, everything else becomes the default.
pub(super) fn rule_r83(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    use chrono::format::{Item, StrftimeItems};

    let col = frame.require_column(rule.primary_attribute())?;
    let fmt = required_value(&rule.format_string, "a format string", rule)?.to_string();
    if StrftimeItems::new(&fmt).any(|item| matches!(item, Item::Error)) {
        return Err(format!("Rule R83: invalid format string {}", fmt));
    }
    let default = default_1(rule);
    for row in frame.rows_mut() {
        let rendered = parse_datetime(&cell_string(&row[col]))
            .map(|ts| ts.format(&fmt).to_string())
            .unwrap_or_else(|| default.clone());
        row[col] = Value::String(rendered);
    }
    Ok(())
}

// --- Numbers and identifiers ---

/// R11: post-office box numbers are folded into a small synthetic band.
pub(super) fn rule_r11(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let digits: String = cell_string(&row[col])
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        let number: i64 = match digits.parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        row[col] = Value::from(number % 20 + 505000);
    }
    Ok(())
}

/// R13: phone and fax numbers, fixed digit substitution.
pub(super) fn rule_r13(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    for row in frame.rows_mut() {
        if row[col].is_null() || cell_string(&row[col]).is_empty() {
            continue;
        }
        let masked: String = cell_string(&row[col])
            .chars()
            .map(|c| match c {
                '3' => '2',
                '6' => '5',
                '7' => '5',
                '8' => '9',
                other => other,
            })
            .collect();
        row[col] = Value::String(masked);
    }
    Ok(())
}

/// R17: social insurance numbers. The birth day is banded, the birth-name
/// initial replaced, and the check digit recomputed over the configured
/// weights.
pub(super) fn rule_r17(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    const WEIGHTS: [u32; 12] = [2, 1, 2, 5, 7, 1, 2, 1, 2, 1, 2, 1];

    let col = frame.require_column(rule.primary_attribute())?;
    let dv1 = required_value(&rule.default_value_1, "replacement day 1", rule)?.to_string();
    let dv2 = required_value(&rule.default_value_2, "replacement day 2", rule)?.to_string();
    let initial = required_value(&rule.default_value_3, "a replacement initial", rule)?.to_string();
    let initial_char = initial
        .chars()
        .next()
        .ok_or_else(|| "Rule R17: replacement initial is empty".to_string())?
        .to_ascii_uppercase();
    if !initial_char.is_ascii_alphabetic() {
        return Err(format!("Rule R17: replacement initial {} is not a letter", initial));
    }
    // 1-based position of the initial in the alphabet
    let initial_pos = (initial_char as u32 - 'A' as u32 + 1).to_string();

    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let text = cell_string(&row[col]);
        if !text.is_ascii() || text.trim().len() != 12 {
            continue;
        }
        let area = &text[0..2];
        let day = &text[2..4];
        let month_year = &text[4..8];
        let serial = &text[9..11];
        let banded_day = if day < dv2.as_str() { dv1.as_str() } else { dv2.as_str() };
        let check_input = format!("{}{}{}{}{}", area, banded_day, month_year, initial_pos, serial);
        if !check_input.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        // Digit-sum of weighted digits, modulo 10.
        let mut total = 0u32;
        for (c, weight) in check_input.chars().zip(WEIGHTS.iter()) {
            let product = c.to_digit(10).unwrap_or(0) * weight;
            total += product / 10 + product % 10;
        }
        // The configured replacement is written into the number as-is; only
        // the check digit uses its alphabet position.
        let masked = format!(
            "{}{}{}{}",
            &check_input[..8],
            initial,
            serial,
            total % 10
        );
        row[col] = Value::String(masked);
    }
    Ok(())
}

/// R19: document identifiers, replaced per document type.
pub(super) fn rule_r19(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let value = match rule.lkp_id {
        Some(26) => "53220257B045".to_string(),
        Some(31) => "1111111111".to_string(),
        Some(32) => "92435680114".to_string(),
        _ => default_1(rule),
    };
    constant_replace(rule, frame, &value, false)
}

/// R23: number plates. The digit block is remapped inside its magnitude
/// band, letters stay. Plates without digits or without letters pass
/// through untouched.
pub(super) fn rule_r23(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    let digits = Regex::new(r"\d+").map_err(|e| format!("Rule R23: {}", e))?;
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let text = cell_string(&row[col]);
        if !text.chars().any(|c| c.is_ascii_alphabetic()) {
            continue;
        }
        let number_text = match digits.find(&text) {
            Some(m) => m.as_str().to_string(),
            None => continue,
        };
        let number: i64 = match number_text.parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let letters = text.replacen(&number_text, "", 1);
        let ordinal = match letters.chars().next() {
            Some(c) => c as i64,
            None => continue,
        };
        let masked_number = if (1..100).contains(&number) {
            (number * 137 + ordinal) % 99 + 1
        } else if (100..1000).contains(&number) {
            (number * 1117 + ordinal) % 900 + 100
        } else if (1000..10000).contains(&number) {
            (number * 3367 + ordinal) % 9000 + 1000
        } else {
            0
        };
        row[col] = Value::String(format!("{}{}", letters, masked_number));
    }
    Ok(())
}

/// R24: vehicle identification numbers, blanked at fixed positions. Values
/// shorter than three characters collapse to "XX".
pub(super) fn rule_r24(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    const MASK_POSITIONS: [usize; 11] = [1, 2, 4, 5, 7, 8, 10, 11, 13, 14, 16];

    let col = frame.require_column(rule.primary_attribute())?;
    let replacement = default_1(rule).chars().next().unwrap_or('X');
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let text = cell_string(&row[col]);
        if text.chars().count() < 3 {
            row[col] = Value::String("XX".to_string());
            continue;
        }
        let masked: String = text
            .chars()
            .enumerate()
            .map(|(ix, c)| {
                if MASK_POSITIONS.contains(&ix) {
                    replacement
                } else {
                    c
                }
            })
            .collect();
        row[col] = Value::String(masked);
    }
    Ok(())
}

/// R36: risk estimates, replaced through a numeric lookup join.
pub(super) fn rule_r36(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    let cols = lookup_columns(rule, 2)?;
    let map = cache.numeric_map(&cols[0], &cols[1])?;
    let key_ix = frame.require_column(&cols[0])?;
    let col = frame.require_column(rule.primary_attribute())?;
    let default = default_1(rule);
    for row in frame.rows_mut() {
        if row[col].is_null() {
            continue;
        }
        let masked = map
            .get(&canonical_key(&row[key_ix]))
            .cloned()
            .unwrap_or_else(|| default.clone());
        row[col] = text_or_number(masked);
    }
    Ok(())
}

/// R69: illness codes, folded onto three fixed codes by residue class.
/// The technical values 0, -9999 and 15000 stay untouched.
pub(super) fn rule_r69(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    for row in frame.rows_mut() {
        let number = match cell_i64(&row[col]) {
            Some(n) => n,
            None => continue,
        };
        if number == 0 || number == -9999 || number == 15000 {
            continue;
        }
        let masked = match number.rem_euclid(3) {
            0 => 15002,
            1 => 15012,
            _ => 15017,
        };
        row[col] = Value::from(masked);
    }
    Ok(())
}

// --- Free text and composites ---

/// R14: e-mail addresses and URLs. Both share the attribute; the lookup is
/// filtered by word class (7 for mail, 8 for web) and keyed on the first
/// character.
pub(super) fn rule_r14(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    let cols = lookup_columns(rule, 3)?;
    let mail_map = cache.map_for_classes(&cols[0], &cols[1], &cols[2], &[7])?;
    let url_map = cache.map_for_classes(&cols[0], &cols[1], &cols[2], &[8])?;
    let col = frame.require_column(rule.primary_attribute())?;
    let default = default_1(rule);
    let max_len = column_length(rule);
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let original = cell_string(&row[col]);
        let map = if original.contains('@') { &mail_map } else { &url_map };
        let key = prefix_key(&original, 1);
        let mut masked = map.get(&key).cloned().unwrap_or_else(|| default.clone());
        if let Some(max) = max_len {
            masked = truncate_chars(&masked, max);
        }
        row[col] = Value::String(masked);
    }
    Ok(())
}

/// R46: combined "surname, forename" fields. The value is split into its
/// entities, each masked against its word class (surnames 1 and 3, where 1
/// wins for duplicate keys; forenames 5), and reassembled.
pub(super) fn rule_r46(rule: &MaskRule, frame: &mut Frame, cache: &LookupCache) -> Result<(), String> {
    let cols = lookup_columns(rule, 3)?;
    let fmt = rule.format_string.as_deref();
    let (entities, delimiter) = match fmt.and_then(|f| f.split_once('|')) {
        Some((names, delim)) => (
            names.split(',').map(str::trim).collect::<Vec<_>>(),
            delim.to_string(),
        ),
        None => (Vec::new(), " ".to_string()),
    };
    if entities.len() != 2 {
        return Err("Rule R46 requires a two-entity format string".to_string());
    }
    let defaults: Vec<&str> = rule
        .default_value_1
        .as_deref()
        .map(|d| d.split(',').collect())
        .unwrap_or_default();
    if defaults.len() != entities.len() {
        return Err("Rule R46 requires one default per entity".to_string());
    }
    let mut maps = Vec::with_capacity(entities.len());
    for entity in &entities {
        let map = match *entity {
            "NACHNAME" => cache.map_for_classes(&cols[1], &cols[2], "WORT_ART", &[1, 3])?,
            "VORNAME" => cache.map_for_classes(&cols[1], &cols[2], "WORT_ART", &[5])?,
            other => return Err(format!("Rule R46: entity {} is not supported", other)),
        };
        maps.push(map);
    }

    let col = frame.require_column(rule.primary_attribute())?;
    let whole_default = default_1(rule);
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let mut text = cell_string(&row[col]);
        if text.contains(',') {
            text = text.replace(',', " ");
        }
        let (first, second) = match text.split_once(delimiter.as_str()) {
            Some((a, b)) => (a.to_string(), Some(b.to_string())),
            None => (text.clone(), None),
        };
        let mut parts = Vec::with_capacity(2);
        for (ix, part) in [Some(first), second].into_iter().enumerate() {
            let masked = match part {
                Some(p) => maps[ix]
                    .get(&prefix_key(&p, 10))
                    .cloned()
                    .unwrap_or_else(|| defaults[ix].to_string()),
                None => defaults[ix].to_string(),
            };
            parts.push(masked);
        }
        let mut masked = parts.join(&delimiter);
        if masked.trim().is_empty() {
            masked = whole_default.clone();
        }
        row[col] = Value::String(masked);
    }
    Ok(())
}

/// R56: keep the first word, append the configured suffix.
pub(super) fn rule_r56(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    let default = default_1(rule);
    for row in frame.rows_mut() {
        if is_blank(&row[col]) {
            continue;
        }
        let text = cell_string(&row[col]);
        let first = text.split(' ').next().unwrap_or_default();
        row[col] = Value::String(format!("{}{}", first, default));
    }
    Ok(())
}

/// R65: clears the attribute when the referral marker is a single blank.
pub(super) fn rule_r65(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let col = frame.require_column(rule.primary_attribute())?;
    let referral = frame.require_column("REFERRAL")?;
    for row in frame.rows_mut() {
        if row[referral] == Value::String(" ".to_string()) {
            row[col] = Value::Null;
        }
    }
    Ok(())
}

/// R82: process parameters. The third semicolon field carries a pipe-joined
/// name list; each name becomes "Anonym". Only the known parameter kinds are
/// touched.
pub(super) fn rule_r82(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    const PARAMETER_KINDS: [&str; 3] = ["uv.ba.pr", "uv.ja.pr", "uv.jas.pr"];

    let col = frame.require_column(rule.primary_attribute())?;
    let kind_col_name = rule
        .lkp_cols
        .first()
        .and_then(|c| c.clone())
        .ok_or_else(|| "Rule R82 requires a parameter-kind column".to_string())?;
    let kind_col = frame.require_column(&kind_col_name)?;
    for row in frame.rows_mut() {
        let kind = cell_string(&row[kind_col]);
        if !PARAMETER_KINDS.contains(&kind.as_str()) {
            continue;
        }
        let text = cell_string(&row[col]);
        let parts: Vec<&str> = text.split(';').collect();
        if parts.len() < 3 {
            continue;
        }
        let name_count = if parts[2].is_empty() {
            0
        } else {
            parts[2].split('|').count()
        };
        let masked_names = vec!["Anonym"; name_count].join("|");
        let left = parts[..2].join(";");
        let right = parts[3..].join(";");
        row[col] = Value::String(format!("{};{};{}", left, masked_names, right));
    }
    Ok(())
}

/// R12: addresses. Street, house number, zip and city are resolved against
/// the two-level address cache; the house-number level wins when present.
/// Returns the number of rows dropped by duplicate handling.
pub(super) fn rule_r12(
    rule: &MaskRule,
    frame: &mut Frame,
    adr: &AddressCache,
    hsn: &HouseNumberCache,
    primary_key: &[String],
    policy: DuplicatePolicy,
) -> Result<usize, String> {
    // Role names from the lookup columns map onto the rule's attributes.
    let roles: HashMap<&str, &str> = rule
        .lkp_cols
        .iter()
        .zip(rule.attributes.iter())
        .filter_map(|(role, attr)| role.as_deref().map(|r| (r, attr.as_str())))
        .collect();
    let street_col = frame.require_column(
        roles
            .get("STRASSE")
            .ok_or_else(|| "Rule R12 requires a STRASSE attribute".to_string())?,
    )?;
    let plz_col = frame.require_column(
        roles
            .get("PLZ")
            .ok_or_else(|| "Rule R12 requires a PLZ attribute".to_string())?,
    )?;
    let ort_col = frame.require_column(
        roles
            .get("ORT")
            .ok_or_else(|| "Rule R12 requires an ORT attribute".to_string())?,
    )?;
    let hsn_col = match roles.get("HSN") {
        Some(attr) => Some(frame.require_column(attr)?),
        None => None,
    };
    let default_street = required_value(&rule.default_value_1, "a street default", rule)?.to_string();
    let default_hsn = required_value(&rule.default_value_2, "a house number default", rule)?.to_string();
    let delimiter = rule
        .format_string
        .as_deref()
        .and_then(|f| f.split_once('|'))
        .map(|(_, d)| d.to_string());
    if hsn_col.is_none() && delimiter.is_none() {
        log::error!("No house number attribute and no format instruction configured!");
        return Err("Rule R12 needs either a house number attribute or a split format".to_string());
    }

    let mut resolved_keys: Vec<Option<String>> = Vec::with_capacity(frame.len());
    for row in frame.rows_mut() {
        if is_blank(&row[street_col]) {
            resolved_keys.push(None);
            continue;
        }
        // Missing zip or city: nothing to resolve, take the defaults.
        if row[plz_col].is_null() || row[ort_col].is_null() {
            match hsn_col {
                Some(hsn_ix) => {
                    row[street_col] = Value::String(default_street.clone());
                    row[hsn_ix] = Value::String(default_hsn.clone());
                }
                None => {
                    let delim = delimiter.as_deref().unwrap_or(" ");
                    row[street_col] =
                        Value::String(format!("{}{}{}", default_street, delim, default_hsn));
                }
            }
            resolved_keys.push(None);
            continue;
        }

        let raw_street = cell_string(&row[street_col]);
        let (street_part, hsn_part) = match hsn_col {
            Some(hsn_ix) => (raw_street.clone(), cell_string(&row[hsn_ix])),
            None => {
                let delim = delimiter.as_deref().unwrap_or(" ");
                match raw_street.split_once(delim) {
                    Some((s, h)) => (s.to_string(), h.to_string()),
                    None => (raw_street.clone(), String::new()),
                }
            }
        };
        let key = format!(
            "{}{}{}",
            street_part.trim().to_lowercase(),
            cell_string(&row[plz_col]).trim(),
            cell_string(&row[ort_col]).trim().to_lowercase()
        );

        let (masked_street, masked_hsn, resolved) = match adr.get(&key) {
            None => (default_street.clone(), default_hsn.clone(), false),
            Some(entry) if entry.adr_id < 0 => {
                (entry.mask_street.clone(), entry.mask_hsn.clone(), false)
            }
            Some(entry) => match hsn.get(&key, entry.adr_id, hsn_part.trim_end()) {
                Some(exact) => (exact.mask_street.clone(), exact.mask_hsn.clone(), true),
                None => (entry.mask_street.clone(), entry.mask_hsn.clone(), true),
            },
        };
        match hsn_col {
            Some(hsn_ix) => {
                row[street_col] = Value::String(masked_street);
                row[hsn_ix] = Value::String(masked_hsn);
            }
            None => {
                let delim = delimiter.as_deref().unwrap_or(" ");
                row[street_col] =
                    Value::String(format!("{}{} {}", masked_street, delim, masked_hsn));
            }
        }
        resolved_keys.push(if resolved { Some(key) } else { None });
    }

    // Duplicate handling over the rows that went through the house-number
    // path, keyed by the source primary key.
    let dropped = drop_duplicates(frame, &resolved_keys, primary_key, policy)?;

    // Optional short form of the street, uppercased and length-limited.
    if let Some(kurz_attr) = roles.get("STRASSE_KURZ") {
        log::info!("Masking additional attribute {}", kurz_attr);
        let kurz_ix = frame.require_column(kurz_attr)?;
        let max_len = rule
            .lkp_cols
            .iter()
            .position(|c| c.as_deref() == Some("STRASSE_KURZ"))
            .and_then(|ix| rule.column_lengths.get(ix).copied().flatten())
            .map(|l| l.max(0) as usize);
        for row in frame.rows_mut() {
            if row[street_col].is_null() {
                continue;
            }
            let mut short = cell_string(&row[street_col]).to_uppercase();
            if let Some(max) = max_len {
                short = truncate_chars(&short, max);
            }
            row[kurz_ix] = Value::String(short);
        }
    }
    Ok(dropped)
}

fn drop_duplicates(
    frame: &mut Frame,
    resolved: &[Option<String>],
    primary_key: &[String],
    policy: DuplicatePolicy,
) -> Result<usize, String> {
    let key_indices = primary_key
        .iter()
        .map(|k| frame.require_column(k))
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = HashSet::new();
    let mut drop = Vec::new();
    for (ix, row) in frame.rows().iter().enumerate() {
        if resolved[ix].is_none() {
            continue;
        }
        let key = if key_indices.is_empty() {
            serde_json::to_string(row).unwrap_or_default()
        } else {
            let values: Vec<&Value> = key_indices.iter().map(|&i| &row[i]).collect();
            serde_json::to_string(&values).unwrap_or_default()
        };
        if !seen.insert(key) {
            drop.push(ix);
        }
    }
    if drop.is_empty() {
        return Ok(0);
    }
    match policy {
        DuplicatePolicy::Fail => Err(format!(
            "Duplicate primary keys on {} masked address rows",
            drop.len()
        )),
        DuplicatePolicy::DropKeepFirst => {
            log::warn!("Duplicates found. Keep first row and delete the rest.");
            let drop_set: HashSet<usize> = drop.iter().copied().collect();
            let mut ix = 0;
            frame.rows_mut().retain(|_| {
                let keep = !drop_set.contains(&ix);
                ix += 1;
                keep
            });
            Ok(drop.len())
        }
    }
}

// --- Constant replacements ---

/// The plain constant rules: every non-blank value becomes the first
/// default value. R37 also covers blank-but-present values.
pub(super) fn rule_constant(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let value = default_1(rule);
    constant_replace(rule, frame, &value, false)
}

pub(super) fn rule_r37(rule: &MaskRule, frame: &mut Frame) -> Result<(), String> {
    let value = default_1(rule);
    constant_replace(rule, frame, &value, true)
}
