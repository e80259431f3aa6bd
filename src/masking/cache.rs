// =====================================================
// LOOKUP CACHES FOR MASKING RULES
// Each cached lookup table is read once per job and held
// in memory; rules resolve replacements against these
// maps instead of querying per row.
// =====================================================

use crate::frame::{cell_i64, cell_string, Frame};
use crate::repository::{MaskRule, MaskRuleSet, RuleName};
use crate::table::DbEngine;
use std::collections::HashMap;

/// Raw lookup rows with normalized (uppercased) column names.
#[derive(Debug, Clone)]
pub struct LookupCache {
    frame: Frame,
}

impl LookupCache {
    pub fn new(mut frame: Frame) -> Self {
        let columns = frame
            .columns()
            .iter()
            .map(|c| c.to_ascii_uppercase())
            .collect();
        frame.rename_columns(columns);
        Self { frame }
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Original-to-masked map. Keys are trimmed and lowercased; the first
    /// occurrence of a key wins.
    pub fn map(&self, key_col: &str, value_col: &str) -> Result<HashMap<String, String>, String> {
        let key_ix = self.frame.require_column(key_col)?;
        let value_ix = self.frame.require_column(value_col)?;
        let mut map = HashMap::with_capacity(self.frame.len());
        for row in self.frame.rows() {
            let key = cell_string(&row[key_ix]).trim_end().to_lowercase();
            map.entry(key).or_insert_with(|| cell_string(&row[value_ix]));
        }
        Ok(map)
    }

    /// Map restricted to rows whose word-class column matches one of the
    /// given classes. Classes are scanned in the given order, so with
    /// several candidate classes the earlier class wins for duplicate keys.
    pub fn map_for_classes(
        &self,
        key_col: &str,
        value_col: &str,
        class_col: &str,
        classes: &[i64],
    ) -> Result<HashMap<String, String>, String> {
        let key_ix = self.frame.require_column(key_col)?;
        let value_ix = self.frame.require_column(value_col)?;
        let class_ix = self.frame.require_column(class_col)?;
        let mut map = HashMap::new();
        for class in classes {
            for row in self.frame.rows() {
                if cell_i64(&row[class_ix]) != Some(*class) {
                    continue;
                }
                let key = cell_string(&row[key_ix]).trim_end().to_lowercase();
                map.entry(key).or_insert_with(|| cell_string(&row[value_ix]));
            }
        }
        Ok(map)
    }

    /// Numeric join map. Keys are canonicalized to their integer form so a
    /// text column storing "7" matches a numeric lookup key 7.
    pub fn numeric_map(
        &self,
        key_col: &str,
        value_col: &str,
    ) -> Result<HashMap<String, String>, String> {
        let key_ix = self.frame.require_column(key_col)?;
        let value_ix = self.frame.require_column(value_col)?;
        let mut map = HashMap::with_capacity(self.frame.len());
        for row in self.frame.rows() {
            let key = canonical_key(&row[key_ix]);
            map.entry(key).or_insert_with(|| cell_string(&row[value_ix]));
        }
        Ok(map)
    }
}

/// Numeric cells and numeric strings collapse to the same key.
pub fn canonical_key(value: &serde_json::Value) -> String {
    match cell_i64(value) {
        Some(n) => n.to_string(),
        None => cell_string(value).trim_end().to_string(),
    }
}

/// One masked street entry from the address mapping tables.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedAddress {
    pub adr_id: i64,
    pub mask_street: String,
    pub mask_hsn: String,
}

/// Address lookup keyed by the packed lowercase street+zip+city key.
#[derive(Debug, Clone, Default)]
pub struct AddressCache {
    entries: HashMap<String, MaskedAddress>,
}

impl AddressCache {
    pub fn from_frame(frame: &LookupCache) -> Result<Self, String> {
        let adr_ix = frame.frame.require_column("ADR_ID")?;
        let key_ix = frame.frame.require_column("ORG_ADR")?;
        let str_ix = frame.frame.require_column("MASK_STR")?;
        let hsn_ix = frame.frame.require_column("MASK_HSN")?;
        let mut entries = HashMap::with_capacity(frame.len());
        for row in frame.frame.rows() {
            let adr_id = cell_i64(&row[adr_ix])
                .ok_or_else(|| "Address cache contains a non-numeric ADR_ID".to_string())?;
            entries
                .entry(cell_string(&row[key_ix]))
                .or_insert(MaskedAddress {
                    adr_id,
                    mask_street: cell_string(&row[str_ix]),
                    mask_hsn: cell_string(&row[hsn_ix]),
                });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&MaskedAddress> {
        self.entries.get(key)
    }
}

/// House-number level lookup keyed by address key, address id and original
/// house number. Entries here override the street-level cache.
#[derive(Debug, Clone, Default)]
pub struct HouseNumberCache {
    entries: HashMap<(String, i64, String), MaskedAddress>,
}

impl HouseNumberCache {
    pub fn from_frame(frame: &LookupCache) -> Result<Self, String> {
        let adr_ix = frame.frame.require_column("ADR_ID")?;
        let key_ix = frame.frame.require_column("ORG_ADR")?;
        let org_hsn_ix = frame.frame.require_column("ORG_HSN")?;
        let str_ix = frame.frame.require_column("MASK_STR")?;
        let hsn_ix = frame.frame.require_column("MASK_HSN")?;
        let mut entries = HashMap::with_capacity(frame.len());
        for row in frame.frame.rows() {
            let adr_id = cell_i64(&row[adr_ix])
                .ok_or_else(|| "House number cache contains a non-numeric ADR_ID".to_string())?;
            let key = (
                cell_string(&row[key_ix]),
                adr_id,
                cell_string(&row[org_hsn_ix]),
            );
            entries.entry(key).or_insert(MaskedAddress {
                adr_id,
                mask_street: cell_string(&row[str_ix]),
                mask_hsn: cell_string(&row[hsn_ix]),
            });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, org_adr: &str, adr_id: i64, org_hsn: &str) -> Option<&MaskedAddress> {
        self.entries.get(&(org_adr.to_string(), adr_id, org_hsn.to_string()))
    }
}

/// All caches a rule set needs, resolved before the first chunk is read.
#[derive(Debug, Clone, Default)]
pub struct RuleCaches {
    lookups: HashMap<String, LookupCache>,
    pub address: Option<AddressCache>,
    pub house_numbers: Option<HouseNumberCache>,
}

impl RuleCaches {
    pub fn get(&self, cache_name: &str) -> Option<&LookupCache> {
        self.lookups.get(cache_name)
    }

    pub fn insert(&mut self, cache_name: String, cache: LookupCache) {
        self.lookups.insert(cache_name, cache);
    }
}

/// Packed address columns: a two-digit length prefix separates the masked
/// street from the masked house number.
fn address_cache_query(schema: &str, table: &str, with_hsn: bool) -> String {
    let org_hsn = if with_hsn {
        ", rtrim(org_hsn) AS org_hsn"
    } else {
        ""
    };
    format!(
        "SELECT adr_id, lower(org_adr) AS org_adr{org_hsn}, \
         substr(mask_adr, 3, cast(substr(mask_adr, 1, 2) AS int)) AS mask_str, \
         rtrim(substr(mask_adr, cast(substr(mask_adr, 1, 2) AS int) + 3)) AS mask_hsn \
         FROM {schema}.{table}",
        org_hsn = org_hsn,
        schema = schema,
        table = table,
    )
}

/// Reads every cache the rule set references from the lookup backend.
pub async fn build_rule_caches(
    engine: &dyn DbEngine,
    rules: &MaskRuleSet,
) -> Result<RuleCaches, String> {
    let mut caches = RuleCaches::default();
    for rule in rules.iter() {
        let dsn = match rule.lkp_dsn.as_deref() {
            Some(dsn) => dsn,
            None => continue,
        };
        if rule.rule_name == RuleName::R12 {
            let schema = rule
                .lkp_schema
                .as_deref()
                .ok_or_else(|| "Address rule without a lookup schema".to_string())?;
            log::debug!("Reading address cache from {}.tdm_mt_zuers_adr", schema);
            let adr = engine
                .query_frame(dsn, &address_cache_query(schema, "tdm_mt_zuers_adr", false))
                .await?;
            caches.address = Some(AddressCache::from_frame(&LookupCache::new(adr))?);
            log::debug!("Reading house number cache from {}.tdm_mt_zuers_hsn", schema);
            let hsn = engine
                .query_frame(dsn, &address_cache_query(schema, "tdm_mt_zuers_hsn", true))
                .await?;
            caches.house_numbers = Some(HouseNumberCache::from_frame(&LookupCache::new(hsn))?);
            continue;
        }
        let stmt = cache_statement(rule);
        if let Some(stmt) = stmt {
            log::debug!("Reading cache for rule {}: {}", rule.rule_name.as_str(), stmt);
            let frame = engine.query_frame(dsn, &stmt).await?;
            caches.insert(rule.cache_name(), LookupCache::new(frame));
        }
    }
    Ok(caches)
}

/// A configured inline query wins over the generated full-table selection.
fn cache_statement(rule: &MaskRule) -> Option<String> {
    if let Some(stmt) = rule.translate_expression.as_deref() {
        return Some(stmt.trim().trim_end_matches(';').to_string());
    }
    match (
        rule.lkp_schema.as_deref(),
        rule.lkp_obj.as_deref(),
        rule.lkp_cols.first().and_then(|c| c.as_deref()),
    ) {
        (Some(schema), Some(obj), Some(cols)) => {
            Some(format!("SELECT {} FROM {}.{}", cols, schema, obj))
        }
        _ => None,
    }
}
