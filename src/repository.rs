// =====================================================
// MAPPING METADATA REPOSITORY
// Loads job configuration and masking rules from the
// metadata schema (obj_mapping, obj_ruleset,
// obj_mask_data) and normalizes them into typed models.
// =====================================================

use crate::db_types::DatabaseType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;


/// Closed set of masking rules. Dispatch is an exhaustive match, so a rule
/// that is configured but not listed here fails at load time instead of at
/// row-processing time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleName {
    R01,
    R02,
    R03,
    R04,
    R05,
    R06,
    R10,
    R11,
    R12,
    R13,
    R14,
    R16,
    R17,
    R18,
    R19,
    R21,
    R23,
    R24,
    R35,
    R36,
    R37,
    R41,
    R46,
    R47,
    R49,
    R50,
    R55,
    R56,
    R57,
    R58,
    R59,
    R60,
    R61,
    R62,
    R63,
    R64,
    R65,
    R69,
    R82,
    R83,
}

impl RuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::R01 => "R01",
            Self::R02 => "R02",
            Self::R03 => "R03",
            Self::R04 => "R04",
            Self::R05 => "R05",
            Self::R06 => "R06",
            Self::R10 => "R10",
            Self::R11 => "R11",
            Self::R12 => "R12",
            Self::R13 => "R13",
            Self::R14 => "R14",
            Self::R16 => "R16",
            Self::R17 => "R17",
            Self::R18 => "R18",
            Self::R19 => "R19",
            Self::R21 => "R21",
            Self::R23 => "R23",
            Self::R24 => "R24",
            Self::R35 => "R35",
            Self::R36 => "R36",
            Self::R37 => "R37",
            Self::R41 => "R41",
            Self::R46 => "R46",
            Self::R47 => "R47",
            Self::R49 => "R49",
            Self::R50 => "R50",
            Self::R55 => "R55",
            Self::R56 => "R56",
            Self::R57 => "R57",
            Self::R58 => "R58",
            Self::R59 => "R59",
            Self::R60 => "R60",
            Self::R61 => "R61",
            Self::R62 => "R62",
            Self::R63 => "R63",
            Self::R64 => "R64",
            Self::R65 => "R65",
            Self::R69 => "R69",
            Self::R82 => "R82",
            Self::R83 => "R83",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_uppercase().as_str() {
            "R01" => Ok(Self::R01),
            "R02" => Ok(Self::R02),
            "R03" => Ok(Self::R03),
            "R04" => Ok(Self::R04),
            "R05" => Ok(Self::R05),
            "R06" => Ok(Self::R06),
            "R10" => Ok(Self::R10),
            "R11" => Ok(Self::R11),
            "R12" => Ok(Self::R12),
            "R13" => Ok(Self::R13),
            "R14" => Ok(Self::R14),
            "R16" => Ok(Self::R16),
            "R17" => Ok(Self::R17),
            "R18" => Ok(Self::R18),
            "R19" => Ok(Self::R19),
            "R21" => Ok(Self::R21),
            "R23" => Ok(Self::R23),
            "R24" => Ok(Self::R24),
            "R35" => Ok(Self::R35),
            "R36" => Ok(Self::R36),
            "R37" => Ok(Self::R37),
            "R41" => Ok(Self::R41),
            "R46" => Ok(Self::R46),
            "R47" => Ok(Self::R47),
            "R49" => Ok(Self::R49),
            "R50" => Ok(Self::R50),
            "R55" => Ok(Self::R55),
            "R56" => Ok(Self::R56),
            "R57" => Ok(Self::R57),
            "R58" => Ok(Self::R58),
            "R59" => Ok(Self::R59),
            "R60" => Ok(Self::R60),
            "R61" => Ok(Self::R61),
            "R62" => Ok(Self::R62),
            "R63" => Ok(Self::R63),
            "R64" => Ok(Self::R64),
            "R65" => Ok(Self::R65),
            "R69" => Ok(Self::R69),
            "R82" => Ok(Self::R82),
            "R83" => Ok(Self::R83),
            other => Err(format!("Masking rule {} is not implemented.", other)),
        }
    }

    /// Rules whose replacement values come from a lookup table.
    pub fn uses_cache(&self) -> bool {
        matches!(
            self,
            Self::R01
                | Self::R02
                | Self::R04
                | Self::R05
                | Self::R06
                | Self::R10
                | Self::R12
                | Self::R14
                | Self::R36
                | Self::R46
        )
    }
}

/// One side of a mapping (source, filter or target object).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ObjectRef {
    pub db_type: DatabaseType,
    pub dsn: String,
    pub schema: String,
    pub name: String,
    pub business_key: Option<String>,
}

impl ObjectRef {
    /// Comma-separated business key from the configuration, split into
    /// column names.
    pub fn business_key_list(&self) -> Option<Vec<String>> {
        self.business_key.as_ref().map(|bk| {
            bk.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
    }
}

/// One row of obj_mapping joined with its ruleset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MappingDefinition {
    pub app_name: String,
    pub job_name: String,
    pub source: ObjectRef,
    pub filter: Option<ObjectRef>,
    pub target: ObjectRef,
    pub ruleset_id: i64,
    pub custom_query: Option<String>,
    pub rule_name: String,
    pub rule_strategy: Option<String>,
    pub mask_data: bool,
    pub source_actions: Option<String>,
    pub target_actions: Option<String>,
    pub agg_cols: Option<String>,
}

impl MappingDefinition {
    /// A mapping flagged to be skipped entirely.
    pub fn is_ignored(&self) -> bool {
        self.rule_strategy
            .as_deref()
            .map(|s| {
                let s = s.trim().to_ascii_uppercase();
                s == "IGNORIEREN" || s == "IGNORE"
            })
            .unwrap_or(false)
    }

    pub fn source_action_list(&self) -> Vec<String> {
        split_action_list(self.source_actions.as_deref())
    }

    pub fn target_action_list(&self) -> Vec<String> {
        split_action_list(self.target_actions.as_deref())
    }
}

fn split_action_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Actions executed against the source object, in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAction {
    Select,
    Union,
    Deduplicate,
    FilterInvalid,
    Error,
    FilterJoin,
}

impl SourceAction {
    pub fn from_db(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SELECT" => Ok(Self::Select),
            "UNION" => Ok(Self::Union),
            "DEDUPLICATE" => Ok(Self::Deduplicate),
            "FILTER_INVALID" => Ok(Self::FilterInvalid),
            "ERROR" => Ok(Self::Error),
            "FILTER_JOIN" => Ok(Self::FilterJoin),
            other => Err(format!("Source action {} not defined.", other)),
        }
    }
}

/// Actions executed against the target object, in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    Truncate,
    Insert,
    Upsert,
    Merge,
    Mask,
    UpsertMask,
}

impl TargetAction {
    pub fn from_db(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRUNCATE" => Ok(Self::Truncate),
            "INSERT" => Ok(Self::Insert),
            "UPSERT" => Ok(Self::Upsert),
            "MERGE" => Ok(Self::Merge),
            "MASK" => Ok(Self::Mask),
            "UPSERT_MASK" => Ok(Self::UpsertMask),
            other => Err(format!("Target action {} not defined.", other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Truncate => "TRUNCATE",
            Self::Insert => "INSERT",
            Self::Upsert => "UPSERT",
            Self::Merge => "MERGE",
            Self::Mask => "MASK",
            Self::UpsertMask => "UPSERT_MASK",
        }
    }

    pub fn is_masking(&self) -> bool {
        matches!(self, Self::Mask | Self::UpsertMask)
    }
}

/// One masking rule from obj_mask_data. Composite rules carry parallel
/// `attributes`/`lkp_cols`/`column_lengths` lists after reduction; simple
/// rules carry exactly one entry each.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaskRule {
    pub application: String,
    pub table: String,
    pub attributes: Vec<String>,
    pub rule_name: RuleName,
    pub rule_over: bool,
    pub lkp_dsn: Option<String>,
    pub lkp_schema: Option<String>,
    pub lkp_obj: Option<String>,
    pub lkp_cols: Vec<Option<String>>,
    pub lkp_id: Option<i64>,
    pub translate_expression: Option<String>,
    pub default_value_1: Option<String>,
    pub default_value_2: Option<String>,
    pub default_value_3: Option<String>,
    pub format_string: Option<String>,
    /// Declared target column lengths parallel to `attributes`, resolved
    /// from table metadata before the rules run.
    pub column_lengths: Vec<Option<i32>>,
}

impl MaskRule {
    /// The attribute the rule is keyed by.
    pub fn primary_attribute(&self) -> &str {
        &self.attributes[0]
    }

    /// First lookup column definition, split on commas. Simple lookup rules
    /// encode original/masked (and sometimes a word-class column) this way.
    pub fn lkp_col_list(&self) -> Vec<&str> {
        self.lkp_cols
            .first()
            .and_then(|c| c.as_deref())
            .map(|c| c.split(',').map(str::trim).collect())
            .unwrap_or_default()
    }

    pub fn cache_name(&self) -> String {
        format!("{}_cache", self.rule_name.as_str())
    }
}

/// Ordered rule collection keyed by primary attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskRuleSet {
    rules: Vec<MaskRule>,
}

impl MaskRuleSet {
    /// Builds the rule set from raw rows, merging composite rules: rows that
    /// share a rule name, carry the override flag and define lookup columns
    /// collapse into one rule with parallel attribute lists.
    pub fn from_rows(rows: Vec<MaskRule>) -> Self {
        let mut rules: Vec<MaskRule> = Vec::new();
        for row in rows {
            if row.rule_over && row.lkp_cols.iter().any(|c| c.is_some()) {
                if let Some(ix) = rules
                    .iter()
                    .position(|r| r.rule_name == row.rule_name && r.rule_over)
                {
                    rules[ix].attributes.extend(row.attributes);
                    rules[ix].lkp_cols.extend(row.lkp_cols);
                    rules[ix].column_lengths.extend(row.column_lengths);
                    continue;
                }
            }
            rules.push(row);
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaskRule> {
        self.rules.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MaskRule> {
        self.rules.iter_mut()
    }

    pub fn attributes(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.primary_attribute()).collect()
    }

    /// Drops rules whose keyed attribute is not part of the source column
    /// list and returns the removed attribute names for logging.
    pub fn retain_source_attributes(&mut self, source_columns: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        self.rules.retain(|rule| {
            let keep = source_columns
                .iter()
                .any(|c| c == rule.primary_attribute());
            if !keep {
                removed.push(rule.primary_attribute().to_string());
            }
            keep
        });
        removed
    }
}

/// Read access to the metadata schema.
#[async_trait]
pub trait MetaRepository: Send + Sync {
    async fn load_mapping(&self, app_name: &str, job_name: &str)
        -> Result<MappingDefinition, String>;

    /// Raw mask rules for the job's target object, excluding unfinished
    /// entries (rule names ending in TODO). Composite reduction happens in
    /// `MaskRuleSet::from_rows`.
    async fn load_mask_rules(&self, app_name: &str, job_name: &str)
        -> Result<Vec<MaskRule>, String>;
}

/// Metadata repository backed by the central PostgreSQL schema.
pub struct PgMetaRepository {
    pool: PgPool,
}

impl PgMetaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetaRepository for PgMetaRepository {
    async fn load_mapping(
        &self,
        app_name: &str,
        job_name: &str,
    ) -> Result<MappingDefinition, String> {
        let query = "SELECT \
                       a.src_type, a.src_dsn, a.src_schema, a.src_obj, a.src_business_key, \
                       a.fil_type, a.fil_dsn, a.fil_schema, a.fil_obj, a.fil_business_key, \
                       a.tgt_type, a.tgt_dsn, a.tgt_schema, a.tgt_obj, a.tgt_business_key, \
                       a.ruleset_id, a.custom_query, \
                       b.rule_name, b.rule_strategy, b.flg_mask_data, b.src_ruleset, b.tgt_ruleset, b.agg_cols \
                     FROM obj_mapping a \
                     JOIN obj_ruleset b ON a.ruleset_id = b.ruleset_id \
                     WHERE a.app_name = $1 AND a.job_name = $2";
        let row = sqlx::query(query)
            .bind(app_name)
            .bind(job_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to load mapping configuration: {}", e))?
            .ok_or_else(|| {
                format!(
                    "No mapping found for application {} and job {}",
                    app_name, job_name
                )
            })?;

        let source = ObjectRef {
            db_type: DatabaseType::from_db(&get_string(&row, "src_type")?)?,
            dsn: get_string(&row, "src_dsn")?,
            schema: get_string(&row, "src_schema")?,
            name: get_string(&row, "src_obj")?,
            business_key: get_opt_string(&row, "src_business_key")?,
        };
        let filter = match get_opt_string(&row, "fil_type")? {
            Some(fil_type) => Some(ObjectRef {
                db_type: DatabaseType::from_db(&fil_type)?,
                dsn: get_string(&row, "fil_dsn")?,
                schema: get_string(&row, "fil_schema")?,
                name: get_string(&row, "fil_obj")?,
                business_key: get_opt_string(&row, "fil_business_key")?,
            }),
            None => None,
        };
        let target = ObjectRef {
            db_type: DatabaseType::from_db(&get_string(&row, "tgt_type")?)?,
            dsn: get_string(&row, "tgt_dsn")?,
            schema: get_string(&row, "tgt_schema")?,
            name: get_string(&row, "tgt_obj")?,
            business_key: get_opt_string(&row, "tgt_business_key")?,
        };

        Ok(MappingDefinition {
            app_name: app_name.to_string(),
            job_name: job_name.to_string(),
            source,
            filter,
            target,
            ruleset_id: row
                .try_get::<i64, _>("ruleset_id")
                .map_err(|e| format!("Failed to read ruleset_id: {}", e))?,
            custom_query: get_opt_string(&row, "custom_query")?,
            rule_name: get_string(&row, "rule_name")?,
            rule_strategy: get_opt_string(&row, "rule_strategy")?,
            mask_data: row
                .try_get::<i32, _>("flg_mask_data")
                .map(|flag| flag == 1)
                .map_err(|e| format!("Failed to read flg_mask_data: {}", e))?,
            source_actions: get_opt_string(&row, "src_ruleset")?,
            target_actions: get_opt_string(&row, "tgt_ruleset")?,
            agg_cols: get_opt_string(&row, "agg_cols")?,
        })
    }

    async fn load_mask_rules(
        &self,
        app_name: &str,
        job_name: &str,
    ) -> Result<Vec<MaskRule>, String> {
        let query = "WITH job AS ( \
                       SELECT a.app_name, a.project, a.subproject, b.job_name, c.tgt_obj \
                       FROM obj_application a \
                       JOIN obj_job b ON a.app_name = b.app_name \
                       JOIN obj_mapping c ON a.app_name = c.app_name AND b.job_name = c.job_name \
                       WHERE a.app_name = $1 AND b.job_name = $2) \
                     SELECT a.anwendung, a.tabelle, a.attribut, a.rule_name, a.flg_rule_over, \
                       a.lkp_dsn, a.lkp_schema, a.lkp_obj, a.lkp_cols, a.lkp_id, a.translate_expression, \
                       a.default_value_1, a.default_value_2, a.default_value_3, a.format_string \
                     FROM obj_mask_data a \
                     JOIN job b ON a.anwendung = b.subproject AND a.tabelle = b.tgt_obj \
                     WHERE a.rule_name NOT LIKE '%TODO'";
        let rows = sqlx::query(query)
            .bind(app_name)
            .bind(job_name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to load mask rules: {}", e))?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            rules.push(MaskRule {
                application: get_string(&row, "anwendung")?,
                table: get_string(&row, "tabelle")?,
                attributes: vec![get_string(&row, "attribut")?],
                rule_name: RuleName::from_db(&get_string(&row, "rule_name")?)?,
                rule_over: row
                    .try_get::<i32, _>("flg_rule_over")
                    .map(|flag| flag == 1)
                    .unwrap_or(false),
                lkp_dsn: get_opt_string(&row, "lkp_dsn")?,
                lkp_schema: get_opt_string(&row, "lkp_schema")?,
                lkp_obj: get_opt_string(&row, "lkp_obj")?,
                lkp_cols: vec![get_opt_string(&row, "lkp_cols")?],
                lkp_id: row.try_get::<Option<i64>, _>("lkp_id").unwrap_or(None),
                translate_expression: get_opt_string(&row, "translate_expression")?,
                default_value_1: get_opt_string(&row, "default_value_1")?,
                default_value_2: get_opt_string(&row, "default_value_2")?,
                default_value_3: get_opt_string(&row, "default_value_3")?,
                format_string: get_opt_string(&row, "format_string")?,
                column_lengths: vec![None],
            });
        }
        Ok(rules)
    }
}

fn get_string(row: &sqlx::postgres::PgRow, column: &str) -> Result<String, String> {
    row.try_get::<String, _>(column)
        .map_err(|e| format!("Failed to read column {}: {}", column, e))
}

fn get_opt_string(row: &sqlx::postgres::PgRow, column: &str) -> Result<Option<String>, String> {
    row.try_get::<Option<String>, _>(column)
        .map_err(|e| format!("Failed to read column {}: {}", column, e))
}
