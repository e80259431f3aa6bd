// =====================================================
// MAPPING ORCHESTRATOR
// Resolves one configured job and runs it in four
// phases: objects, source actions, target actions and
// the data movement itself.
// =====================================================

use std::sync::Arc;

use crate::db_types::DedupCriteria;
use crate::masking::cache::build_rule_caches;
use crate::masking::{resolve_column_lengths, DuplicatePolicy};
use crate::repository::{
    MappingDefinition, MaskRuleSet, MetaRepository, ObjectRef, SourceAction, TargetAction,
};
use crate::sql_builder::{
    create_dml, create_selector, create_union_stmt, error_rows_clause, filter_invalid_clause,
    join_filter_clause, DmlAction,
};
use crate::status::{EventCode, ExecutionStatus};
use crate::table::{DbEngine, EngineRegistry, TableHandle, DEFAULT_MAX_MEMORY};
use crate::transfer;


/// Everything a job needs from the outside: the engine registry, the
/// metadata repository and the engine holding the lookup tables.
pub struct JobContext {
    pub engines: EngineRegistry,
    pub repository: Arc<dyn MetaRepository>,
    pub lookup: Arc<dyn DbEngine>,
    pub max_memory: u64,
    pub duplicate_policy: DuplicatePolicy,
}

impl JobContext {
    pub fn new(
        engines: EngineRegistry,
        repository: Arc<dyn MetaRepository>,
        lookup: Arc<dyn DbEngine>,
    ) -> Self {
        Self {
            engines,
            repository,
            lookup,
            max_memory: DEFAULT_MAX_MEMORY,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

/// Output of the object-resolution phase. Each business key is the explicit
/// override from the mapping row when present, the table primary key
/// otherwise.
struct ResolvedObjects {
    source_engine: Arc<dyn DbEngine>,
    target_engine: Arc<dyn DbEngine>,
    source: TableHandle,
    filter: Option<TableHandle>,
    target: TableHandle,
    source_key: Vec<String>,
    filter_key: Vec<String>,
    target_key: Vec<String>,
    rules: MaskRuleSet,
}

fn resolve_key(reference: &ObjectRef, table: &TableHandle) -> Vec<String> {
    match reference.business_key_list() {
        Some(keys) if !keys.is_empty() => keys,
        _ => {
            log::info!(
                "No business key configured for {}.{}, using the primary key.",
                reference.schema,
                reference.name
            );
            table.primary_key.clone()
        }
    }
}

/// Output of the source-action phase.
struct SourcePlan {
    /// Source/target column intersection, in source order.
    intersect: Vec<String>,
    /// Final selection statement against the source.
    src_query: String,
    /// Accumulated WHERE/JOIN fragment, fed into the MERGE subselect.
    src_filter: String,
}

fn fail(message: String) -> ExecutionStatus {
    log::error!("{}", message);
    ExecutionStatus::failed(EventCode::ActionFailed)
}

fn undefined_action(message: String) -> ExecutionStatus {
    log::error!("{}", message);
    ExecutionStatus::failed(EventCode::UndefinedAction)
}

/// Loads and runs one job. Every outcome is reported as a status record;
/// errors never propagate past this point.
pub async fn run_job(context: &JobContext, app_name: &str, job_name: &str) -> ExecutionStatus {
    log::info!("Running mapping {} / {}.", app_name, job_name);
    let status = match execute(context, app_name, job_name).await {
        Ok(status) => status,
        Err(status) => status,
    };
    log::info!(
        "Mapping {} / {} finished with event code {} after {} rows.",
        app_name,
        job_name,
        status.event_code.as_code(),
        status.rows_written
    );
    status
}

async fn execute(
    context: &JobContext,
    app_name: &str,
    job_name: &str,
) -> Result<ExecutionStatus, ExecutionStatus> {
    let definition = context
        .repository
        .load_mapping(app_name, job_name)
        .await
        .map_err(fail)?;
    if definition.is_ignored() {
        log::info!("Mapping is flagged to be ignored, nothing to do.");
        return Ok(ExecutionStatus::skipped());
    }
    let mut objects = create_objects(context, &definition).await?;
    let plan = create_source_actions(&definition, &objects).await?;
    let operations = create_target_actions(&definition, &objects, &plan).await?;
    let rows = run_operations(context, &mut objects, &plan, operations).await?;
    Ok(ExecutionStatus::success(rows))
}

/// Phase 1: resolve source, filter and target objects and load the rule set.
async fn create_objects(
    context: &JobContext,
    definition: &MappingDefinition,
) -> Result<ResolvedObjects, ExecutionStatus> {
    let source_engine = context
        .engines
        .get(definition.source.db_type)
        .map_err(fail)?;
    let source = source_engine
        .load_table(
            &definition.source.dsn,
            &definition.source.schema,
            &definition.source.name,
        )
        .await
        .map_err(fail)?;
    if !source.exists() {
        log::error!(
            "Source object {}.{} not found!",
            definition.source.schema,
            definition.source.name
        );
        return Err(ExecutionStatus::failed(EventCode::SourceMissing));
    }

    let source_key = resolve_key(&definition.source, &source);

    let mut rules = MaskRuleSet::default();
    if definition.mask_data {
        let rows = context
            .repository
            .load_mask_rules(&definition.app_name, &definition.job_name)
            .await
            .map_err(fail)?;
        rules = MaskRuleSet::from_rows(rows);
        let removed = rules.retain_source_attributes(&source.columns);
        if !removed.is_empty() {
            log::warn!(
                "Attributes {:?} are not part of the source object and will not be masked.",
                removed
            );
        }
        log::info!("Loaded {} masking rules.", rules.len());
    }

    let (filter, filter_key) = match &definition.filter {
        Some(reference) => {
            let engine = context.engines.get(reference.db_type).map_err(fail)?;
            let handle = engine
                .load_table(&reference.dsn, &reference.schema, &reference.name)
                .await
                .map_err(fail)?;
            if handle.exists() {
                let key = resolve_key(reference, &handle);
                (Some(handle), key)
            } else {
                log::warn!(
                    "Filter object {}.{} not found, continuing without it.",
                    reference.schema,
                    reference.name
                );
                (None, Vec::new())
            }
        }
        None => (None, Vec::new()),
    };

    let target_engine = context
        .engines
        .get(definition.target.db_type)
        .map_err(fail)?;
    let target = target_engine
        .load_table(
            &definition.target.dsn,
            &definition.target.schema,
            &definition.target.name,
        )
        .await
        .map_err(fail)?;
    if !target.exists() {
        log::error!(
            "Target object {}.{} not found!",
            definition.target.schema,
            definition.target.name
        );
        return Err(ExecutionStatus::failed(EventCode::TargetMissing));
    }
    let target_key = resolve_key(&definition.target, &target);

    Ok(ResolvedObjects {
        source_engine,
        target_engine,
        source,
        filter,
        target,
        source_key,
        filter_key,
        target_key,
        rules,
    })
}

/// Phase 2: build the source selection by applying the configured source
/// actions in order. DEDUPLICATE executes right away; everything else only
/// shapes the statement.
async fn create_source_actions(
    definition: &MappingDefinition,
    objects: &ResolvedObjects,
) -> Result<SourcePlan, ExecutionStatus> {
    let dialect = objects.source_engine.dialect();
    let intersect: Vec<String> = objects
        .source
        .columns
        .iter()
        .filter(|c| objects.target.columns.contains(c))
        .cloned()
        .collect();
    let mut src_query = create_selector(&intersect, &objects.source, dialect);
    let mut src_filter = String::new();

    for raw in definition.source_action_list() {
        let action = SourceAction::from_db(&raw).map_err(undefined_action)?;
        log::info!("Applying source action {:?}.", action);
        match action {
            SourceAction::Select => {
                if let Some(query) = definition.custom_query.as_deref() {
                    log::info!("Using the configured custom query.");
                    src_query = query.trim().trim_end_matches(';').to_string();
                }
            }
            SourceAction::Union => {
                if let Some(query) = definition.custom_query.as_deref() {
                    log::info!("Using the configured custom query.");
                    src_query = query.trim().trim_end_matches(';').to_string();
                    continue;
                }
                let filter = match objects.filter.as_ref() {
                    Some(filter) => filter,
                    None => {
                        log::error!("Source action UNION requires a filter object!");
                        return Err(ExecutionStatus::failed(EventCode::FilterKeyMissing));
                    }
                };
                if objects.source_key.is_empty() {
                    log::error!("Source action UNION requires a source business key!");
                    return Err(ExecutionStatus::failed(EventCode::SourceKeyMissing));
                }
                if objects.filter_key.is_empty() {
                    log::error!("Source action UNION requires a filter business key!");
                    return Err(ExecutionStatus::failed(EventCode::FilterKeyMissing));
                }
                if objects.filter_key.len() != objects.source_key.len() {
                    log::error!(
                        "Source and filter business keys differ in length ({} vs {})!",
                        objects.source_key.len(),
                        objects.filter_key.len()
                    );
                    return Err(ExecutionStatus::failed(EventCode::KeyArityMismatch));
                }
                src_query = create_union_stmt(
                    &objects.source,
                    filter,
                    &objects.source_key,
                    &objects.filter_key,
                    dialect,
                );
            }
            SourceAction::Deduplicate => {
                let keys = if !objects.source_key.is_empty() {
                    objects.source_key.clone()
                } else {
                    objects.target_key.clone()
                };
                objects
                    .source_engine
                    .deduplicate_rows(&objects.source, DedupCriteria::Min, &keys)
                    .await
                    .map_err(fail)?;
            }
            SourceAction::FilterInvalid => {
                if objects.target_key.is_empty() {
                    log::error!("Source action FILTER_INVALID requires a target key!");
                    return Err(ExecutionStatus::failed(EventCode::FilterKeyMissing));
                }
                let clause = filter_invalid_clause(&objects.target_key, dialect);
                src_query = format!("{} {}", src_query, clause);
                src_filter = clause;
            }
            SourceAction::Error => {
                if objects.target_key.is_empty() {
                    log::error!("Source action ERROR requires a target key!");
                    return Err(ExecutionStatus::failed(EventCode::FilterKeyMissing));
                }
                let clause = error_rows_clause(&objects.target_key, dialect);
                src_query = format!("{} {}", src_query, clause);
                src_filter = clause;
            }
            SourceAction::FilterJoin => {
                let filter = match objects.filter.as_ref() {
                    Some(filter) => filter,
                    None => {
                        log::error!("Source action FILTER_JOIN requires a filter object!");
                        return Err(ExecutionStatus::failed(EventCode::FilterKeyMissing));
                    }
                };
                if objects.source_key.is_empty() {
                    log::error!("Source action FILTER_JOIN requires a source business key!");
                    return Err(ExecutionStatus::failed(EventCode::SourceKeyMissing));
                }
                if objects.filter_key.is_empty() {
                    log::error!("Source action FILTER_JOIN requires a filter business key!");
                    return Err(ExecutionStatus::failed(EventCode::FilterKeyMissing));
                }
                let clause = join_filter_clause(
                    &objects.source,
                    filter,
                    &objects.source_key,
                    &objects.filter_key,
                    dialect,
                );
                src_query = format!("{} {}", src_query, clause);
                src_filter = clause;
            }
        }
    }

    log::debug!("Source selection: {}", src_query);
    Ok(SourcePlan {
        intersect,
        src_query,
        src_filter,
    })
}

/// Phase 3: TRUNCATE runs immediately and drops out of the operation list;
/// every other target action is compiled to its DML statement.
async fn create_target_actions(
    definition: &MappingDefinition,
    objects: &ResolvedObjects,
    plan: &SourcePlan,
) -> Result<Vec<(TargetAction, String)>, ExecutionStatus> {
    let dialect = objects.target_engine.dialect();
    let mut operations = Vec::new();
    for raw in definition.target_action_list() {
        let action = TargetAction::from_db(&raw).map_err(undefined_action)?;
        let dml_action = match action {
            TargetAction::Truncate => {
                log::info!(
                    "Truncating target table {}.{}.",
                    objects.target.schema,
                    objects.target.name
                );
                objects
                    .target_engine
                    .truncate_table(&objects.target)
                    .await
                    .map_err(fail)?;
                continue;
            }
            TargetAction::Insert => DmlAction::Insert,
            TargetAction::Upsert => DmlAction::Upsert,
            TargetAction::Merge => DmlAction::Merge,
            TargetAction::Mask => DmlAction::Mask,
            TargetAction::UpsertMask => DmlAction::UpsertMask,
        };
        let dml = create_dml(
            &plan.intersect,
            &objects.source,
            &objects.target,
            &objects.target_key,
            &plan.src_filter,
            dml_action,
            dialect,
        );
        log::debug!("Target DML for {}: {}", action.as_str(), dml);
        operations.push((action, dml));
    }
    Ok(operations)
}

/// Phase 4: run the remaining target actions in order and account for the
/// written rows.
async fn run_operations(
    context: &JobContext,
    objects: &mut ResolvedObjects,
    plan: &SourcePlan,
    operations: Vec<(TargetAction, String)>,
) -> Result<u64, ExecutionStatus> {
    if operations.is_empty() {
        log::info!("No target actions left to run.");
        return Ok(0);
    }
    let mut written = 0u64;
    for (action, dml) in operations {
        log::info!("Running target action {}.", action.as_str());
        let result = match action {
            TargetAction::Insert | TargetAction::Upsert => {
                transfer::copy_data(
                    objects.source_engine.as_ref(),
                    objects.target_engine.as_ref(),
                    &objects.source,
                    &objects.target,
                    &plan.src_query,
                    &dml,
                    &plan.intersect,
                    context.max_memory,
                )
                .await
            }
            TargetAction::Mask | TargetAction::UpsertMask => {
                resolve_column_lengths(&mut objects.rules, &objects.target);
                match build_rule_caches(context.lookup.as_ref(), &objects.rules).await {
                    Ok(caches) => {
                        transfer::mask_data(
                            objects.source_engine.as_ref(),
                            objects.target_engine.as_ref(),
                            &objects.source,
                            &objects.target,
                            &plan.src_query,
                            &dml,
                            &plan.intersect,
                            &objects.rules,
                            &caches,
                            context.duplicate_policy,
                            context.max_memory,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                }
            }
            TargetAction::Merge => {
                objects
                    .target_engine
                    .execute(&objects.target.dsn, &dml)
                    .await
            }
            // Removed from the list in the previous phase.
            TargetAction::Truncate => Ok(0),
        };
        match result {
            Ok(rows) => {
                log::info!("Target action {} wrote {} rows.", action.as_str(), rows);
                written += rows;
            }
            Err(e) => {
                log::error!("Target action {} failed: {}", action.as_str(), e);
                return Err(ExecutionStatus::failed_after(
                    EventCode::ActionFailed,
                    written,
                ));
            }
        }
    }
    Ok(written)
}
