// =====================================================
// CHUNKED DATA TRANSFER
// Streams the source selection into the target, either
// verbatim or through the masking pipeline.
// =====================================================

use crate::frame::Frame;
use crate::masking::cache::RuleCaches;
use crate::masking::{mask_frame, DuplicatePolicy};
use crate::repository::MaskRuleSet;
use crate::table::{DbEngine, TableHandle, DEFAULT_COMMIT_RATE};

#[cfg(test)]
mod tests;

/// Copies the selection into the target in memory-bounded chunks and
/// returns the number of rows written.
pub async fn copy_data(
    source_engine: &dyn DbEngine,
    target_engine: &dyn DbEngine,
    source: &TableHandle,
    target: &TableHandle,
    selector: &str,
    dml: &str,
    columns: &[String],
    max_memory: u64,
) -> Result<u64, String> {
    let chunk_rows = source.chunk_size(max_memory);
    if source.columns.len() != target.columns.len() {
        log::warn!(
            "Source and target differ in structure ({} vs {} columns), only the shared attributes are copied.",
            source.columns.len(),
            target.columns.len()
        );
    }
    log::info!(
        "Copying {}.{} to {}.{} in chunks of {} rows.",
        source.schema,
        source.name,
        target.schema,
        target.name,
        chunk_rows
    );
    let mut stream = source_engine.open_stream(&source.dsn, selector).await?;
    let mut written = 0u64;
    let mut cycle = 0u64;
    loop {
        let rows = stream.fetch_chunk(chunk_rows).await?;
        if rows.is_empty() {
            break;
        }
        cycle += 1;
        log::debug!("Write cycle {} with {} rows.", cycle, rows.len());
        written += target_engine
            .write_batch(&target.dsn, dml, columns, &rows)
            .await?;
    }
    log::info!("Copied {} rows in {} cycles.", written, cycle);
    Ok(written)
}

/// Like [`copy_data`], but every chunk runs through the rule set before it
/// is imported into the target.
pub async fn mask_data(
    source_engine: &dyn DbEngine,
    target_engine: &dyn DbEngine,
    source: &TableHandle,
    target: &TableHandle,
    selector: &str,
    dml: &str,
    columns: &[String],
    rules: &MaskRuleSet,
    caches: &RuleCaches,
    policy: DuplicatePolicy,
    max_memory: u64,
) -> Result<u64, String> {
    let chunk_rows = source.chunk_size(max_memory);
    log::info!(
        "Masking {}.{} into {}.{} in chunks of {} rows.",
        source.schema,
        source.name,
        target.schema,
        target.name,
        chunk_rows
    );
    let mut stream = source_engine.open_stream(&source.dsn, selector).await?;
    let mut written = 0u64;
    let mut cycle = 0u64;
    loop {
        let rows = stream.fetch_chunk(chunk_rows).await?;
        if rows.is_empty() {
            break;
        }
        cycle += 1;
        log::debug!("Mask cycle {} with {} rows.", cycle, rows.len());
        let block = Frame::from_rows(columns.to_vec(), rows)?;
        let masked = mask_frame(block, rules, source, target, caches, policy)?;
        written += target_engine
            .import_block(target, &masked, dml, DEFAULT_COMMIT_RATE)
            .await?;
    }
    log::info!("Masked {} rows in {} cycles.", written, cycle);
    Ok(written)
}
