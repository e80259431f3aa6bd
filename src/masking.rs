// =====================================================
// MASKING PIPELINE
// Applies the configured rule set to one block of rows
// and reconciles the result with the target table.
// =====================================================

use crate::frame::Frame;
use crate::masking::cache::RuleCaches;
use crate::repository::{MaskRule, MaskRuleSet, RuleName};
use crate::table::TableHandle;

pub mod cache;
pub mod rules;

#[cfg(test)]
mod tests;

/// How to handle rows whose primary key collides after address masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep the first row per key and drop the rest, with a warning.
    #[default]
    DropKeepFirst,
    /// Treat duplicates as a rule failure.
    Fail,
}

/// Resolves the declared target column length for every rule attribute.
/// The word-replacement rules truncate their output to these lengths.
pub fn resolve_column_lengths(rules: &mut MaskRuleSet, target: &TableHandle) {
    for rule in rules.iter_mut() {
        rule.column_lengths = rule
            .attributes
            .iter()
            .map(|attr| target.column_types.get(attr).and_then(|meta| meta.length))
            .collect();
    }
}

fn require_cache<'a>(caches: &'a RuleCaches, rule: &MaskRule) -> Result<&'a cache::LookupCache, String> {
    caches
        .get(&rule.cache_name())
        .ok_or_else(|| format!("No cache found for rule {}", rule.rule_name.as_str()))
}

/// Runs every rule over the block and returns it in target column order.
/// The row count must survive the pipeline; only the duplicate policy may
/// legitimately remove rows, and those are accounted for.
pub fn mask_frame(
    frame: Frame,
    rules: &MaskRuleSet,
    source: &TableHandle,
    target: &TableHandle,
    caches: &RuleCaches,
    policy: DuplicatePolicy,
) -> Result<Frame, String> {
    let mut frame = frame;
    let original_rows = frame.len();
    let original_width = frame.width();
    log::info!(
        "Original block contains {} rows in {} columns.",
        original_rows,
        original_width
    );

    let mut dropped = 0usize;
    for rule in rules.iter() {
        log::info!(
            "Processing rule {} for attribute {:?} with length {:?}",
            rule.rule_name.as_str(),
            rule.attributes,
            rule.column_lengths
        );
        match rule.rule_name {
            RuleName::R01 => rules::rule_r01(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R02 => rules::rule_r02(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R03 => rules::rule_r03(rule, &mut frame)?,
            RuleName::R04 => rules::rule_r04(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R05 => rules::rule_r05(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R06 => rules::rule_r06(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R10 => rules::rule_r10(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R11 => rules::rule_r11(rule, &mut frame)?,
            RuleName::R12 => {
                let adr = caches
                    .address
                    .as_ref()
                    .ok_or_else(|| "No address cache found for rule R12".to_string())?;
                let hsn = caches
                    .house_numbers
                    .as_ref()
                    .ok_or_else(|| "No house number cache found for rule R12".to_string())?;
                dropped +=
                    rules::rule_r12(rule, &mut frame, adr, hsn, &source.primary_key, policy)?;
            }
            RuleName::R13 => rules::rule_r13(rule, &mut frame)?,
            RuleName::R14 => rules::rule_r14(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R17 => rules::rule_r17(rule, &mut frame)?,
            RuleName::R19 => rules::rule_r19(rule, &mut frame)?,
            RuleName::R23 => rules::rule_r23(rule, &mut frame)?,
            RuleName::R24 => rules::rule_r24(rule, &mut frame)?,
            RuleName::R36 => rules::rule_r36(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R37 => rules::rule_r37(rule, &mut frame)?,
            RuleName::R46 => rules::rule_r46(rule, &mut frame, require_cache(caches, rule)?)?,
            RuleName::R56 => rules::rule_r56(rule, &mut frame)?,
            RuleName::R65 => rules::rule_r65(rule, &mut frame)?,
            RuleName::R69 => rules::rule_r69(rule, &mut frame)?,
            RuleName::R82 => rules::rule_r82(rule, &mut frame)?,
            RuleName::R83 => rules::rule_r83(rule, &mut frame)?,
            RuleName::R16
            | RuleName::R18
            | RuleName::R21
            | RuleName::R35
            | RuleName::R41
            | RuleName::R47
            | RuleName::R49
            | RuleName::R50
            | RuleName::R55
            | RuleName::R57
            | RuleName::R58
            | RuleName::R59
            | RuleName::R60
            | RuleName::R61
            | RuleName::R62
            | RuleName::R63
            | RuleName::R64 => rules::rule_constant(rule, &mut frame)?,
        }
    }

    log::info!(
        "Masked block contains {} rows in {} columns.",
        frame.len(),
        frame.width()
    );
    if frame.len() + dropped != original_rows || frame.width() != original_width {
        return Err(format!(
            "Different data structure found between original ({}x{}) and masked ({}x{}) block.",
            original_rows,
            original_width,
            frame.len(),
            frame.width()
        ));
    }

    // Column sequence can differ between source and target; reorder the
    // block to target order over the shared columns.
    let order: Vec<String> = target
        .columns
        .iter()
        .filter(|c| frame.column_index(c).is_some())
        .cloned()
        .collect();
    if frame.columns() != order.as_slice() {
        return frame.select_columns(&order);
    }
    Ok(frame)
}
