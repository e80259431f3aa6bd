// =====================================================
// NAMED-COLUMN ROW BLOCK
// In-memory tabular structure passed between the chunked
// reader, the masking pipeline and the block writer.
// =====================================================

use serde_json::Value;
use std::collections::HashSet;


#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, String> {
        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(format!(
                    "Row {} has {} values but the block has {} columns",
                    index + 1,
                    row.len(),
                    columns.len()
                ));
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Vec<Vec<Value>> {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, String> {
        self.column_index(name)
            .ok_or_else(|| format!("Column {} not found in block", name))
    }

    /// Replaces the column names without touching the data. The new list
    /// must have the same width.
    pub fn rename_columns(&mut self, columns: Vec<String>) {
        debug_assert_eq!(columns.len(), self.columns.len());
        self.columns = columns;
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), String> {
        if row.len() != self.columns.len() {
            return Err(format!(
                "Row has {} values but the block has {} columns",
                row.len(),
                self.columns.len()
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Reorders the block to the given column order, e.g. to reconcile a
    /// masked block with the target table before the bulk import.
    pub fn select_columns(&self, order: &[String]) -> Result<Frame, String> {
        let indices = order
            .iter()
            .map(|name| self.require_column(name))
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Frame {
            columns: order.to_vec(),
            rows,
        })
    }

    /// Drops every row whose key-column values were already seen, keeping
    /// the first occurrence. An empty key list compares whole rows.
    /// Returns the number of dropped rows.
    pub fn dedup_keep_first(&mut self, keys: &[String]) -> Result<usize, String> {
        let indices = keys
            .iter()
            .map(|name| self.require_column(name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut seen = HashSet::new();
        let before = self.rows.len();
        self.rows.retain(|row| {
            let key = if indices.is_empty() {
                serde_json::to_string(row).unwrap_or_default()
            } else {
                let values: Vec<&Value> = indices.iter().map(|&i| &row[i]).collect();
                serde_json::to_string(&values).unwrap_or_default()
            };
            seen.insert(key)
        });
        Ok(before - self.rows.len())
    }
}

// --- Cell helpers ---

pub fn cell_str(value: &Value) -> Option<&str> {
    value.as_str()
}

/// Renders any cell as text; NULL becomes the empty string.
pub fn cell_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// NULL and whitespace-only strings pass through every masking rule
/// unchanged, so "blank" is a shared notion across the rule set.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Integer view of a cell. Numeric strings are parsed so text columns that
/// store numbers keep working.
pub fn cell_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
