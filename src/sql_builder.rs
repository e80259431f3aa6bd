// =====================================================
// SQL FRAGMENT BUILDER
// Pure string generation for source selectors and target
// DML. The algorithmic shape of every action is shared;
// dialects only vary quoting, placeholders and casts.
// =====================================================

use crate::db_types::{DatabaseType, DedupCriteria};
use crate::table::TableHandle;

#[cfg(test)]
mod tests;

/// Sentinel error-flag column checked by the MERGE error-capture path.
pub const ERROR_FLAG_COLUMN: &str = "TA_FEHLER";
/// Marker written into the error-flag column for rows with an incomplete
/// primary key.
pub const INCOMPLETE_PK_MARKER: &str = "Primärschlüssel unvollständig";

/// DML action requested for the target side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlAction {
    Insert,
    Mask,
    Upsert,
    UpsertMask,
    Merge,
}

/// Engine-variable surface of the SQL generation. Everything else is shared
/// across the five backends.
pub trait SqlDialect: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn qualified_table(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    fn qualified_column(&self, schema: &str, table: &str, column: &str) -> String {
        format!(
            "{}.{}.{}",
            self.quote_ident(schema),
            self.quote_ident(table),
            self.quote_ident(column)
        )
    }

    /// Bind placeholder for one column at a 1-based position.
    fn placeholder(&self, column: &str, position: usize) -> String;

    /// Projection expression for one column, applying engine-specific casts
    /// for types that cannot be selected plainly.
    fn select_expr(&self, table: &TableHandle, column: &str) -> String {
        self.qualified_column(&table.schema, &table.name, column)
    }

    /// Value expression on the INSERT side, wrapping the placeholder in a
    /// constructor cast where the engine requires one.
    fn insert_expr(&self, table: &TableHandle, column: &str, position: usize) -> String {
        let _ = table;
        self.placeholder(column, position)
    }

    /// Full UPSERT statement for the given column set and value expressions.
    fn upsert_stmt(&self, target: &TableHandle, columns: &[String], values: &[String]) -> String;

    /// Single statement deleting surplus duplicate rows per key group. The
    /// caller re-executes until no rows are affected.
    fn dedup_statement(
        &self,
        schema: &str,
        table: &str,
        criteria: DedupCriteria,
        keys: &[String],
    ) -> Result<String, String>;
}

fn quoted_list(dialect: &dyn SqlDialect, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SELECT fragment projecting the given columns from the source table.
pub fn create_selector(
    columns: &[String],
    source: &TableHandle,
    dialect: &dyn SqlDialect,
) -> String {
    let selection = columns
        .iter()
        .map(|c| dialect.select_expr(source, c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {}",
        selection,
        dialect.qualified_table(&source.schema, &source.name)
    )
}

/// One SELECT-JOIN per positionally paired business key, unioned. Key arity
/// must be validated by the caller before this is invoked.
pub fn create_union_stmt(
    source: &TableHandle,
    filter: &TableHandle,
    source_keys: &[String],
    filter_keys: &[String],
    dialect: &dyn SqlDialect,
) -> String {
    let projection = source
        .columns
        .iter()
        .map(|c| dialect.qualified_column(&source.schema, &source.name, c))
        .collect::<Vec<_>>()
        .join(", ");
    source_keys
        .iter()
        .zip(filter_keys.iter())
        .map(|(src_key, fil_key)| {
            format!(
                "SELECT {} FROM {} JOIN {} ON {} = {}",
                projection,
                dialect.qualified_table(&source.schema, &source.name),
                dialect.qualified_table(&filter.schema, &filter.name),
                dialect.qualified_column(&source.schema, &source.name, src_key),
                dialect.qualified_column(&filter.schema, &filter.name, fil_key),
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ")
}

/// WHERE clause keeping only rows whose target business key is complete.
pub fn filter_invalid_clause(keys: &[String], dialect: &dyn SqlDialect) -> String {
    let conditions = keys
        .iter()
        .map(|k| format!("{} IS NOT NULL", dialect.quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!("WHERE {}", conditions)
}

/// Logical complement of `filter_invalid_clause`, selecting the invalid-row
/// set for diagnostic export.
pub fn error_rows_clause(keys: &[String], dialect: &dyn SqlDialect) -> String {
    let conditions = keys
        .iter()
        .map(|k| format!("{} IS NULL", dialect.quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("WHERE {}", conditions)
}

/// Inner-join fragment against the filter table over positionally paired
/// business keys.
pub fn join_filter_clause(
    source: &TableHandle,
    filter: &TableHandle,
    source_keys: &[String],
    filter_keys: &[String],
    dialect: &dyn SqlDialect,
) -> String {
    let conditions = source_keys
        .iter()
        .zip(filter_keys.iter())
        .map(|(src_key, fil_key)| {
            format!(
                "{} = {}",
                dialect.qualified_column(&source.schema, &source.name, src_key),
                dialect.qualified_column(&filter.schema, &filter.name, fil_key),
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "JOIN {} ON {}",
        dialect.qualified_table(&filter.schema, &filter.name),
        conditions
    )
}

/// Target DML for the given action over the source/target column
/// intersection. `src_filter` is the accumulated source WHERE/JOIN fragment
/// and only feeds the MERGE subselect.
pub fn create_dml(
    columns: &[String],
    source: &TableHandle,
    target: &TableHandle,
    target_key: &[String],
    src_filter: &str,
    action: DmlAction,
    dialect: &dyn SqlDialect,
) -> String {
    match action {
        DmlAction::Insert | DmlAction::Mask => {
            let values = insert_values(columns, target, dialect);
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                dialect.qualified_table(&target.schema, &target.name),
                quoted_list(dialect, columns),
                values.join(", ")
            )
        }
        DmlAction::Upsert | DmlAction::UpsertMask => {
            let values = insert_values(columns, target, dialect);
            dialect.upsert_stmt(target, columns, &values)
        }
        DmlAction::Merge => create_merge(source, target, target_key, src_filter, dialect),
    }
}

fn insert_values(
    columns: &[String],
    target: &TableHandle,
    dialect: &dyn SqlDialect,
) -> Vec<String> {
    columns
        .iter()
        .enumerate()
        .map(|(ix, c)| dialect.insert_expr(target, c, ix + 1))
        .collect()
}

fn create_merge(
    source: &TableHandle,
    target: &TableHandle,
    target_key: &[String],
    src_filter: &str,
    dialect: &dyn SqlDialect,
) -> String {
    let attributes: Vec<&String> = target
        .columns
        .iter()
        .filter(|c| !target_key.contains(c))
        .collect();
    let join = target_key
        .iter()
        .map(|k| format!("src.{0} = tgt.{0}", dialect.quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let update_set = attributes
        .iter()
        .map(|c| format!("tgt.{0} = src.{0}", dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_cols = target
        .columns
        .iter()
        .map(|c| format!("tgt.{}", dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_vals = target
        .columns
        .iter()
        .map(|c| format!("src.{}", dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    // Error-capture path: one extra trailing error-flag column on the target
    // turns the merge into a capture-and-continue statement for rows with an
    // incomplete primary key.
    let source_projection = source
        .columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let capture_errors = target.columns.len() == source.columns.len() + 1
        && target.columns.last().map(|c| c.as_str()) == Some(ERROR_FLAG_COLUMN);
    let subselect = if capture_errors {
        format!(
            "SELECT {}, '{}' AS {} FROM {} {}",
            source_projection,
            INCOMPLETE_PK_MARKER,
            dialect.quote_ident(ERROR_FLAG_COLUMN),
            dialect.qualified_table(&source.schema, &source.name),
            src_filter
        )
    } else {
        format!(
            "SELECT {} FROM {} {}",
            source_projection,
            dialect.qualified_table(&source.schema, &source.name),
            src_filter
        )
    };

    format!(
        "MERGE INTO {} tgt USING ({}) src ON ({}) \
         WHEN MATCHED THEN UPDATE SET {} \
         WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        dialect.qualified_table(&target.schema, &target.name),
        subselect.trim_end(),
        join,
        update_set,
        insert_cols,
        insert_vals
    )
}

// --- Dialects ---

fn row_number_dedup(
    dialect: &dyn SqlDialect,
    schema: &str,
    table: &str,
    criteria: DedupCriteria,
    keys: &[String],
) -> String {
    let partition = quoted_list(dialect, keys);
    let order = match criteria {
        DedupCriteria::Min => "ASC",
        DedupCriteria::Max => "DESC",
    };
    // ROW_NUMBER keeps exactly one row per group in a single pass.
    format!(
        "DELETE FROM (SELECT ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {partition} {order}) AS rn \
         FROM {qualified}) WHERE rn > 1",
        partition = partition,
        order = order,
        qualified = dialect.qualified_table(schema, table),
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

impl SqlDialect for OracleDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Oracle
    }

    fn placeholder(&self, column: &str, _position: usize) -> String {
        format!(":\"{}\"", column)
    }

    fn select_expr(&self, table: &TableHandle, column: &str) -> String {
        let qualified = self.qualified_column(&table.schema, &table.name, column);
        match table
            .column_types
            .get(column)
            .map(|meta| meta.data_type.to_ascii_uppercase())
            .as_deref()
        {
            Some("XMLTYPE") => format!(
                "xmltype.getclobval({}) AS {}",
                qualified,
                self.quote_ident(column)
            ),
            Some("RAW") => format!("RAWTOHEX({}) AS {}", qualified, self.quote_ident(column)),
            _ => qualified,
        }
    }

    fn insert_expr(&self, table: &TableHandle, column: &str, position: usize) -> String {
        let placeholder = self.placeholder(column, position);
        match table
            .column_types
            .get(column)
            .map(|meta| meta.data_type.to_ascii_uppercase())
            .as_deref()
        {
            Some("XMLTYPE") => format!("xmltype.createxml({})", placeholder),
            _ => placeholder,
        }
    }

    fn upsert_stmt(&self, target: &TableHandle, columns: &[String], values: &[String]) -> String {
        merge_upsert(self, target, columns, values, "dual")
    }

    fn dedup_statement(
        &self,
        schema: &str,
        table: &str,
        criteria: DedupCriteria,
        keys: &[String],
    ) -> Result<String, String> {
        let qualified = self.qualified_table(schema, table);
        Ok(format!(
            "DELETE FROM {qualified} WHERE rowid IN \
             (SELECT {criteria}(rowid) FROM {qualified} GROUP BY {keys} HAVING COUNT(*) > 1)",
            qualified = qualified,
            criteria = criteria.as_str(),
            keys = quoted_list(self, keys),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn placeholder(&self, _column: &str, position: usize) -> String {
        format!("${}", position)
    }

    fn upsert_stmt(&self, target: &TableHandle, columns: &[String], values: &[String]) -> String {
        let attributes: Vec<&String> = target
            .columns
            .iter()
            .filter(|c| !target.primary_key.contains(c))
            .collect();
        let update_set = attributes
            .iter()
            .map(|c| format!("{0} = EXCLUDED.{0}", self.quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            self.qualified_table(&target.schema, &target.name),
            quoted_list(self, columns),
            values.join(", "),
            quoted_list(self, &target.primary_key),
            update_set
        )
    }

    fn dedup_statement(
        &self,
        schema: &str,
        table: &str,
        criteria: DedupCriteria,
        keys: &[String],
    ) -> Result<String, String> {
        let qualified = self.qualified_table(schema, table);
        Ok(format!(
            "DELETE FROM {qualified} WHERE ctid IN \
             (SELECT {criteria}(ctid) FROM {qualified} GROUP BY {keys} HAVING COUNT(*) > 1)",
            qualified = qualified,
            criteria = criteria.as_str(),
            keys = quoted_list(self, keys),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HanaDialect;

impl SqlDialect for HanaDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Hana
    }

    fn placeholder(&self, _column: &str, position: usize) -> String {
        format!(":{}", position)
    }

    fn upsert_stmt(&self, target: &TableHandle, columns: &[String], values: &[String]) -> String {
        format!(
            "UPSERT {} ({}) VALUES ({}) WITH PRIMARY KEY",
            self.qualified_table(&target.schema, &target.name),
            quoted_list(self, columns),
            values.join(", ")
        )
    }

    fn dedup_statement(
        &self,
        schema: &str,
        table: &str,
        criteria: DedupCriteria,
        keys: &[String],
    ) -> Result<String, String> {
        Ok(row_number_dedup(self, schema, table, criteria, keys))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Db2Dialect;

impl SqlDialect for Db2Dialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Db2
    }

    fn placeholder(&self, _column: &str, _position: usize) -> String {
        "?".to_string()
    }

    fn upsert_stmt(&self, target: &TableHandle, columns: &[String], values: &[String]) -> String {
        merge_upsert(self, target, columns, values, "SYSIBM.SYSDUMMY1")
    }

    fn dedup_statement(
        &self,
        schema: &str,
        table: &str,
        criteria: DedupCriteria,
        keys: &[String],
    ) -> Result<String, String> {
        Ok(row_number_dedup(self, schema, table, criteria, keys))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetezzaDialect;

impl SqlDialect for NetezzaDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Netezza
    }

    fn placeholder(&self, _column: &str, _position: usize) -> String {
        "?".to_string()
    }

    fn upsert_stmt(&self, target: &TableHandle, columns: &[String], values: &[String]) -> String {
        merge_upsert(self, target, columns, values, "(SELECT 1) one")
    }

    fn dedup_statement(
        &self,
        schema: &str,
        table: &str,
        criteria: DedupCriteria,
        keys: &[String],
    ) -> Result<String, String> {
        Ok(row_number_dedup(self, schema, table, criteria, keys))
    }
}

/// MERGE-shaped row upsert for engines without a dedicated conflict clause.
/// Each bound row arrives through the single-row subselect.
fn merge_upsert(
    dialect: &dyn SqlDialect,
    target: &TableHandle,
    columns: &[String],
    values: &[String],
    dummy_table: &str,
) -> String {
    let aliased = columns
        .iter()
        .zip(values.iter())
        .map(|(c, v)| format!("{} AS {}", v, dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let join = target
        .primary_key
        .iter()
        .map(|k| format!("src.{0} = tgt.{0}", dialect.quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let attributes: Vec<&String> = columns
        .iter()
        .filter(|c| !target.primary_key.contains(c))
        .collect();
    let update_set = attributes
        .iter()
        .map(|c| format!("tgt.{0} = src.{0}", dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_cols = quoted_list(dialect, columns);
    let insert_vals = columns
        .iter()
        .map(|c| format!("src.{}", dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "MERGE INTO {} tgt USING (SELECT {} FROM {}) src ON ({}) \
         WHEN MATCHED THEN UPDATE SET {} \
         WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        dialect.qualified_table(&target.schema, &target.name),
        aliased,
        dummy_table,
        join,
        update_set,
        insert_cols,
        insert_vals
    )
}

/// Dialect lookup for the closed engine set.
pub fn dialect_for(db_type: DatabaseType) -> Box<dyn SqlDialect> {
    match db_type {
        DatabaseType::Oracle => Box::new(OracleDialect),
        DatabaseType::Postgres => Box::new(PostgresDialect),
        DatabaseType::Hana => Box::new(HanaDialect),
        DatabaseType::Db2 => Box::new(Db2Dialect),
        DatabaseType::Netezza => Box::new(NetezzaDialect),
    }
}
