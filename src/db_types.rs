// =====================================================
// COMMON DATABASE TYPES AND STRUCTURES
// =====================================================

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

// --- Database Type Enum ---
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatabaseType {
    Oracle,
    Db2,
    Hana,
    Postgres,
    Netezza,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oracle => "ORACLE",
            Self::Db2 => "DB2",
            Self::Hana => "HANA",
            Self::Postgres => "POSTGRES",
            Self::Netezza => "NETEZZA",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ORACLE" => Ok(Self::Oracle),
            "DB2" => Ok(Self::Db2),
            "HANA" => Ok(Self::Hana),
            "POSTGRES" => Ok(Self::Postgres),
            "NETEZZA" => Ok(Self::Netezza),
            other => Err(format!("Unknown database type in mapping: {}", other)),
        }
    }
}

// --- Column Metadata ---
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ColumnMeta {
    pub data_type: String,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    pub length: Option<i32>,
    pub is_nullable: bool,
}

impl ColumnMeta {
    /// Large-object columns break the row-size estimate, so the transfer
    /// loop falls back to a small fixed chunk when any is present.
    pub fn is_lob(&self) -> bool {
        matches!(
            self.data_type.to_ascii_uppercase().as_str(),
            "XMLTYPE" | "XML" | "CLOB" | "NCLOB" | "BLOB" | "LONG RAW"
        )
    }
}

// --- Deduplication Criteria ---
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DedupCriteria {
    Min,
    Max,
}

impl DedupCriteria {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}
