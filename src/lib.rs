// =====================================================
// H.A.S.I. MAPPING ENGINE
// Metadata-driven table-to-table copy and masking jobs
// across Oracle, DB2, HANA, PostgreSQL and Netezza.
// =====================================================

pub mod db_types;
pub mod engine;
pub mod frame;
pub mod mapping;
pub mod masking;
pub mod repository;
pub mod sql_builder;
pub mod status;
pub mod table;
pub mod transfer;

pub use db_types::{DatabaseType, DedupCriteria};
pub use frame::Frame;
pub use mapping::{run_job, JobContext};
pub use masking::DuplicatePolicy;
pub use repository::{MetaRepository, PgMetaRepository};
pub use status::{EventCode, ExecutionStatus};
pub use table::{DbEngine, EngineRegistry, TableHandle};
