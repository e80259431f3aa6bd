use serde::{Deserialize, Serialize};

/// Closed set of outcome codes reported to the job runner. The runner maps
/// the numeric code against its events table to decide log level and whether
/// the job chain continues.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventCode {
    Success,
    /// Rule strategy says the whole mapping is to be skipped.
    Skipped,
    /// A copy/mask/merge/truncate/dedup primitive failed mid-run.
    ActionFailed,
    SourceMissing,
    TargetMissing,
    SourceKeyMissing,
    UndefinedAction,
    FilterKeyMissing,
    /// Source and filter business keys have different column counts.
    KeyArityMismatch,
}

impl EventCode {
    pub fn as_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Skipped => -1,
            Self::ActionFailed => 1,
            Self::SourceMissing => 2,
            Self::TargetMissing => 3,
            Self::SourceKeyMissing => 5,
            Self::UndefinedAction => 7,
            Self::FilterKeyMissing => 8,
            Self::KeyArityMismatch => 9,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result record of one orchestration phase. `rows_written` is carried even
/// on failure so partial progress stays visible to the job runner.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub event_code: EventCode,
    pub rows_written: u64,
}

impl ExecutionStatus {
    pub fn success(rows_written: u64) -> Self {
        Self {
            event_code: EventCode::Success,
            rows_written,
        }
    }

    pub fn skipped() -> Self {
        Self {
            event_code: EventCode::Skipped,
            rows_written: 0,
        }
    }

    pub fn failed(event_code: EventCode) -> Self {
        Self {
            event_code,
            rows_written: 0,
        }
    }

    pub fn failed_after(event_code: EventCode, rows_written: u64) -> Self {
        Self {
            event_code,
            rows_written,
        }
    }
}
