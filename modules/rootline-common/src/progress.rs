//! Long-running operation state and the progress records streamed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    AncestorCrawl,
    HintProcessing,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::AncestorCrawl => "ancestor_crawl",
            OperationKind::HintProcessing => "hint_processing",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Started,
    Running,
    Cancelling,
    Completed,
    Cancelled,
    Error,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Error
        )
    }

    /// Allowed forward moves. Terminal states are final.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            (Idle, Started) => true,
            (Started, Running | Cancelling | Completed | Cancelled | Error) => true,
            (Running, Running | Cancelling | Completed | Cancelled | Error) => true,
            (Cancelling, Cancelled | Completed | Error) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub current: u64,
    pub total: u64,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Status view of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub state: OperationState,
    pub counts: ProgressCounts,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    Started,
    Progress,
    Cancelling,
    Completed,
    Cancelled,
    Error,
}

impl ProgressEventType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEventType::Completed | ProgressEventType::Cancelled | ProgressEventType::Error
        )
    }
}

/// One record of the progress sequence. Shaped for a push transport (SSE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub operation_id: Uuid,
    pub current: u64,
    pub total: u64,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub message: Option<String>,
    /// Set on terminal errors caused by an expired or rejected provider session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reauth_required: bool,
}

impl ProgressEvent {
    pub fn new(event_type: ProgressEventType, operation_id: Uuid, counts: ProgressCounts) -> Self {
        Self {
            event_type,
            operation_id,
            current: counts.current,
            total: counts.total,
            processed: counts.processed,
            skipped: counts.skipped,
            errors: counts.errors,
            message: None,
            reauth_required: false,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn requiring_reauth(mut self) -> Self {
        self.reauth_required = true;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
