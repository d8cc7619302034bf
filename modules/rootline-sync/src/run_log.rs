//! Operation run log: a persisted JSON timeline of one long-running operation.
//!
//! Each operation produces `{log_dir}/{kind}/{operation_id}.json` holding the
//! ordered events with timestamps and the final counts.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use rootline_common::{OperationKind, OperationState, ProgressCounts};

pub struct OperationLog {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
    events: Vec<LogEvent>,
    seq: u32,
}

#[derive(Serialize)]
struct LogEvent {
    seq: u32,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        state: OperationState,
    },
    PersonScraped {
        external_id: String,
        generation: u32,
        canonical_id: Uuid,
    },
    PersonFailed {
        external_id: String,
        generation: u32,
        error: String,
    },
    CircuitBreaker {
        consecutive_failures: u32,
    },
    HintReviewed {
        hint_id: Uuid,
        external_id: String,
        disposition: String,
        confidence: Option<f64>,
    },
    Aborted {
        error: String,
        reauth_required: bool,
    },
}

#[derive(Serialize)]
struct SerializedLog<'a> {
    operation_id: Uuid,
    kind: OperationKind,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    final_state: OperationState,
    counts: ProgressCounts,
    events: &'a [LogEvent],
}

impl OperationLog {
    pub fn new(operation_id: Uuid, kind: OperationKind) -> Self {
        Self {
            operation_id,
            kind,
            started_at: Utc::now(),
            events: Vec::new(),
            seq: 0,
        }
    }

    pub fn log(&mut self, kind: EventKind) {
        self.events.push(LogEvent {
            seq: self.seq,
            ts: Utc::now(),
            kind,
        });
        self.seq += 1;
    }

    pub fn save(
        &self,
        log_dir: &Path,
        final_state: OperationState,
        counts: ProgressCounts,
    ) -> Result<PathBuf> {
        let dir = log_dir.join(self.kind.as_str());
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.operation_id));
        let output = SerializedLog {
            operation_id: self.operation_id,
            kind: self.kind,
            started_at: self.started_at,
            finished_at: Utc::now(),
            final_state,
            counts,
            events: &self.events,
        };

        std::fs::write(&path, serde_json::to_string_pretty(&output)?)?;
        info!(path = %path.display(), events = self.events.len(), "Operation log saved");

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_writes_timeline_under_kind_directory() {
        let dir = std::env::temp_dir().join(format!("rootline-log-{}", Uuid::new_v4()));
        let id = Uuid::new_v4();
        let mut log = OperationLog::new(id, OperationKind::AncestorCrawl);
        log.log(EventKind::StateChanged {
            state: OperationState::Running,
        });
        log.log(EventKind::PersonFailed {
            external_id: "KWCJ-4XD".into(),
            generation: 1,
            error: "selector missing".into(),
        });

        let counts = ProgressCounts {
            current: 1,
            total: 3,
            processed: 0,
            skipped: 0,
            errors: 1,
        };
        let path = log.save(&dir, OperationState::Completed, counts).unwrap();
        assert_eq!(path, dir.join("ancestor_crawl").join(format!("{id}.json")));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["final_state"], "completed");
        assert_eq!(json["events"][1]["type"], "person_failed");
        assert_eq!(json["events"][1]["seq"], 1);
        assert_eq!(json["counts"]["errors"], 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
