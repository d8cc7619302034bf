//! Single-operation lifecycle: start, progress, cooperative cancellation.
//!
//! At most one non-terminal operation exists per registry. Each started
//! operation runs on its own task and reports through a bounded channel;
//! dropping the returned stream does not stop the operation.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rootline_common::{
    Operation, OperationKind, OperationState, ProgressCounts, ProgressEvent, ProgressEventType,
    RootlineError, SyncSettings,
};

use crate::crawler::{full_tree_size, AncestorCrawler, CrawlStep};
use crate::hints::{HintDisposition, HintOutcome, HintProcessor};
use crate::providers::ProviderScraper;
use crate::run_log::{EventKind, OperationLog};

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// A freshly started operation and its progress sequence.
pub struct StartedOperation {
    pub operation_id: Uuid,
    pub events: ProgressStream,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ActiveOperation {
    operation: Operation,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct RegistryState {
    active: Option<ActiveOperation>,
    last_finished: Option<Operation>,
}

#[derive(Default)]
pub struct OperationRegistry {
    state: Mutex<RegistryState>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the single operation slot. Rejected, not queued, while another
    /// operation is non-terminal.
    pub fn try_begin(self: &Arc<Self>, kind: OperationKind) -> Result<OperationHandle, RootlineError> {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            if !active.operation.state.is_terminal() {
                return Err(RootlineError::OperationInProgress(active.operation.id));
            }
        }

        let operation = Operation {
            id: Uuid::now_v7(),
            kind,
            state: OperationState::Started,
            counts: ProgressCounts::default(),
            started_at: Utc::now(),
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = OperationHandle {
            registry: Arc::clone(self),
            id: operation.id,
            kind,
            cancel: Arc::clone(&cancel),
        };
        info!(operation_id = %operation.id, kind = %kind, "Operation started");
        state.active = Some(ActiveOperation { operation, cancel });
        Ok(handle)
    }

    /// Flag the operation for cancellation. It stops after its in-flight unit.
    pub fn request_cancel(&self, operation_id: Uuid) -> bool {
        let state = self.lock();
        match &state.active {
            Some(active)
                if active.operation.id == operation_id && !active.operation.state.is_terminal() =>
            {
                active.cancel.store(true, Ordering::SeqCst);
                info!(operation_id = %operation_id, "Cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(|a| !a.operation.state.is_terminal())
    }

    pub fn active_operation_id(&self) -> Option<Uuid> {
        self.lock()
            .active
            .as_ref()
            .filter(|a| !a.operation.state.is_terminal())
            .map(|a| a.operation.id)
    }

    /// The active operation, else the most recently finished one.
    pub fn snapshot(&self) -> Option<Operation> {
        let state = self.lock();
        state
            .active
            .as_ref()
            .map(|a| a.operation.clone())
            .or_else(|| state.last_finished.clone())
    }
}

/// Owned by the task running an operation. Releases the slot when finished
/// or dropped.
pub struct OperationHandle {
    registry: Arc<OperationRegistry>,
    id: Uuid,
    kind: OperationKind,
    cancel: Arc<AtomicBool>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn transition(&self, next: OperationState) {
        let mut state = self.registry.lock();
        let Some(active) = state.active.as_mut().filter(|a| a.operation.id == self.id) else {
            return;
        };
        if active.operation.state == next {
            return;
        }
        if active.operation.state.can_transition_to(next) {
            debug!(operation_id = %self.id, from = ?active.operation.state, to = ?next, "Operation state");
            active.operation.state = next;
        } else {
            warn!(operation_id = %self.id, from = ?active.operation.state, to = ?next, "Ignoring invalid transition");
        }
    }

    pub fn update_counts(&self, counts: ProgressCounts) {
        let mut state = self.registry.lock();
        if let Some(active) = state.active.as_mut().filter(|a| a.operation.id == self.id) {
            active.operation.counts = counts;
        }
    }

    /// Move to a terminal state and free the slot for the next operation.
    pub fn finish(&self, terminal: OperationState, counts: ProgressCounts) {
        self.release(terminal, Some(counts));
    }

    fn release(&self, terminal: OperationState, counts: Option<ProgressCounts>) {
        let mut state = self.registry.lock();
        if !state.active.as_ref().is_some_and(|a| a.operation.id == self.id) {
            return;
        }
        if let Some(mut active) = state.active.take() {
            if !active.operation.state.is_terminal() {
                active.operation.state = terminal;
            }
            if let Some(counts) = counts {
                active.operation.counts = counts;
            }
            info!(
                operation_id = %self.id,
                state = ?active.operation.state,
                processed = active.operation.counts.processed,
                errors = active.operation.counts.errors,
                "Operation finished"
            );
            state.last_finished = Some(active.operation);
        }
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        self.release(OperationState::Error, None);
    }
}

// ---------------------------------------------------------------------------
// Units of work
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Processed,
    Skipped,
    Failed,
    /// Ends the operation in `Error` without counting as a unit.
    Halted,
}

struct Unit {
    outcome: UnitOutcome,
    message: String,
    log: EventKind,
}

impl From<CrawlStep> for Unit {
    fn from(step: CrawlStep) -> Self {
        match step {
            CrawlStep::Scraped {
                generation,
                canonical_id,
                record,
            } => Unit {
                outcome: UnitOutcome::Processed,
                message: format!("scraped {} ({})", record.external_id, record.display_name()),
                log: EventKind::PersonScraped {
                    external_id: record.external_id,
                    generation,
                    canonical_id,
                },
            },
            CrawlStep::Failed {
                generation,
                external_id,
                error,
            } => Unit {
                outcome: UnitOutcome::Failed,
                message: format!("failed {external_id}: {error}"),
                log: EventKind::PersonFailed {
                    external_id,
                    generation,
                    error,
                },
            },
            CrawlStep::Halted {
                consecutive_failures,
            } => Unit {
                outcome: UnitOutcome::Halted,
                message: format!(
                    "halted after {consecutive_failures} consecutive extraction failures"
                ),
                log: EventKind::CircuitBreaker {
                    consecutive_failures,
                },
            },
        }
    }
}

impl From<HintOutcome> for Unit {
    fn from(outcome: HintOutcome) -> Self {
        let (unit_outcome, verb) = match outcome.disposition {
            HintDisposition::Accepted => (UnitOutcome::Processed, "accepted"),
            HintDisposition::NeedsReview => (UnitOutcome::Skipped, "needs review"),
            HintDisposition::Conflict => (UnitOutcome::Failed, "conflict"),
            HintDisposition::Failed => (UnitOutcome::Failed, "failed"),
        };
        let mut message = format!("hint {} {verb}", outcome.external_id);
        if let Some(detail) = &outcome.message {
            message.push_str(": ");
            message.push_str(detail);
        }
        Unit {
            outcome: unit_outcome,
            message,
            log: EventKind::HintReviewed {
                hint_id: outcome.hint_id,
                external_id: outcome.external_id,
                disposition: verb.to_string(),
                confidence: outcome.confidence,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct OperationController {
    registry: Arc<OperationRegistry>,
    crawler: AncestorCrawler,
    hints: HintProcessor,
    settings: SyncSettings,
}

impl OperationController {
    pub fn new(
        registry: Arc<OperationRegistry>,
        crawler: AncestorCrawler,
        hints: HintProcessor,
        settings: SyncSettings,
    ) -> Self {
        Self {
            registry,
            crawler,
            hints,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    pub fn active_operation_id(&self) -> Option<Uuid> {
        self.registry.active_operation_id()
    }

    pub fn request_cancel(&self, operation_id: Uuid) -> bool {
        self.registry.request_cancel(operation_id)
    }

    pub fn start_ancestor_crawl(
        &self,
        scraper: Arc<dyn ProviderScraper>,
        root_external_id: &str,
        max_generations: Option<u32>,
    ) -> Result<StartedOperation, RootlineError> {
        let root = root_external_id.trim();
        if root.is_empty() {
            return Err(RootlineError::Validation("root external id is empty".into()));
        }
        let max_generations = max_generations.unwrap_or(self.settings.max_generations);
        let handle = self.registry.try_begin(OperationKind::AncestorCrawl)?;

        info!(
            operation_id = %handle.id(),
            provider = %scraper.provider(),
            root,
            max_generations,
            "Starting ancestor crawl"
        );
        let units = self
            .crawler
            .crawl_ancestors(scraper, root, max_generations)
            .map(|step| step.map(Unit::from));

        Ok(self.spawn(handle, units, full_tree_size(max_generations)))
    }

    /// Review up to `limit` pending hints for the scraper's provider.
    pub async fn start_hint_processing(
        &self,
        scraper: Arc<dyn ProviderScraper>,
        limit: usize,
    ) -> Result<StartedOperation, RootlineError> {
        let handle = self.registry.try_begin(OperationKind::HintProcessing)?;
        let hints = match self.hints.pending(Some(scraper.provider()), limit).await {
            Ok(hints) => hints,
            Err(e) => {
                handle.finish(OperationState::Error, ProgressCounts::default());
                return Err(e);
            }
        };

        info!(
            operation_id = %handle.id(),
            provider = %scraper.provider(),
            hints = hints.len(),
            "Starting hint processing"
        );
        let total = hints.len() as u64;
        let units = self
            .hints
            .process_hints(scraper, hints)
            .map(|outcome| outcome.map(Unit::from));

        Ok(self.spawn(handle, units, total))
    }

    fn spawn<S>(&self, handle: OperationHandle, units: S, total: u64) -> StartedOperation
    where
        S: Stream<Item = Result<Unit, RootlineError>> + Send + 'static,
    {
        let operation_id = handle.id();
        let (tx, rx) = mpsc::channel(self.settings.progress_buffer.max(1));
        let log_dir = self.settings.log_dir.clone();

        tokio::spawn(drive(handle, units, total, tx, log_dir));

        let events = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        StartedOperation {
            operation_id,
            events: Box::pin(events),
        }
    }
}

async fn emit(tx: &mpsc::Sender<ProgressEvent>, log: &mut OperationLog, event: ProgressEvent) {
    if event.event_type == ProgressEventType::Cancelling {
        log.log(EventKind::StateChanged {
            state: OperationState::Cancelling,
        });
    }
    // A closed receiver means nobody is watching; the operation carries on.
    let _ = tx.send(event).await;
}

async fn drive<S>(
    handle: OperationHandle,
    units: S,
    total: u64,
    tx: mpsc::Sender<ProgressEvent>,
    log_dir: Option<PathBuf>,
) where
    S: Stream<Item = Result<Unit, RootlineError>> + Send + 'static,
{
    let id = handle.id();
    let mut log = OperationLog::new(id, handle.kind());
    let mut counts = ProgressCounts {
        total,
        ..ProgressCounts::default()
    };
    let event = |kind: ProgressEventType, counts: ProgressCounts| ProgressEvent::new(kind, id, counts);

    log.log(EventKind::StateChanged {
        state: OperationState::Started,
    });
    emit(&tx, &mut log, event(ProgressEventType::Started, counts)).await;
    handle.transition(OperationState::Running);

    tokio::pin!(units);

    let (terminal_state, terminal_event) = loop {
        if handle.is_cancel_requested() {
            handle.transition(OperationState::Cancelling);
            emit(&tx, &mut log, event(ProgressEventType::Cancelling, counts)).await;
            info!(operation_id = %id, processed = counts.processed, "Operation cancelled");
            let message = format!(
                "cancelled after {} processed, {} skipped, {} errors",
                counts.processed, counts.skipped, counts.errors
            );
            break (
                OperationState::Cancelled,
                event(ProgressEventType::Cancelled, counts).with_message(message),
            );
        }

        match units.next().await {
            None => {
                break (
                    OperationState::Completed,
                    event(ProgressEventType::Completed, counts).with_message(format!(
                        "{} processed, {} skipped, {} errors",
                        counts.processed, counts.skipped, counts.errors
                    )),
                );
            }
            Some(Ok(unit)) => {
                log.log(unit.log);
                match unit.outcome {
                    UnitOutcome::Halted => {
                        error!(operation_id = %id, message = %unit.message, "Operation halted");
                        break (
                            OperationState::Error,
                            event(ProgressEventType::Error, counts).with_message(unit.message),
                        );
                    }
                    UnitOutcome::Processed => counts.processed += 1,
                    UnitOutcome::Skipped => counts.skipped += 1,
                    UnitOutcome::Failed => counts.errors += 1,
                }
                counts.current += 1;
                counts.total = counts.total.max(counts.current);
                handle.update_counts(counts);
                emit(
                    &tx,
                    &mut log,
                    event(ProgressEventType::Progress, counts).with_message(unit.message),
                )
                .await;
            }
            Some(Err(e)) => {
                error!(operation_id = %id, error = %e, "Operation aborted");
                log.log(EventKind::Aborted {
                    error: e.to_string(),
                    reauth_required: e.needs_reauth(),
                });
                let mut terminal = event(ProgressEventType::Error, counts).with_message(e.to_string());
                if e.needs_reauth() {
                    terminal = terminal.requiring_reauth();
                }
                break (OperationState::Error, terminal);
            }
        }
    };

    log.log(EventKind::StateChanged {
        state: terminal_state,
    });
    if let Some(dir) = &log_dir {
        if let Err(e) = log.save(dir, terminal_state, counts) {
            warn!(operation_id = %id, error = %e, "Failed to save operation log");
        }
    }

    handle.finish(terminal_state, counts);
    emit(&tx, &mut log, terminal_event).await;
}
