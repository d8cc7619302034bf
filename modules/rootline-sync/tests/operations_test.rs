//! Operation lifecycle: single active operation, progress sequence,
//! cooperative cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use rootline_common::{
    Hint, OperationState, ProgressEvent, ProgressEventType, Provider, RootlineError,
};
use rootline_store::{FamilyStore, MemoryStore};
use rootline_sync::operations::{OperationController, OperationRegistry, StartedOperation};
use rootline_sync::testing::{test_deps, MockCredentials, MockFailure, MockScraper};

fn controller(store: &Arc<MemoryStore>) -> (OperationController, Arc<OperationRegistry>) {
    let registry = Arc::new(OperationRegistry::new());
    let controller = test_deps(store.clone(), MockCredentials::new()).controller(registry.clone());
    (controller, registry)
}

fn family() -> MockScraper {
    MockScraper::new(Provider::MyHeritage)
        .with_person("A", "Alice Root", Some("B"), Some("C"))
        .with_person("B", "Bob Root", Some("D"), Some("E"))
        .with_person("C", "Carol Vine", Some("F"), Some("G"))
        .with_person("D", "Dan Root", None, None)
        .with_person("E", "Eve Ash", None, None)
        .with_person("F", "Frank Vine", None, None)
        .with_person("G", "Grace Oak", None, None)
}

async fn drain(started: StartedOperation) -> Vec<ProgressEvent> {
    started.events.collect().await
}

fn types(events: &[ProgressEvent]) -> Vec<ProgressEventType> {
    events.iter().map(|e| e.event_type).collect()
}

#[tokio::test]
async fn crawl_emits_started_progress_and_completed() {
    let store = Arc::new(MemoryStore::new());
    let (controller, registry) = controller(&store);

    let started = controller
        .start_ancestor_crawl(Arc::new(family()), "A", Some(1))
        .unwrap();
    let id = started.operation_id;
    let events = drain(started).await;

    assert_eq!(
        types(&events),
        vec![
            ProgressEventType::Started,
            ProgressEventType::Progress,
            ProgressEventType::Progress,
            ProgressEventType::Progress,
            ProgressEventType::Completed,
        ]
    );
    assert!(events.iter().all(|e| e.operation_id == id));

    let last = events.last().unwrap();
    assert_eq!((last.current, last.total, last.processed), (3, 3, 3));
    assert_eq!(last.errors, 0);

    assert!(!registry.is_running());
    let finished = registry.snapshot().unwrap();
    assert_eq!(finished.id, id);
    assert_eq!(finished.state, OperationState::Completed);
}

#[tokio::test]
async fn total_reports_the_full_tree_size() {
    let store = Arc::new(MemoryStore::new());
    let (controller, _) = controller(&store);

    let started = controller
        .start_ancestor_crawl(Arc::new(family()), "A", Some(3))
        .unwrap();
    let events = drain(started).await;

    assert_eq!(events[0].total, 15);
    let last = events.last().unwrap();
    assert_eq!(last.event_type, ProgressEventType::Completed);
    assert_eq!(last.processed, 7);
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let store = Arc::new(MemoryStore::new());
    let (controller, registry) = controller(&store);
    let slow = Arc::new(family().with_delay(Duration::from_millis(50)));

    let first = controller.start_ancestor_crawl(slow.clone(), "A", Some(2)).unwrap();
    assert!(controller.is_running());
    assert_eq!(controller.active_operation_id(), Some(first.operation_id));

    let err = controller
        .start_ancestor_crawl(slow.clone(), "A", Some(2))
        .err()
        .unwrap();
    assert!(matches!(err, RootlineError::OperationInProgress(id) if id == first.operation_id));

    drain(first).await;
    assert!(!registry.is_running());

    // Terminal states free the slot.
    let again = controller.start_ancestor_crawl(slow, "A", Some(0)).unwrap();
    let events = drain(again).await;
    assert_eq!(events.last().unwrap().event_type, ProgressEventType::Completed);
}

#[tokio::test]
async fn cancellation_stops_after_the_in_flight_unit() {
    let store = Arc::new(MemoryStore::new());
    let (controller, registry) = controller(&store);
    let slow = Arc::new(family().with_delay(Duration::from_millis(40)));

    let started = controller.start_ancestor_crawl(slow.clone(), "A", Some(2)).unwrap();
    let id = started.operation_id;
    let mut events = started.events;

    // Wait for the first unit, then cancel.
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let progress = event.event_type == ProgressEventType::Progress;
        seen.push(event);
        if progress {
            break;
        }
    }
    assert!(controller.request_cancel(id));
    assert!(!controller.request_cancel(uuid::Uuid::new_v4()));
    seen.extend(events.collect::<Vec<_>>().await);

    let kinds = types(&seen);
    assert_eq!(kinds[kinds.len() - 2], ProgressEventType::Cancelling);
    assert_eq!(kinds[kinds.len() - 1], ProgressEventType::Cancelled);

    let terminal = seen.last().unwrap();
    assert!(terminal.processed < 7);
    assert_eq!(terminal.total, 7);
    assert_eq!(terminal.processed as usize, slow.scrape_calls().len());

    assert_eq!(registry.snapshot().unwrap().state, OperationState::Cancelled);
    assert!(!registry.is_running());
}

#[tokio::test]
async fn breaker_halt_ends_in_error_with_counts() {
    let store = Arc::new(MemoryStore::new());
    let (controller, _) = controller(&store);
    let scraper = MockScraper::new(Provider::Geni)
        .with_person("A", "Alice Root", Some("B"), Some("C"))
        .with_person("B", "Bob Root", Some("D"), Some("E"))
        .with_failure("C", MockFailure::Extraction);

    let started = controller
        .start_ancestor_crawl(Arc::new(scraper), "A", Some(3))
        .unwrap();
    let events = drain(started).await;

    let last = events.last().unwrap();
    assert_eq!(last.event_type, ProgressEventType::Error);
    assert_eq!((last.processed, last.errors), (2, 3));
    assert!(last.message.as_deref().unwrap().contains("3 consecutive"));
    assert!(!last.reauth_required);
}

#[tokio::test]
async fn authentication_failure_requires_reauth() {
    let store = Arc::new(MemoryStore::new());
    let (controller, registry) = controller(&store);
    let scraper = family().with_failure("B", MockFailure::Authentication);

    let started = controller
        .start_ancestor_crawl(Arc::new(scraper), "A", Some(2))
        .unwrap();
    let events = drain(started).await;

    let last = events.last().unwrap();
    assert_eq!(last.event_type, ProgressEventType::Error);
    assert!(last.reauth_required);
    assert_eq!(last.processed, 1);
    assert_eq!(registry.snapshot().unwrap().state, OperationState::Error);
}

#[tokio::test]
async fn dropping_the_stream_does_not_cancel() {
    let store = Arc::new(MemoryStore::new());
    let (controller, registry) = controller(&store);

    let started = controller
        .start_ancestor_crawl(Arc::new(family()), "A", Some(2))
        .unwrap();
    drop(started);

    for _ in 0..100 {
        if !registry.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.snapshot().unwrap().state, OperationState::Completed);
    assert_eq!(store.person_count(), 7);
}

#[tokio::test]
async fn empty_root_is_rejected_without_claiming_the_slot() {
    let store = Arc::new(MemoryStore::new());
    let (controller, registry) = controller(&store);

    let err = controller
        .start_ancestor_crawl(Arc::new(family()), "  ", None)
        .err()
        .unwrap();
    assert!(matches!(err, RootlineError::Validation(_)));
    assert!(registry.snapshot().is_none());
}

#[tokio::test]
async fn hint_processing_counts_reviews_as_skipped() {
    let store = Arc::new(MemoryStore::new());
    let (controller, _) = controller(&store);
    let identity = test_deps(store.clone(), MockCredentials::new()).identity();

    let person = identity
        .get_or_create_canonical_id(Provider::FamilySearch, "KWCJ-4XD", "Alice Root", Default::default())
        .await
        .unwrap();
    // Same name, no known parents: name match only, below threshold.
    store
        .add_hint(&Hint::new(person, Provider::MyHeritage, "A", Some("Alice Root")))
        .await
        .unwrap();
    store
        .add_hint(&Hint::new(person, Provider::MyHeritage, "missing", None))
        .await
        .unwrap();

    let started = controller
        .start_hint_processing(Arc::new(family()), 10)
        .await
        .unwrap();
    let events = drain(started).await;

    let last = events.last().unwrap();
    assert_eq!(last.event_type, ProgressEventType::Completed);
    assert_eq!((last.total, last.skipped, last.errors), (2, 1, 1));
}
