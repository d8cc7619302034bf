//! Hint review: scoring, auto-linking and conflict surfacing.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use rootline_common::{
    Hint, HintStatus, IdentityMeta, ParentEdge, ParentRole, PersonAttrs, Provider,
};
use rootline_store::{FamilyStore, MemoryStore};
use rootline_sync::hints::{HintDisposition, HintOutcome, HintProcessor};
use rootline_sync::identity::IdentityResolver;
use rootline_sync::testing::{test_deps, MockCredentials, MockScraper};

struct Fixture {
    store: Arc<MemoryStore>,
    identity: Arc<IdentityResolver>,
    processor: HintProcessor,
    /// Alice Root on FamilySearch, with her father linked.
    alice: Uuid,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let deps = test_deps(store.clone(), MockCredentials::new());
    let identity = deps.identity();
    let processor = deps.workers().1;

    let attrs = PersonAttrs::default;
    let alice = identity
        .get_or_create_canonical_id(Provider::FamilySearch, "F-A", "Alice Root", attrs())
        .await
        .unwrap();
    let bob = identity
        .get_or_create_canonical_id(Provider::FamilySearch, "F-B", "Bob Root", attrs())
        .await
        .unwrap();
    store
        .add_parent_edge(&ParentEdge {
            child_id: alice,
            parent_id: bob,
            role: ParentRole::Father,
            source: Some(Provider::FamilySearch),
            confidence: 1.0,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    // Bob is already known on MyHeritage.
    identity
        .register_external_id(bob, Provider::MyHeritage, "MH-B", IdentityMeta::default())
        .await
        .unwrap();

    Fixture {
        store,
        identity,
        processor,
        alice,
    }
}

async fn hint(f: &Fixture, external_id: &str) -> Hint {
    f.store
        .add_hint(&Hint::new(f.alice, Provider::MyHeritage, external_id, None))
        .await
        .unwrap()
}

async fn process(f: &Fixture, scraper: MockScraper) -> Vec<HintOutcome> {
    let pending = f.processor.pending(Some(Provider::MyHeritage), 10).await.unwrap();
    f.processor
        .process_hints(Arc::new(scraper), pending)
        .map(|r| r.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn structural_and_name_match_is_accepted() {
    let f = fixture().await;
    let h = hint(&f, "MH-A").await;
    let scraper = MockScraper::new(Provider::MyHeritage)
        .with_person("MH-A", "Alice  ROOT", Some("MH-B"), None);

    let outcomes = process(&f, scraper).await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].disposition, HintDisposition::Accepted);
    assert_eq!(outcomes[0].confidence, Some(1.0));
    assert_eq!(
        f.identity.resolve_id("MH-A", Provider::MyHeritage).await.unwrap(),
        Some(f.alice)
    );
    assert_eq!(f.store.record_count(f.alice), 1);

    let stored = f.store.hint(h.id).unwrap();
    assert_eq!(stored.status, HintStatus::Accepted);
    assert!(f.processor.pending(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn structural_match_alone_needs_review() {
    let f = fixture().await;
    let h = hint(&f, "MH-A").await;
    let scraper = MockScraper::new(Provider::MyHeritage)
        .with_person("MH-A", "Alicia Roote", Some("MH-B"), None);

    let outcomes = process(&f, scraper).await;

    assert_eq!(outcomes[0].disposition, HintDisposition::NeedsReview);
    assert_eq!(outcomes[0].confidence, Some(0.7));
    assert_eq!(f.store.hint(h.id).unwrap().status, HintStatus::NeedsReview);
    assert_eq!(f.identity.resolve_id("MH-A", Provider::MyHeritage).await.unwrap(), None);
}

#[tokio::test]
async fn contradicting_parent_rules_out_structural_match() {
    let f = fixture().await;
    hint(&f, "MH-A").await;
    f.identity
        .get_or_create_canonical_id(Provider::MyHeritage, "MH-X", "Xavier Stone", PersonAttrs::default())
        .await
        .unwrap();
    let scraper = MockScraper::new(Provider::MyHeritage)
        .with_person("MH-A", "Alice Root", Some("MH-X"), None);

    let outcomes = process(&f, scraper).await;

    assert_eq!(outcomes[0].disposition, HintDisposition::NeedsReview);
    assert!((outcomes[0].confidence.unwrap() - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn identity_bound_elsewhere_is_surfaced_not_overwritten() {
    let f = fixture().await;
    let h = hint(&f, "MH-A").await;
    let someone_else = f
        .identity
        .get_or_create_canonical_id(Provider::MyHeritage, "MH-A", "Alice Root", PersonAttrs::default())
        .await
        .unwrap();
    let scraper = MockScraper::new(Provider::MyHeritage)
        .with_person("MH-A", "Alice Root", Some("MH-B"), None);

    let outcomes = process(&f, scraper).await;

    assert_eq!(outcomes[0].disposition, HintDisposition::Conflict);
    assert!(outcomes[0].message.as_deref().unwrap().contains("Identity conflict"));
    assert_eq!(
        f.identity.resolve_id("MH-A", Provider::MyHeritage).await.unwrap(),
        Some(someone_else)
    );
    let stored = f.store.hint(h.id).unwrap();
    assert_eq!(stored.status, HintStatus::NeedsReview);
    assert!(stored.message.is_some());
}

#[tokio::test]
async fn unreachable_candidate_is_recorded_as_failed() {
    let f = fixture().await;
    let h = hint(&f, "MH-GONE").await;

    let outcomes = process(&f, MockScraper::new(Provider::MyHeritage)).await;

    assert_eq!(outcomes[0].disposition, HintDisposition::Failed);
    // Left pending for a later run.
    assert_eq!(f.store.hint(h.id).unwrap().status, HintStatus::Pending);
}

#[tokio::test]
async fn login_check_outage_fails_only_that_hint() {
    let f = fixture().await;
    let first = hint(&f, "MH-A").await;
    let second = hint(&f, "MH-C").await;
    // Every retry of the check before the first hint fails.
    let scraper = MockScraper::new(Provider::MyHeritage)
        .with_flaky_login(0, 3)
        .with_person("MH-A", "Alice Root", Some("MH-B"), None)
        .with_person("MH-C", "Alice Root", Some("MH-B"), None);

    let outcomes = process(&f, scraper).await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].hint_id, first.id);
    assert_eq!(outcomes[0].disposition, HintDisposition::Failed);
    assert_eq!(f.store.hint(first.id).unwrap().status, HintStatus::Pending);
    assert_eq!(outcomes[1].hint_id, second.id);
    assert_eq!(outcomes[1].disposition, HintDisposition::Accepted);
}

#[tokio::test]
async fn expired_session_ends_processing() {
    let f = fixture().await;
    hint(&f, "MH-A").await;
    let pending = f.processor.pending(None, 10).await.unwrap();
    let scraper = MockScraper::new(Provider::MyHeritage).logged_out();

    let results: Vec<_> = f
        .processor
        .process_hints(Arc::new(scraper), pending)
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert!(results[0].as_ref().unwrap_err().needs_reauth());
}
