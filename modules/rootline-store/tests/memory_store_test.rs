//! Behavioural tests for MemoryStore. No I/O.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use rootline_common::types::*;
use rootline_store::{FamilyStore, LinkOutcome, MemoryStore};

fn identity(source: Provider, external_id: &str) -> ExternalIdentity {
    ExternalIdentity {
        source,
        external_id: external_id.to_string(),
        canonical_id: Uuid::nil(),
        profile_url: None,
        confidence: 1.0,
        last_seen_at: Utc::now(),
    }
}

fn person(name: &str) -> CanonicalPerson {
    CanonicalPerson::new(name, PersonAttrs::default())
}

// =========================================================================
// Identity map
// =========================================================================

#[tokio::test]
async fn second_insert_of_same_key_returns_first_canonical_id() {
    let store = MemoryStore::new();
    let first = store
        .insert_person_with_identity(&person("Ada Lovelace"), &identity(Provider::Geni, "G1"))
        .await
        .unwrap();
    let second = store
        .insert_person_with_identity(&person("Ada Lovelace"), &identity(Provider::Geni, "G1"))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.canonical_id, second.canonical_id);
    assert_eq!(store.person_count(), 1);
}

#[tokio::test]
async fn concurrent_discovery_converges_on_one_person() {
    let store = Arc::new(MemoryStore::new());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .insert_person_with_identity(
                    &person("Ada Lovelace"),
                    &identity(Provider::FamilySearch, "KWCJ-4XD"),
                )
                .await
                .unwrap()
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }

    assert_eq!(ids.iter().filter(|u| u.created).count(), 1);
    assert!(ids.iter().all(|u| u.canonical_id == ids[0].canonical_id));
    assert_eq!(store.person_count(), 1);
}

#[tokio::test]
async fn link_identity_reports_binding_to_other_person() {
    let store = MemoryStore::new();
    let a = store
        .insert_person_with_identity(&person("A"), &identity(Provider::Ancestry, "A1"))
        .await
        .unwrap();
    let b = store
        .insert_person_with_identity(&person("B"), &identity(Provider::Geni, "B1"))
        .await
        .unwrap();

    let outcome = store
        .link_identity(&ExternalIdentity {
            canonical_id: b.canonical_id,
            ..identity(Provider::Ancestry, "A1")
        })
        .await
        .unwrap();

    match outcome {
        LinkOutcome::BoundElsewhere(existing) => assert_eq!(existing.canonical_id, a.canonical_id),
        other => panic!("expected BoundElsewhere, got {other:?}"),
    }
}

#[tokio::test]
async fn link_identity_refuses_second_identity_from_same_source() {
    let store = MemoryStore::new();
    let a = store
        .insert_person_with_identity(&person("A"), &identity(Provider::Ancestry, "A1"))
        .await
        .unwrap();

    let outcome = store
        .link_identity(&ExternalIdentity {
            canonical_id: a.canonical_id,
            ..identity(Provider::Ancestry, "A2")
        })
        .await
        .unwrap();

    assert!(matches!(outcome, LinkOutcome::SourceTaken(ref i) if i.external_id == "A1"));
}

// =========================================================================
// Snapshots
// =========================================================================

#[tokio::test]
async fn latest_records_picks_newest_per_source() {
    let store = MemoryStore::new();
    let id = store
        .insert_person_with_identity(&person("A"), &identity(Provider::Geni, "G1"))
        .await
        .unwrap()
        .canonical_id;

    let mut old = ScrapedRecord::new(Provider::Geni, "G1", "https://geni.test/G1");
    old.birth_place = Some("Leeds".into());
    old.scraped_at = Utc::now() - Duration::days(30);
    let mut new = ScrapedRecord::new(Provider::Geni, "G1", "https://geni.test/G1");
    new.birth_place = Some("York".into());
    let wiki = ScrapedRecord::new(Provider::WikiTree, "Smith-1", "https://wikitree.test/Smith-1");

    store.save_record(id, &old).await.unwrap();
    store.save_record(id, &new).await.unwrap();
    store.save_record(id, &wiki).await.unwrap();

    let latest = store.latest_records(id).await.unwrap();
    assert_eq!(latest.len(), 2);
    let geni = latest.iter().find(|r| r.source == Provider::Geni).unwrap();
    assert_eq!(geni.birth_place.as_deref(), Some("York"));

    let history = store.recent_records(id, Provider::Geni, 5).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].birth_place.as_deref(), Some("Leeds"));
}

// =========================================================================
// Overrides, edges, hints
// =========================================================================

#[tokio::test]
async fn override_upsert_keeps_original_value() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let first = LocalOverride {
        id: Uuid::new_v4(),
        entity_type: EntityType::Person,
        entity_id: "p1".into(),
        field_name: "birthPlace".into(),
        original_value: Some("Leeds".into()),
        override_value: Some("York".into()),
        created_at: now,
        updated_at: now,
    };
    let stored = store.upsert_override(&first).await.unwrap();
    let again = store
        .upsert_override(&LocalOverride {
            id: Uuid::new_v4(),
            original_value: Some("something else".into()),
            override_value: Some("Bradford".into()),
            ..first.clone()
        })
        .await
        .unwrap();

    assert_eq!(store.override_count(), 1);
    assert_eq!(again.id, stored.id);
    assert_eq!(again.original_value.as_deref(), Some("Leeds"));
    assert_eq!(again.override_value.as_deref(), Some("Bradford"));

    assert!(store
        .delete_override(EntityType::Person, "p1", "birthPlace")
        .await
        .unwrap());
    assert_eq!(store.override_count(), 0);
}

#[tokio::test]
async fn parent_edge_is_insert_if_absent() {
    let store = MemoryStore::new();
    let child = person("Child");
    let father = person("Father");
    let impostor = person("Impostor");
    for p in [&child, &father, &impostor] {
        store.put_person(p.clone()).unwrap();
    }

    let edge = |parent_id| ParentEdge {
        child_id: child.id,
        parent_id,
        role: ParentRole::Father,
        source: Some(Provider::Geni),
        confidence: 1.0,
        created_at: Utc::now(),
    };

    let first = store.add_parent_edge(&edge(father.id)).await.unwrap();
    let second = store.add_parent_edge(&edge(impostor.id)).await.unwrap();

    assert_eq!(first.parent_id, father.id);
    assert_eq!(second.parent_id, father.id);
    assert_eq!(store.parent_edges(child.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn pending_hints_filter_by_source_and_status() {
    let store = MemoryStore::new();
    let p = person("A");
    store.put_person(p.clone()).unwrap();

    let geni = store
        .add_hint(&Hint::new(p.id, Provider::Geni, "G9", Some("A")))
        .await
        .unwrap();
    store
        .add_hint(&Hint::new(p.id, Provider::Ancestry, "A9", None))
        .await
        .unwrap();
    // Duplicate key returns the stored hint.
    let dup = store
        .add_hint(&Hint::new(p.id, Provider::Geni, "G9", None))
        .await
        .unwrap();
    assert_eq!(dup.id, geni.id);

    assert_eq!(store.pending_hints(None, 10).await.unwrap().len(), 2);
    assert_eq!(
        store.pending_hints(Some(Provider::Geni), 10).await.unwrap().len(),
        1
    );

    store
        .update_hint(geni.id, HintStatus::Accepted, Some(1.0), None)
        .await
        .unwrap();
    assert!(store
        .pending_hints(Some(Provider::Geni), 10)
        .await
        .unwrap()
        .is_empty());
}
