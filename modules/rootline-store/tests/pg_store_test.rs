//! Integration tests for PgStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use chrono::Utc;
use uuid::Uuid;

use rootline_common::types::*;
use rootline_store::{FamilyStore, LinkOutcome, PgStore};

/// Get a migrated, empty test store, or skip if no test DB is available.
async fn test_store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let store = PgStore::connect(&url).await.ok()?;
    store.migrate().await.ok()?;

    // Clean slate for each test
    sqlx::query(
        "TRUNCATE hints, parent_edges, local_overrides, scraped_records, external_identities, canonical_people CASCADE",
    )
    .execute(store.pool())
    .await
    .ok()?;

    Some(store)
}

fn identity(source: Provider, external_id: &str) -> ExternalIdentity {
    ExternalIdentity {
        source,
        external_id: external_id.to_string(),
        canonical_id: Uuid::nil(),
        profile_url: Some(format!("https://{source}.test/{external_id}")),
        confidence: 1.0,
        last_seen_at: Utc::now(),
    }
}

#[tokio::test]
async fn concurrent_inserts_converge() {
    let Some(store) = test_store().await else {
        return;
    };

    let attempts = (0..8).map(|_| {
        let store = store.clone();
        async move {
            store
                .insert_person_with_identity(
                    &CanonicalPerson::new("Mary Jones", PersonAttrs::default()),
                    &identity(Provider::Ancestry, "102"),
                )
                .await
                .unwrap()
        }
    });
    let results = futures::future::join_all(attempts).await;

    assert_eq!(results.iter().filter(|r| r.created).count(), 1);
    assert!(results
        .iter()
        .all(|r| r.canonical_id == results[0].canonical_id));

    let (people,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM canonical_people")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(people, 1);
}

#[tokio::test]
async fn link_identity_detects_both_conflicts() {
    let Some(store) = test_store().await else {
        return;
    };

    let a = store
        .insert_person_with_identity(
            &CanonicalPerson::new("A", PersonAttrs::default()),
            &identity(Provider::Geni, "G1"),
        )
        .await
        .unwrap();
    let b = store
        .insert_person_with_identity(
            &CanonicalPerson::new("B", PersonAttrs::default()),
            &identity(Provider::WikiTree, "B-1"),
        )
        .await
        .unwrap();

    let elsewhere = store
        .link_identity(&ExternalIdentity {
            canonical_id: b.canonical_id,
            ..identity(Provider::Geni, "G1")
        })
        .await
        .unwrap();
    assert!(matches!(elsewhere, LinkOutcome::BoundElsewhere(ref i) if i.canonical_id == a.canonical_id));

    let taken = store
        .link_identity(&ExternalIdentity {
            canonical_id: a.canonical_id,
            ..identity(Provider::Geni, "G2")
        })
        .await
        .unwrap();
    assert!(matches!(taken, LinkOutcome::SourceTaken(_)));

    let linked = store
        .link_identity(&ExternalIdentity {
            canonical_id: a.canonical_id,
            ..identity(Provider::FindAGrave, "555")
        })
        .await
        .unwrap();
    assert!(matches!(linked, LinkOutcome::Linked(_)));
    assert_eq!(store.identities_for(a.canonical_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn snapshots_and_overrides_round_trip() {
    let Some(store) = test_store().await else {
        return;
    };

    let id = store
        .insert_person_with_identity(
            &CanonicalPerson::new("C", PersonAttrs::default()),
            &identity(Provider::MyHeritage, "M1"),
        )
        .await
        .unwrap()
        .canonical_id;

    let mut record = ScrapedRecord::new(Provider::MyHeritage, "M1", "https://myheritage.test/M1");
    record.birth_date = Some("1850".into());
    store.save_record(id, &record).await.unwrap();

    let latest = store.latest_records(id).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].birth_date.as_deref(), Some("1850"));

    let all = store
        .recent_records(id, Provider::MyHeritage, usize::MAX)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(store.pending_hints(None, usize::MAX).await.unwrap().is_empty());

    let now = Utc::now();
    let ov = LocalOverride {
        id: Uuid::new_v4(),
        entity_type: EntityType::Person,
        entity_id: id.to_string(),
        field_name: "birthDate".into(),
        original_value: None,
        override_value: Some("1850".into()),
        created_at: now,
        updated_at: now,
    };
    store.upsert_override(&ov).await.unwrap();
    store.upsert_override(&ov).await.unwrap();
    let overrides = store
        .overrides_for(EntityType::Person, &id.to_string())
        .await
        .unwrap();
    assert_eq!(overrides.len(), 1);
}
