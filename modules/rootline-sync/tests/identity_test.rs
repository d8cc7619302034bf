//! Canonical-ID assignment and external identity registration.

use std::sync::Arc;

use futures::future::join_all;

use rootline_common::{IdentityMeta, PersonAttrs, Provider, RootlineError};
use rootline_store::{FamilyStore, MemoryStore};
use rootline_sync::identity::IdentityResolver;
use rootline_sync::testing::record;

fn resolver() -> (Arc<MemoryStore>, IdentityResolver) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), IdentityResolver::new(store))
}

#[tokio::test]
async fn same_external_id_always_yields_same_canonical_id() {
    let (store, identity) = resolver();

    let first = identity
        .get_or_create_canonical_id(Provider::FamilySearch, "KWCJ-4XD", "John Smith", PersonAttrs::default())
        .await
        .unwrap();
    let second = identity
        .get_or_create_canonical_id(Provider::FamilySearch, " KWCJ-4XD ", "J. Smith", PersonAttrs::default())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(store.person_count(), 1);
    // The first discovery's name stands.
    assert_eq!(store.get_person(first).await.unwrap().unwrap().display_name, "John Smith");
}

#[tokio::test]
async fn same_id_on_another_provider_is_a_different_person() {
    let (store, identity) = resolver();

    let fs = identity
        .get_or_create_canonical_id(Provider::FamilySearch, "1234", "Ann Lee", PersonAttrs::default())
        .await
        .unwrap();
    let geni = identity
        .get_or_create_canonical_id(Provider::Geni, "1234", "Ann Lee", PersonAttrs::default())
        .await
        .unwrap();

    assert_ne!(fs, geni);
    assert_eq!(store.person_count(), 2);
}

#[tokio::test]
async fn concurrent_discovery_converges_on_one_person() {
    let (store, identity) = resolver();
    let identity = Arc::new(identity);

    let tasks = (0..16).map(|i| {
        let identity = identity.clone();
        tokio::spawn(async move {
            identity
                .get_or_create_canonical_id(
                    Provider::Ancestry,
                    "A-99",
                    &format!("Branch {i}"),
                    PersonAttrs::default(),
                )
                .await
                .unwrap()
        })
    });
    let ids: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.person_count(), 1);
}

#[tokio::test]
async fn empty_external_id_is_rejected() {
    let (_, identity) = resolver();
    let err = identity
        .get_or_create_canonical_id(Provider::Geni, "   ", "Nobody", PersonAttrs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RootlineError::Validation(_)));
}

#[tokio::test]
async fn canonicalize_records_profile_url() {
    let (store, identity) = resolver();
    let snapshot = record(Provider::WikiTree, "Smith-2", "John Smith", None, None);

    let upsert = identity.canonicalize(&snapshot).await.unwrap();
    assert!(upsert.created);
    let again = identity.canonicalize(&snapshot).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.canonical_id, upsert.canonical_id);

    let bound = store
        .find_identity(Provider::WikiTree, "Smith-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bound.profile_url.as_deref(), Some(snapshot.source_url.as_str()));
}

#[tokio::test]
async fn resolve_id_accepts_canonical_or_external() {
    let (_, identity) = resolver();
    let id = identity
        .get_or_create_canonical_id(Provider::MyHeritage, "MH-1", "Ruth Ames", PersonAttrs::default())
        .await
        .unwrap();

    assert_eq!(identity.resolve_id(&id.to_string(), Provider::Geni).await.unwrap(), Some(id));
    assert_eq!(identity.resolve_id("MH-1", Provider::MyHeritage).await.unwrap(), Some(id));
    assert_eq!(identity.resolve_id("MH-1", Provider::Geni).await.unwrap(), None);
    assert_eq!(
        identity
            .resolve_id(&uuid::Uuid::new_v4().to_string(), Provider::Geni)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn registering_links_a_second_provider() {
    let (_, identity) = resolver();
    let id = identity
        .get_or_create_canonical_id(Provider::FamilySearch, "KWCJ-4XD", "John Smith", PersonAttrs::default())
        .await
        .unwrap();

    identity
        .register_external_id(id, Provider::Ancestry, "A-77", IdentityMeta::default())
        .await
        .unwrap();
    // Idempotent.
    identity
        .register_external_id(id, Provider::Ancestry, "A-77", IdentityMeta::default())
        .await
        .unwrap();

    let mut sources: Vec<_> = identity
        .identities(id)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.source)
        .collect();
    sources.sort();
    assert_eq!(sources, vec![Provider::FamilySearch, Provider::Ancestry]);
    assert_eq!(identity.resolve_id("A-77", Provider::Ancestry).await.unwrap(), Some(id));
}

#[tokio::test]
async fn identity_bound_elsewhere_is_never_reassigned() {
    let (_, identity) = resolver();
    let john = identity
        .get_or_create_canonical_id(Provider::FamilySearch, "F1", "John Smith", PersonAttrs::default())
        .await
        .unwrap();
    let other = identity
        .get_or_create_canonical_id(Provider::Ancestry, "A-77", "Jon Smyth", PersonAttrs::default())
        .await
        .unwrap();

    let err = identity
        .register_external_id(john, Provider::Ancestry, "A-77", IdentityMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RootlineError::Conflict { existing, requested, .. } if existing == other && requested == john
    ));
    assert_eq!(identity.resolve_id("A-77", Provider::Ancestry).await.unwrap(), Some(other));
}

#[tokio::test]
async fn a_person_holds_one_identity_per_provider() {
    let (_, identity) = resolver();
    let id = identity
        .get_or_create_canonical_id(Provider::Geni, "G1", "Ada Byron", PersonAttrs::default())
        .await
        .unwrap();

    let err = identity
        .register_external_id(id, Provider::Geni, "G2", IdentityMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RootlineError::Validation(_)));
}

#[tokio::test]
async fn registering_against_unknown_person_fails() {
    let (_, identity) = resolver();
    let err = identity
        .register_external_id(uuid::Uuid::new_v4(), Provider::Geni, "G1", IdentityMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RootlineError::NotFound(_)));
}
