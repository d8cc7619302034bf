//! Canonical-ID assignment and the external identity registry.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use rootline_common::{
    CanonicalPerson, ExternalIdentity, IdentityMeta, IdentityUpsert, PersonAttrs, Provider,
    RootlineError, ScrapedRecord,
};
use rootline_store::{FamilyStore, LinkOutcome};

pub struct IdentityResolver {
    store: Arc<dyn FamilyStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn FamilyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn FamilyStore> {
        &self.store
    }

    /// Idempotent upsert keyed on (source, external_id). Safe under concurrent
    /// calls for the same key: the store's insert-if-absent decides the winner.
    pub async fn get_or_create_canonical_id(
        &self,
        source: Provider,
        external_id: &str,
        display_name: &str,
        attrs: PersonAttrs,
    ) -> Result<Uuid, RootlineError> {
        let upsert = self
            .upsert(source, external_id, display_name, attrs, IdentityMeta::default())
            .await?;
        Ok(upsert.canonical_id)
    }

    /// Canonicalize a scraped snapshot, recording its page as the profile URL.
    pub async fn canonicalize(&self, record: &ScrapedRecord) -> Result<IdentityUpsert, RootlineError> {
        let meta = IdentityMeta {
            profile_url: Some(record.source_url.clone()),
            confidence: None,
        };
        let upsert = self
            .upsert(
                record.source,
                &record.external_id,
                record.display_name(),
                record.attrs(),
                meta.clone(),
            )
            .await?;
        if !upsert.created {
            self.store
                .touch_identity(record.source, &record.external_id, &meta)
                .await?;
        }
        Ok(upsert)
    }

    async fn upsert(
        &self,
        source: Provider,
        external_id: &str,
        display_name: &str,
        attrs: PersonAttrs,
        meta: IdentityMeta,
    ) -> Result<IdentityUpsert, RootlineError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(RootlineError::Validation(format!(
                "empty external id for {source}"
            )));
        }

        let person = CanonicalPerson::new(display_name, attrs);
        let identity = ExternalIdentity {
            source,
            external_id: external_id.to_string(),
            canonical_id: person.id,
            profile_url: meta.profile_url,
            confidence: meta.confidence.unwrap_or(1.0),
            last_seen_at: Utc::now(),
        };

        let upsert = self
            .store
            .insert_person_with_identity(&person, &identity)
            .await?;
        if upsert.created {
            debug!(
                source = %source,
                external_id,
                canonical_id = %upsert.canonical_id,
                "New canonical person"
            );
        }
        Ok(upsert)
    }

    /// Accepts a canonical ID (passed through if known) or an external ID
    /// looked up under `assumed_source`. `None` when neither is known.
    pub async fn resolve_id(
        &self,
        id: &str,
        assumed_source: Provider,
    ) -> Result<Option<Uuid>, RootlineError> {
        let id = id.trim();
        if let Ok(canonical_id) = Uuid::parse_str(id) {
            if self.store.get_person(canonical_id).await?.is_some() {
                return Ok(Some(canonical_id));
            }
        }
        Ok(self
            .store
            .find_identity(assumed_source, id)
            .await?
            .map(|i| i.canonical_id))
    }

    /// Link an additional provider identity to an existing person. Never
    /// reassigns an identity already bound elsewhere.
    pub async fn register_external_id(
        &self,
        canonical_id: Uuid,
        source: Provider,
        external_id: &str,
        meta: IdentityMeta,
    ) -> Result<ExternalIdentity, RootlineError> {
        let external_id = external_id.trim();
        if self.store.get_person(canonical_id).await?.is_none() {
            return Err(RootlineError::NotFound(format!(
                "canonical person {canonical_id}"
            )));
        }

        let identity = ExternalIdentity {
            source,
            external_id: external_id.to_string(),
            canonical_id,
            profile_url: meta.profile_url,
            confidence: meta.confidence.unwrap_or(1.0),
            last_seen_at: Utc::now(),
        };

        match self.store.link_identity(&identity).await? {
            LinkOutcome::Linked(linked) => Ok(linked),
            LinkOutcome::BoundElsewhere(existing) => {
                warn!(
                    source = %source,
                    external_id,
                    existing = %existing.canonical_id,
                    requested = %canonical_id,
                    "Refusing to reassign external identity"
                );
                Err(RootlineError::Conflict {
                    provider: source,
                    external_id: external_id.to_string(),
                    existing: existing.canonical_id,
                    requested: canonical_id,
                })
            }
            LinkOutcome::SourceTaken(existing) => Err(RootlineError::Validation(format!(
                "{canonical_id} already has {source} identity {}",
                existing.external_id
            ))),
        }
    }

    pub async fn identities(&self, canonical_id: Uuid) -> Result<Vec<ExternalIdentity>, RootlineError> {
        Ok(self.store.identities_for(canonical_id).await?)
    }
}
