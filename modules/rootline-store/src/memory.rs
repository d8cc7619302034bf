// In-memory FamilyStore.
//
// One mutex guards all maps, so every keyed insert-if-absent is atomic
// without a read-then-write window. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use rootline_common::types::{
    CanonicalPerson, EntityType, ExternalIdentity, Hint, HintStatus, IdentityMeta,
    IdentityUpsert, LocalOverride, ParentEdge, ParentRole, Provider, ScrapedRecord,
};

use crate::{FamilyStore, LinkOutcome};

type OverrideKey = (EntityType, String, String);

#[derive(Default)]
struct Inner {
    people: HashMap<Uuid, CanonicalPerson>,
    identities: HashMap<(Provider, String), ExternalIdentity>,
    /// canonical_id → snapshots in insertion order
    records: HashMap<Uuid, Vec<ScrapedRecord>>,
    overrides: HashMap<OverrideKey, LocalOverride>,
    edges: HashMap<(Uuid, ParentRole), ParentEdge>,
    hints: Vec<Hint>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("MemoryStore: lock poisoned"))
    }

    /// Insert a person directly, without any identity. Seeds local baselines.
    pub fn put_person(&self, person: CanonicalPerson) -> Result<()> {
        self.lock()?.people.insert(person.id, person);
        Ok(())
    }

    pub fn person_count(&self) -> usize {
        self.lock().map(|g| g.people.len()).unwrap_or(0)
    }

    pub fn override_count(&self) -> usize {
        self.lock().map(|g| g.overrides.len()).unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.lock().map(|g| g.edges.len()).unwrap_or(0)
    }

    pub fn record_count(&self, canonical_id: Uuid) -> usize {
        self.lock()
            .map(|g| g.records.get(&canonical_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn hint(&self, id: Uuid) -> Option<Hint> {
        self.lock()
            .ok()
            .and_then(|g| g.hints.iter().find(|h| h.id == id).cloned())
    }
}

fn merge_meta(identity: &mut ExternalIdentity, meta: &IdentityMeta) {
    if let Some(url) = &meta.profile_url {
        identity.profile_url = Some(url.clone());
    }
    if let Some(confidence) = meta.confidence {
        identity.confidence = confidence;
    }
    identity.last_seen_at = Utc::now();
}

#[async_trait]
impl FamilyStore for MemoryStore {
    async fn insert_person_with_identity(
        &self,
        person: &CanonicalPerson,
        identity: &ExternalIdentity,
    ) -> Result<IdentityUpsert> {
        let mut inner = self.lock()?;
        let key = (identity.source, identity.external_id.clone());

        if let Some(existing) = inner.identities.get_mut(&key) {
            existing.last_seen_at = Utc::now();
            return Ok(IdentityUpsert {
                canonical_id: existing.canonical_id,
                created: false,
            });
        }

        inner.people.insert(person.id, person.clone());
        inner.identities.insert(
            key,
            ExternalIdentity {
                canonical_id: person.id,
                ..identity.clone()
            },
        );
        Ok(IdentityUpsert {
            canonical_id: person.id,
            created: true,
        })
    }

    async fn get_person(&self, id: Uuid) -> Result<Option<CanonicalPerson>> {
        Ok(self.lock()?.people.get(&id).cloned())
    }

    async fn find_identity(
        &self,
        source: Provider,
        external_id: &str,
    ) -> Result<Option<ExternalIdentity>> {
        Ok(self
            .lock()?
            .identities
            .get(&(source, external_id.to_string()))
            .cloned())
    }

    async fn identities_for(&self, canonical_id: Uuid) -> Result<Vec<ExternalIdentity>> {
        let inner = self.lock()?;
        let mut found: Vec<_> = inner
            .identities
            .values()
            .filter(|i| i.canonical_id == canonical_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.source);
        Ok(found)
    }

    async fn link_identity(&self, identity: &ExternalIdentity) -> Result<LinkOutcome> {
        let mut inner = self.lock()?;
        if !inner.people.contains_key(&identity.canonical_id) {
            return Err(anyhow!("canonical person {} does not exist", identity.canonical_id));
        }

        let key = (identity.source, identity.external_id.clone());
        if let Some(existing) = inner.identities.get_mut(&key) {
            if existing.canonical_id != identity.canonical_id {
                return Ok(LinkOutcome::BoundElsewhere(existing.clone()));
            }
            merge_meta(
                existing,
                &IdentityMeta {
                    profile_url: identity.profile_url.clone(),
                    confidence: Some(identity.confidence),
                },
            );
            return Ok(LinkOutcome::Linked(existing.clone()));
        }

        if let Some(taken) = inner
            .identities
            .values()
            .find(|i| i.canonical_id == identity.canonical_id && i.source == identity.source)
        {
            return Ok(LinkOutcome::SourceTaken(taken.clone()));
        }

        inner.identities.insert(key, identity.clone());
        Ok(LinkOutcome::Linked(identity.clone()))
    }

    async fn touch_identity(
        &self,
        source: Provider,
        external_id: &str,
        meta: &IdentityMeta,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(identity) = inner.identities.get_mut(&(source, external_id.to_string())) {
            merge_meta(identity, meta);
        }
        Ok(())
    }

    async fn save_record(&self, canonical_id: Uuid, record: &ScrapedRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.people.contains_key(&canonical_id) {
            return Err(anyhow!("canonical person {canonical_id} does not exist"));
        }
        inner
            .records
            .entry(canonical_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn latest_records(&self, canonical_id: Uuid) -> Result<Vec<ScrapedRecord>> {
        let inner = self.lock()?;
        let mut latest: HashMap<Provider, &ScrapedRecord> = HashMap::new();
        for record in inner.records.get(&canonical_id).into_iter().flatten() {
            match latest.get(&record.source) {
                Some(seen) if seen.scraped_at > record.scraped_at => {}
                _ => {
                    latest.insert(record.source, record);
                }
            }
        }
        let mut records: Vec<ScrapedRecord> = latest.into_values().cloned().collect();
        records.sort_by_key(|r| r.source);
        Ok(records)
    }

    async fn recent_records(
        &self,
        canonical_id: Uuid,
        source: Provider,
        limit: usize,
    ) -> Result<Vec<ScrapedRecord>> {
        let inner = self.lock()?;
        let mut records: Vec<ScrapedRecord> = inner
            .records
            .get(&canonical_id)
            .into_iter()
            .flatten()
            .filter(|r| r.source == source)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse for newest-first.
        records.sort_by_key(|r| r.scraped_at);
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    async fn upsert_override(&self, ov: &LocalOverride) -> Result<LocalOverride> {
        let mut inner = self.lock()?;
        let key = (ov.entity_type, ov.entity_id.clone(), ov.field_name.clone());
        let stored = match inner.overrides.get(&key) {
            Some(existing) => LocalOverride {
                override_value: ov.override_value.clone(),
                updated_at: Utc::now(),
                ..existing.clone()
            },
            None => ov.clone(),
        };
        inner.overrides.insert(key, stored.clone());
        Ok(stored)
    }

    async fn overrides_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<LocalOverride>> {
        let inner = self.lock()?;
        let mut found: Vec<_> = inner
            .overrides
            .values()
            .filter(|o| o.entity_type == entity_type && o.entity_id == entity_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.field_name.cmp(&b.field_name));
        Ok(found)
    }

    async fn delete_override(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        field_name: &str,
    ) -> Result<bool> {
        let key = (entity_type, entity_id.to_string(), field_name.to_string());
        Ok(self.lock()?.overrides.remove(&key).is_some())
    }

    async fn add_parent_edge(&self, edge: &ParentEdge) -> Result<ParentEdge> {
        let mut inner = self.lock()?;
        for id in [edge.child_id, edge.parent_id] {
            if !inner.people.contains_key(&id) {
                return Err(anyhow!("canonical person {id} does not exist"));
            }
        }
        Ok(inner
            .edges
            .entry((edge.child_id, edge.role))
            .or_insert_with(|| edge.clone())
            .clone())
    }

    async fn parent_edges(&self, child_id: Uuid) -> Result<Vec<ParentEdge>> {
        let inner = self.lock()?;
        Ok([ParentRole::Father, ParentRole::Mother]
            .into_iter()
            .filter_map(|role| inner.edges.get(&(child_id, role)).cloned())
            .collect())
    }

    async fn add_hint(&self, hint: &Hint) -> Result<Hint> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.hints.iter().find(|h| {
            h.canonical_id == hint.canonical_id
                && h.source == hint.source
                && h.external_id == hint.external_id
        }) {
            return Ok(existing.clone());
        }
        inner.hints.push(hint.clone());
        Ok(hint.clone())
    }

    async fn pending_hints(&self, source: Option<Provider>, limit: usize) -> Result<Vec<Hint>> {
        let inner = self.lock()?;
        Ok(inner
            .hints
            .iter()
            .filter(|h| h.status == HintStatus::Pending)
            .filter(|h| source.map_or(true, |s| h.source == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_hint(
        &self,
        id: Uuid,
        status: HintStatus,
        confidence: Option<f64>,
        message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let hint = inner
            .hints
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| anyhow!("hint {id} does not exist"))?;
        hint.status = status;
        hint.confidence = confidence;
        hint.message = message.map(String::from);
        Ok(())
    }
}
