//! Persistence for canonical people, their provider identities, snapshots,
//! local overrides, parent edges and hints.
//!
//! Every keyed write is an atomic insert-if-absent: callers never read-then-write
//! to decide whether a row exists. Concurrent discovery of the same
//! (source, external_id) from two crawl branches converges on one row.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use rootline_common::types::{
    CanonicalPerson, EntityType, ExternalIdentity, Hint, HintStatus, IdentityMeta,
    IdentityUpsert, LocalOverride, ParentEdge, Provider, ScrapedRecord,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// What `link_identity` found when trying to bind a provider identity.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    /// The binding is now in effect (newly inserted or already identical).
    Linked(ExternalIdentity),
    /// (source, external_id) is already bound to another canonical person.
    BoundElsewhere(ExternalIdentity),
    /// The canonical person already owns a different identity at this source.
    SourceTaken(ExternalIdentity),
}

#[async_trait]
pub trait FamilyStore: Send + Sync {
    // --- Identity map ---

    /// Create `person` and bind `identity` to it, unless (source, external_id)
    /// is already bound, in which case nothing is created and the existing
    /// canonical ID is returned with its `last_seen_at` refreshed.
    async fn insert_person_with_identity(
        &self,
        person: &CanonicalPerson,
        identity: &ExternalIdentity,
    ) -> Result<IdentityUpsert>;

    async fn get_person(&self, id: Uuid) -> Result<Option<CanonicalPerson>>;

    async fn find_identity(
        &self,
        source: Provider,
        external_id: &str,
    ) -> Result<Option<ExternalIdentity>>;

    async fn identities_for(&self, canonical_id: Uuid) -> Result<Vec<ExternalIdentity>>;

    /// Bind an additional identity to an existing canonical person.
    async fn link_identity(&self, identity: &ExternalIdentity) -> Result<LinkOutcome>;

    /// Refresh `last_seen_at` and merge any new metadata.
    async fn touch_identity(
        &self,
        source: Provider,
        external_id: &str,
        meta: &IdentityMeta,
    ) -> Result<()>;

    // --- Snapshots ---

    /// Append a snapshot. Earlier snapshots are retained for diffing.
    async fn save_record(&self, canonical_id: Uuid, record: &ScrapedRecord) -> Result<()>;

    /// Newest snapshot per source for one person.
    async fn latest_records(&self, canonical_id: Uuid) -> Result<Vec<ScrapedRecord>>;

    /// Newest-first snapshots from one source.
    async fn recent_records(
        &self,
        canonical_id: Uuid,
        source: Provider,
        limit: usize,
    ) -> Result<Vec<ScrapedRecord>>;

    // --- Local overrides ---

    /// Insert or update the override keyed by (entity_type, entity_id, field_name).
    /// An existing row keeps its `id`, `created_at` and `original_value`.
    async fn upsert_override(&self, ov: &LocalOverride) -> Result<LocalOverride>;

    async fn overrides_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<LocalOverride>>;

    async fn delete_override(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        field_name: &str,
    ) -> Result<bool>;

    // --- Parent edges ---

    /// Insert if the child has no parent in that role; returns the edge in effect.
    async fn add_parent_edge(&self, edge: &ParentEdge) -> Result<ParentEdge>;

    async fn parent_edges(&self, child_id: Uuid) -> Result<Vec<ParentEdge>>;

    // --- Hints ---

    /// Insert unless (canonical_id, source, external_id) already exists; returns the stored hint.
    async fn add_hint(&self, hint: &Hint) -> Result<Hint>;

    /// Oldest-first pending hints, optionally restricted to one source.
    async fn pending_hints(&self, source: Option<Provider>, limit: usize) -> Result<Vec<Hint>>;

    async fn update_hint(
        &self,
        id: Uuid,
        status: HintStatus,
        confidence: Option<f64>,
        message: Option<&str>,
    ) -> Result<()>;
}
