//! FamilyStore backed by Postgres.
//!
//! Uniqueness lives in the schema: (source, external_id) and
//! (canonical_id, source) on identities, (entity_type, entity_id, field_name)
//! on overrides, (child_id, role) on parent edges. Writes use
//! `ON CONFLICT` so concurrent callers converge instead of racing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use rootline_common::types::{
    CanonicalPerson, EntityType, ExternalIdentity, Hint, HintStatus, IdentityMeta,
    IdentityUpsert, LocalOverride, ParentEdge, ParentRole, PersonAttrs, Provider, ScrapedRecord,
};

use crate::{FamilyStore, LinkOutcome};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS canonical_people (
        id            UUID         PRIMARY KEY,
        display_name  TEXT         NOT NULL,
        gender        TEXT,
        birth_date    TEXT,
        birth_place   TEXT,
        death_date    TEXT,
        death_place   TEXT,
        created_at    TIMESTAMPTZ  NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS external_identities (
        source        TEXT              NOT NULL,
        external_id   TEXT              NOT NULL,
        canonical_id  UUID              NOT NULL REFERENCES canonical_people(id) ON DELETE CASCADE,
        profile_url   TEXT,
        confidence    DOUBLE PRECISION  NOT NULL DEFAULT 1.0,
        last_seen_at  TIMESTAMPTZ       NOT NULL DEFAULT now(),
        PRIMARY KEY (source, external_id),
        UNIQUE (canonical_id, source)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scraped_records (
        id            UUID         PRIMARY KEY,
        canonical_id  UUID         NOT NULL REFERENCES canonical_people(id) ON DELETE CASCADE,
        source        TEXT         NOT NULL,
        external_id   TEXT         NOT NULL,
        payload       JSONB        NOT NULL,
        scraped_at    TIMESTAMPTZ  NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS scraped_records_latest
        ON scraped_records (canonical_id, source, scraped_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS local_overrides (
        id              UUID         PRIMARY KEY,
        entity_type     TEXT         NOT NULL,
        entity_id       TEXT         NOT NULL,
        field_name      TEXT         NOT NULL,
        original_value  TEXT,
        override_value  TEXT,
        created_at      TIMESTAMPTZ  NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ  NOT NULL DEFAULT now(),
        UNIQUE (entity_type, entity_id, field_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parent_edges (
        child_id    UUID              NOT NULL REFERENCES canonical_people(id) ON DELETE CASCADE,
        parent_id   UUID              NOT NULL REFERENCES canonical_people(id) ON DELETE CASCADE,
        role        TEXT              NOT NULL,
        source      TEXT,
        confidence  DOUBLE PRECISION  NOT NULL DEFAULT 1.0,
        created_at  TIMESTAMPTZ       NOT NULL DEFAULT now(),
        PRIMARY KEY (child_id, role)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hints (
        id              UUID              PRIMARY KEY,
        canonical_id    UUID              NOT NULL REFERENCES canonical_people(id) ON DELETE CASCADE,
        source          TEXT              NOT NULL,
        external_id     TEXT              NOT NULL,
        candidate_name  TEXT,
        status          TEXT              NOT NULL DEFAULT 'pending',
        confidence      DOUBLE PRECISION,
        message         TEXT,
        created_at      TIMESTAMPTZ       NOT NULL DEFAULT now(),
        UNIQUE (canonical_id, source, external_id)
    )
    "#,
];

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = MIGRATIONS.len(), "Schema migrated");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct PersonRow {
    id: Uuid,
    display_name: String,
    gender: Option<String>,
    birth_date: Option<String>,
    birth_place: Option<String>,
    death_date: Option<String>,
    death_place: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<PersonRow> for CanonicalPerson {
    fn from(row: PersonRow) -> Self {
        CanonicalPerson {
            id: row.id,
            display_name: row.display_name,
            attrs: PersonAttrs {
                gender: row.gender,
                birth_date: row.birth_date,
                birth_place: row.birth_place,
                death_date: row.death_date,
                death_place: row.death_place,
            },
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    source: String,
    external_id: String,
    canonical_id: Uuid,
    profile_url: Option<String>,
    confidence: f64,
    last_seen_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for ExternalIdentity {
    type Error = anyhow::Error;

    fn try_from(row: IdentityRow) -> Result<Self> {
        Ok(ExternalIdentity {
            source: row.source.parse()?,
            external_id: row.external_id,
            canonical_id: row.canonical_id,
            profile_url: row.profile_url,
            confidence: row.confidence,
            last_seen_at: row.last_seen_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
    id: Uuid,
    entity_type: String,
    entity_id: String,
    field_name: String,
    original_value: Option<String>,
    override_value: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OverrideRow> for LocalOverride {
    fn from(row: OverrideRow) -> Self {
        LocalOverride {
            id: row.id,
            entity_type: EntityType::from_str_loose(&row.entity_type),
            entity_id: row.entity_id,
            field_name: row.field_name,
            original_value: row.original_value,
            override_value: row.override_value,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    child_id: Uuid,
    parent_id: Uuid,
    role: String,
    source: Option<String>,
    confidence: f64,
    created_at: DateTime<Utc>,
}

impl TryFrom<EdgeRow> for ParentEdge {
    type Error = anyhow::Error;

    fn try_from(row: EdgeRow) -> Result<Self> {
        Ok(ParentEdge {
            child_id: row.child_id,
            parent_id: row.parent_id,
            role: ParentRole::from_str_loose(&row.role)
                .with_context(|| format!("unknown parent role {}", row.role))?,
            source: row.source.as_deref().map(str::parse::<Provider>).transpose()?,
            confidence: row.confidence,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HintRow {
    id: Uuid,
    canonical_id: Uuid,
    source: String,
    external_id: String,
    candidate_name: Option<String>,
    status: String,
    confidence: Option<f64>,
    message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HintRow> for Hint {
    type Error = anyhow::Error;

    fn try_from(row: HintRow) -> Result<Self> {
        Ok(Hint {
            id: row.id,
            canonical_id: row.canonical_id,
            source: row.source.parse()?,
            external_id: row.external_id,
            candidate_name: row.candidate_name,
            status: HintStatus::from_str_loose(&row.status),
            confidence: row.confidence,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

/// Postgres rejects a negative LIMIT, so oversized limits clamp to `i64::MAX`.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

const IDENTITY_COLUMNS: &str =
    "source, external_id, canonical_id, profile_url, confidence, last_seen_at";

// ---------------------------------------------------------------------------
// FamilyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl FamilyStore for PgStore {
    async fn insert_person_with_identity(
        &self,
        person: &CanonicalPerson,
        identity: &ExternalIdentity,
    ) -> Result<IdentityUpsert> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO canonical_people
                (id, display_name, gender, birth_date, birth_place, death_date, death_place, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(person.id)
        .bind(&person.display_name)
        .bind(&person.attrs.gender)
        .bind(&person.attrs.birth_date)
        .bind(&person.attrs.birth_place)
        .bind(&person.attrs.death_date)
        .bind(&person.attrs.death_place)
        .bind(person.created_at)
        .execute(&mut *tx)
        .await?;

        // A concurrent insert of the same key blocks here until the other
        // transaction commits, then falls through to DO NOTHING.
        let inserted = sqlx::query_as::<_, (Uuid,)>(
            r#"
            INSERT INTO external_identities
                (source, external_id, canonical_id, profile_url, confidence, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (source, external_id) DO NOTHING
            RETURNING canonical_id
            "#,
        )
        .bind(identity.source.as_str())
        .bind(&identity.external_id)
        .bind(person.id)
        .bind(&identity.profile_url)
        .bind(identity.confidence)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((canonical_id,)) = inserted {
            tx.commit().await?;
            return Ok(IdentityUpsert {
                canonical_id,
                created: true,
            });
        }

        // Already bound: drop the speculative person and return the winner.
        tx.rollback().await?;
        let (canonical_id,) = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE external_identities SET last_seen_at = now()
            WHERE source = $1 AND external_id = $2
            RETURNING canonical_id
            "#,
        )
        .bind(identity.source.as_str())
        .bind(&identity.external_id)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            source = %identity.source,
            external_id = identity.external_id.as_str(),
            %canonical_id,
            "Identity already bound"
        );
        Ok(IdentityUpsert {
            canonical_id,
            created: false,
        })
    }

    async fn get_person(&self, id: Uuid) -> Result<Option<CanonicalPerson>> {
        let row = sqlx::query_as::<_, PersonRow>("SELECT * FROM canonical_people WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_identity(
        &self,
        source: Provider,
        external_id: &str,
    ) -> Result<Option<ExternalIdentity>> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM external_identities WHERE source = $1 AND external_id = $2"
        ))
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn identities_for(&self, canonical_id: Uuid) -> Result<Vec<ExternalIdentity>> {
        let rows = sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM external_identities WHERE canonical_id = $1 ORDER BY source"
        ))
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn link_identity(&self, identity: &ExternalIdentity) -> Result<LinkOutcome> {
        let inserted = sqlx::query_as::<_, IdentityRow>(&format!(
            r#"
            INSERT INTO external_identities
                (source, external_id, canonical_id, profile_url, confidence, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT DO NOTHING
            RETURNING {IDENTITY_COLUMNS}
            "#
        ))
        .bind(identity.source.as_str())
        .bind(&identity.external_id)
        .bind(identity.canonical_id)
        .bind(&identity.profile_url)
        .bind(identity.confidence)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(LinkOutcome::Linked(row.try_into()?));
        }

        // Either unique constraint fired. Work out which one.
        if let Some(existing) = self.find_identity(identity.source, &identity.external_id).await? {
            if existing.canonical_id != identity.canonical_id {
                return Ok(LinkOutcome::BoundElsewhere(existing));
            }
            self.touch_identity(
                identity.source,
                &identity.external_id,
                &IdentityMeta {
                    profile_url: identity.profile_url.clone(),
                    confidence: Some(identity.confidence),
                },
            )
            .await?;
            return Ok(LinkOutcome::Linked(existing));
        }

        let taken = sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM external_identities WHERE canonical_id = $1 AND source = $2"
        ))
        .bind(identity.canonical_id)
        .bind(identity.source.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(LinkOutcome::SourceTaken(taken.try_into()?))
    }

    async fn touch_identity(
        &self,
        source: Provider,
        external_id: &str,
        meta: &IdentityMeta,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE external_identities
            SET last_seen_at = now(),
                profile_url = COALESCE($3, profile_url),
                confidence = COALESCE($4, confidence)
            WHERE source = $1 AND external_id = $2
            "#,
        )
        .bind(source.as_str())
        .bind(external_id)
        .bind(&meta.profile_url)
        .bind(meta.confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_record(&self, canonical_id: Uuid, record: &ScrapedRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scraped_records (id, canonical_id, source, external_id, payload, scraped_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(canonical_id)
        .bind(record.source.as_str())
        .bind(&record.external_id)
        .bind(Json(record))
        .bind(record.scraped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_records(&self, canonical_id: Uuid) -> Result<Vec<ScrapedRecord>> {
        let rows = sqlx::query_as::<_, (Json<ScrapedRecord>,)>(
            r#"
            SELECT DISTINCT ON (source) payload
            FROM scraped_records
            WHERE canonical_id = $1
            ORDER BY source, scraped_at DESC
            "#,
        )
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await?;
        let mut records: Vec<ScrapedRecord> = rows.into_iter().map(|(Json(r),)| r).collect();
        records.sort_by_key(|r| r.source);
        Ok(records)
    }

    async fn recent_records(
        &self,
        canonical_id: Uuid,
        source: Provider,
        limit: usize,
    ) -> Result<Vec<ScrapedRecord>> {
        let rows = sqlx::query_as::<_, (Json<ScrapedRecord>,)>(
            r#"
            SELECT payload
            FROM scraped_records
            WHERE canonical_id = $1 AND source = $2
            ORDER BY scraped_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(canonical_id)
        .bind(source.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(Json(r),)| r).collect())
    }

    async fn upsert_override(&self, ov: &LocalOverride) -> Result<LocalOverride> {
        let row = sqlx::query_as::<_, OverrideRow>(
            r#"
            INSERT INTO local_overrides
                (id, entity_type, entity_id, field_name, original_value, override_value, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (entity_type, entity_id, field_name)
            DO UPDATE SET override_value = EXCLUDED.override_value,
                          updated_at = now()
            RETURNING *
            "#,
        )
        .bind(ov.id)
        .bind(ov.entity_type.as_str())
        .bind(&ov.entity_id)
        .bind(&ov.field_name)
        .bind(&ov.original_value)
        .bind(&ov.override_value)
        .bind(ov.created_at)
        .bind(ov.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn overrides_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<LocalOverride>> {
        let rows = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT * FROM local_overrides
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY field_name
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_override(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        field_name: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM local_overrides WHERE entity_type = $1 AND entity_id = $2 AND field_name = $3",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(field_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_parent_edge(&self, edge: &ParentEdge) -> Result<ParentEdge> {
        sqlx::query(
            r#"
            INSERT INTO parent_edges (child_id, parent_id, role, source, confidence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (child_id, role) DO NOTHING
            "#,
        )
        .bind(edge.child_id)
        .bind(edge.parent_id)
        .bind(edge.role.as_str())
        .bind(edge.source.map(|s| s.as_str()))
        .bind(edge.confidence)
        .bind(edge.created_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, EdgeRow>(
            "SELECT * FROM parent_edges WHERE child_id = $1 AND role = $2",
        )
        .bind(edge.child_id)
        .bind(edge.role.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn parent_edges(&self, child_id: Uuid) -> Result<Vec<ParentEdge>> {
        let rows = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT * FROM parent_edges
            WHERE child_id = $1
            ORDER BY CASE role WHEN 'father' THEN 0 ELSE 1 END
            "#,
        )
        .bind(child_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn add_hint(&self, hint: &Hint) -> Result<Hint> {
        sqlx::query(
            r#"
            INSERT INTO hints (id, canonical_id, source, external_id, candidate_name, status, confidence, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (canonical_id, source, external_id) DO NOTHING
            "#,
        )
        .bind(hint.id)
        .bind(hint.canonical_id)
        .bind(hint.source.as_str())
        .bind(&hint.external_id)
        .bind(&hint.candidate_name)
        .bind(hint.status.as_str())
        .bind(hint.confidence)
        .bind(&hint.message)
        .bind(hint.created_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, HintRow>(
            "SELECT * FROM hints WHERE canonical_id = $1 AND source = $2 AND external_id = $3",
        )
        .bind(hint.canonical_id)
        .bind(hint.source.as_str())
        .bind(&hint.external_id)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn pending_hints(&self, source: Option<Provider>, limit: usize) -> Result<Vec<Hint>> {
        let rows = sqlx::query_as::<_, HintRow>(
            r#"
            SELECT * FROM hints
            WHERE status = 'pending' AND ($1::TEXT IS NULL OR source = $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(source.map(|s| s.as_str()))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_hint(
        &self,
        id: Uuid,
        status: HintStatus,
        confidence: Option<f64>,
        message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE hints SET status = $2, confidence = $3, message = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(confidence)
        .bind(message)
        .execute(&self.pool)
        .await?;
        anyhow::ensure!(result.rows_affected() == 1, "hint {id} does not exist");
        Ok(())
    }
}
