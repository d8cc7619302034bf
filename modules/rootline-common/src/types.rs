use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RootlineError;

// --- Providers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    FamilySearch,
    Ancestry,
    MyHeritage,
    Geni,
    WikiTree,
    FindAGrave,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::FamilySearch,
        Provider::Ancestry,
        Provider::MyHeritage,
        Provider::Geni,
        Provider::WikiTree,
        Provider::FindAGrave,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::FamilySearch => "familysearch",
            Provider::Ancestry => "ancestry",
            Provider::MyHeritage => "myheritage",
            Provider::Geni => "geni",
            Provider::WikiTree => "wikitree",
            Provider::FindAGrave => "findagrave",
        }
    }

    /// Upper-case key used in environment variable names.
    pub fn env_key(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = RootlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "familysearch" | "family_search" => Ok(Provider::FamilySearch),
            "ancestry" => Ok(Provider::Ancestry),
            "myheritage" | "my_heritage" => Ok(Provider::MyHeritage),
            "geni" => Ok(Provider::Geni),
            "wikitree" | "wiki_tree" => Ok(Provider::WikiTree),
            "findagrave" | "find_a_grave" => Ok(Provider::FindAGrave),
            other => Err(RootlineError::Validation(format!("unknown provider: {other}"))),
        }
    }
}

// --- Canonical people ---

/// Baseline attributes of a person, as held locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonAttrs {
    pub gender: Option<String>,
    pub birth_date: Option<String>,
    pub birth_place: Option<String>,
    pub death_date: Option<String>,
    pub death_place: Option<String>,
}

/// One real person, across every provider that knows about them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPerson {
    pub id: Uuid,
    pub display_name: String,
    #[serde(flatten)]
    pub attrs: PersonAttrs,
    pub created_at: DateTime<Utc>,
}

impl CanonicalPerson {
    /// New person with a time-ordered (v7) identifier.
    pub fn new(display_name: &str, attrs: PersonAttrs) -> Self {
        Self {
            id: Uuid::now_v7(),
            display_name: display_name.trim().to_string(),
            attrs,
            created_at: Utc::now(),
        }
    }
}

/// Binding of a (provider, provider-specific ID) pair to a canonical person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub source: Provider,
    pub external_id: String,
    pub canonical_id: Uuid,
    pub profile_url: Option<String>,
    pub confidence: f64,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityMeta {
    pub profile_url: Option<String>,
    pub confidence: Option<f64>,
}

/// Result of an atomic insert-if-absent on the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityUpsert {
    pub canonical_id: Uuid,
    pub created: bool,
}

// --- Provider snapshots ---

/// A provider-attributed snapshot of one person's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub id: Uuid,
    pub source: Provider,
    pub external_id: String,
    pub name: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<String>,
    pub birth_place: Option<String>,
    pub death_date: Option<String>,
    pub death_place: Option<String>,
    pub father_external_id: Option<String>,
    pub mother_external_id: Option<String>,
    pub father_name: Option<String>,
    pub mother_name: Option<String>,
    /// How the parent links were located, when any were.
    #[serde(default)]
    pub parent_source: Option<ParentSource>,
    #[serde(default)]
    pub spouse_external_ids: Vec<String>,
    pub photo_url: Option<String>,
    pub source_url: String,
    pub scraped_at: DateTime<Utc>,
}

impl ScrapedRecord {
    pub fn new(source: Provider, external_id: &str, source_url: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            source,
            external_id: external_id.to_string(),
            name: None,
            gender: None,
            birth_date: None,
            birth_place: None,
            death_date: None,
            death_place: None,
            father_external_id: None,
            mother_external_id: None,
            father_name: None,
            mother_name: None,
            parent_source: None,
            spouse_external_ids: Vec::new(),
            photo_url: None,
            source_url: source_url.to_string(),
            scraped_at: Utc::now(),
        }
    }

    /// Baseline attributes a first-seen person is created with.
    pub fn attrs(&self) -> PersonAttrs {
        PersonAttrs {
            gender: self.gender.clone(),
            birth_date: self.birth_date.clone(),
            birth_place: self.birth_place.clone(),
            death_date: self.death_date.clone(),
            death_place: self.death_place.clone(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// Value of a tracked field in this snapshot.
    pub fn field(&self, field: FieldName) -> Option<&str> {
        match field {
            FieldName::Name => self.name.as_deref(),
            FieldName::Gender => self.gender.as_deref(),
            FieldName::BirthDate => self.birth_date.as_deref(),
            FieldName::BirthPlace => self.birth_place.as_deref(),
            FieldName::DeathDate => self.death_date.as_deref(),
            FieldName::DeathPlace => self.death_place.as_deref(),
            FieldName::FatherName => self.father_name.as_deref(),
            FieldName::MotherName => self.mother_name.as_deref(),
        }
    }

    pub fn parent_external_id(&self, role: ParentRole) -> Option<&str> {
        match role {
            ParentRole::Father => self.father_external_id.as_deref(),
            ParentRole::Mother => self.mother_external_id.as_deref(),
        }
    }
}

/// How a provider's parent references were located on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentSource {
    /// The provider labelled each parent with its role.
    RoleTagged,
    /// Fallback: first person link taken as father, second as mother.
    LinkOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentIds {
    pub father_id: Option<String>,
    pub mother_id: Option<String>,
    pub father_name: Option<String>,
    pub mother_name: Option<String>,
    pub source: ParentSource,
}

impl ParentIds {
    pub fn none() -> Self {
        Self {
            father_id: None,
            mother_id: None,
            father_name: None,
            mother_name: None,
            source: ParentSource::RoleTagged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSummary {
    pub tree_id: String,
    pub name: String,
    pub url: Option<String>,
}

// --- Relationships ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentRole {
    Father,
    Mother,
}

impl ParentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentRole::Father => "father",
            ParentRole::Mother => "mother",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "father" => Some(ParentRole::Father),
            "mother" => Some(ParentRole::Mother),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Child → parent edge in the canonical graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentEdge {
    pub child_id: Uuid,
    pub parent_id: Uuid,
    pub role: ParentRole,
    pub source: Option<Provider>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

// --- Local overrides ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Family,
    Event,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Family => "family",
            EntityType::Event => "event",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "family" => EntityType::Family,
            "event" => EntityType::Event,
            _ => EntityType::Person,
        }
    }
}

/// User-asserted value. Keyed by (entity_type, entity_id, field_name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalOverride {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub field_name: String,
    pub original_value: Option<String>,
    pub override_value: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Reconciliation ---

/// Fields tracked by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldName {
    Name,
    Gender,
    BirthDate,
    BirthPlace,
    DeathDate,
    DeathPlace,
    FatherName,
    MotherName,
}

impl FieldName {
    pub const ALL: [FieldName; 8] = [
        FieldName::Name,
        FieldName::Gender,
        FieldName::BirthDate,
        FieldName::BirthPlace,
        FieldName::DeathDate,
        FieldName::DeathPlace,
        FieldName::FatherName,
        FieldName::MotherName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::Name => "name",
            FieldName::Gender => "gender",
            FieldName::BirthDate => "birthDate",
            FieldName::BirthPlace => "birthPlace",
            FieldName::DeathDate => "deathDate",
            FieldName::DeathPlace => "deathPlace",
            FieldName::FatherName => "fatherName",
            FieldName::MotherName => "motherName",
        }
    }

    /// Relationship fields change graph topology rather than an attribute.
    pub fn parent_role(&self) -> Option<ParentRole> {
        match self {
            FieldName::FatherName => Some(ParentRole::Father),
            FieldName::MotherName => Some(ParentRole::Mother),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = RootlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RootlineError::Validation(format!("unknown field: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    Match,
    Different,
    MissingLocal,
    MissingProvider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderValue {
    pub provider: Provider,
    pub value: Option<String>,
    pub status: ComparisonStatus,
    pub scraped_at: DateTime<Utc>,
}

/// Derived per-field view across baseline, overrides and provider snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub field: FieldName,
    pub baseline: Option<String>,
    pub override_value: Option<String>,
    /// Override, else baseline, else the first provider value.
    pub display_value: Option<String>,
    pub providers: Vec<ProviderValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonComparison {
    pub canonical_id: Uuid,
    pub fields: Vec<FieldComparison>,
}

impl PersonComparison {
    pub fn field(&self, field: FieldName) -> Option<&FieldComparison> {
        self.fields.iter().find(|f| f.field == field)
    }

    /// Status per provider for one field, keyed for quick assertions and display.
    pub fn statuses(&self, field: FieldName) -> BTreeMap<Provider, ComparisonStatus> {
        self.field(field)
            .map(|f| f.providers.iter().map(|p| (p.provider, p.status)).collect())
            .unwrap_or_default()
    }
}

// --- Hints ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintStatus {
    Pending,
    Accepted,
    NeedsReview,
    Rejected,
}

impl HintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HintStatus::Pending => "pending",
            HintStatus::Accepted => "accepted",
            HintStatus::NeedsReview => "needs_review",
            HintStatus::Rejected => "rejected",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "accepted" => HintStatus::Accepted,
            "needs_review" => HintStatus::NeedsReview,
            "rejected" => HintStatus::Rejected,
            _ => HintStatus::Pending,
        }
    }
}

/// A provider-suggested record that may be the same person as `canonical_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub id: Uuid,
    pub canonical_id: Uuid,
    pub source: Provider,
    pub external_id: String,
    pub candidate_name: Option<String>,
    pub status: HintStatus,
    pub confidence: Option<f64>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Hint {
    pub fn new(canonical_id: Uuid, source: Provider, external_id: &str, candidate_name: Option<&str>) -> Self {
        Self {
            id: Uuid::now_v7(),
            canonical_id,
            source,
            external_id: external_id.to_string(),
            candidate_name: candidate_name.map(String::from),
            status: HintStatus::Pending,
            confidence: None,
            message: None,
            created_at: Utc::now(),
        }
    }
}
