//! Three-layer field reconciliation: local override, canonical baseline,
//! raw provider snapshot.
//!
//! Comparison statuses are always computed against the baseline. Overrides
//! only change which value is displayed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use rootline_common::{
    CanonicalPerson, ComparisonStatus, EntityType, FieldComparison, FieldName, LocalOverride,
    ParentEdge, ParentRole, ParentSource, PersonAttrs, PersonComparison, Provider, ProviderValue,
    RootlineError, ScrapedRecord,
};
use rootline_store::FamilyStore;

use crate::identity::IdentityResolver;

/// Confidence for a candidate found in the right parent position.
pub const ROLE_MATCH_CONFIDENCE: f64 = 0.7;
/// Added when the normalized display name also matches.
pub const NAME_MATCH_BONUS: f64 = 0.3;

/// Trim, collapse internal whitespace and case-fold.
pub fn normalize_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn classify(baseline: Option<&str>, provider: Option<&str>) -> ComparisonStatus {
    match (non_empty(baseline), non_empty(provider)) {
        (_, None) => ComparisonStatus::MissingProvider,
        (None, Some(_)) => ComparisonStatus::MissingLocal,
        (Some(b), Some(p)) if normalize_value(b) == normalize_value(p) => ComparisonStatus::Match,
        (Some(_), Some(_)) => ComparisonStatus::Different,
    }
}

pub fn link_confidence(role_match: bool, name_match: bool) -> f64 {
    let mut score = 0.0;
    if role_match {
        score += ROLE_MATCH_CONFIDENCE;
    }
    if name_match {
        score += NAME_MATCH_BONUS;
    }
    score.min(1.0)
}

pub fn names_match(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_value(a), normalize_value(b));
    !a.is_empty() && a == b
}

/// Result of a "use this value" action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    OverrideSaved(LocalOverride),
    ParentLinked { parent_id: Uuid, confidence: f64 },
    /// Below the auto-link threshold; confirm with `confirm_parent_link`.
    NeedsConfirmation { candidate_id: Uuid, confidence: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: FieldName,
    pub previous: Option<String>,
    pub current: Option<String>,
}

pub struct ReconciliationEngine {
    identity: Arc<IdentityResolver>,
    auto_link_threshold: f64,
}

impl ReconciliationEngine {
    pub fn new(identity: Arc<IdentityResolver>, auto_link_threshold: f64) -> Self {
        Self {
            identity,
            auto_link_threshold,
        }
    }

    fn store(&self) -> &Arc<dyn FamilyStore> {
        self.identity.store()
    }

    async fn person(&self, id: Uuid) -> Result<CanonicalPerson, RootlineError> {
        self.store()
            .get_person(id)
            .await?
            .ok_or_else(|| RootlineError::NotFound(format!("canonical person {id}")))
    }

    /// Display names of linked parents, keyed by role.
    async fn parent_names(&self, child_id: Uuid) -> Result<HashMap<ParentRole, String>, RootlineError> {
        let mut names = HashMap::new();
        for edge in self.store().parent_edges(child_id).await? {
            if let Some(parent) = self.store().get_person(edge.parent_id).await? {
                names.insert(edge.role, parent.display_name);
            }
        }
        Ok(names)
    }

    fn baseline(
        person: &CanonicalPerson,
        parents: &HashMap<ParentRole, String>,
        field: FieldName,
    ) -> Option<String> {
        let attrs: &PersonAttrs = &person.attrs;
        let value = match field {
            FieldName::Name => Some(person.display_name.clone()),
            FieldName::Gender => attrs.gender.clone(),
            FieldName::BirthDate => attrs.birth_date.clone(),
            FieldName::BirthPlace => attrs.birth_place.clone(),
            FieldName::DeathDate => attrs.death_date.clone(),
            FieldName::DeathPlace => attrs.death_place.clone(),
            FieldName::FatherName => parents.get(&ParentRole::Father).cloned(),
            FieldName::MotherName => parents.get(&ParentRole::Mother).cloned(),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    pub async fn field_comparison(&self, canonical_id: Uuid) -> Result<PersonComparison, RootlineError> {
        let person = self.person(canonical_id).await?;
        let parents = self.parent_names(canonical_id).await?;
        let records = self.store().latest_records(canonical_id).await?;
        let overrides = self
            .store()
            .overrides_for(EntityType::Person, &canonical_id.to_string())
            .await?;

        let fields = FieldName::ALL
            .into_iter()
            .map(|field| {
                let baseline = Self::baseline(&person, &parents, field);
                let override_value = overrides
                    .iter()
                    .find(|o| o.field_name == field.as_str())
                    .and_then(|o| o.override_value.clone());

                let providers: Vec<ProviderValue> = records
                    .iter()
                    .map(|r| {
                        let value = non_empty(r.field(field)).map(String::from);
                        ProviderValue {
                            provider: r.source,
                            status: classify(baseline.as_deref(), value.as_deref()),
                            value,
                            scraped_at: r.scraped_at,
                        }
                    })
                    .collect();

                let display_value = override_value
                    .clone()
                    .or_else(|| baseline.clone())
                    .or_else(|| providers.iter().find_map(|p| p.value.clone()));

                FieldComparison {
                    field,
                    baseline,
                    override_value,
                    display_value,
                    providers,
                }
            })
            .collect();

        Ok(PersonComparison {
            canonical_id,
            fields,
        })
    }

    async fn latest_snapshot(
        &self,
        canonical_id: Uuid,
        provider: Provider,
    ) -> Result<ScrapedRecord, RootlineError> {
        self.store()
            .latest_records(canonical_id)
            .await?
            .into_iter()
            .find(|r| r.source == provider)
            .ok_or_else(|| {
                RootlineError::NotFound(format!("{provider} snapshot for {canonical_id}"))
            })
    }

    /// Accept `provider`'s value for `field`. Scalar fields become a local
    /// override; parent fields become a parent edge.
    pub async fn apply_provider_value(
        &self,
        entity_id: Uuid,
        field: FieldName,
        provider: Provider,
        value: &str,
    ) -> Result<ApplyOutcome, RootlineError> {
        let person = self.person(entity_id).await?;
        let snapshot = self.latest_snapshot(entity_id, provider).await?;

        let shown = snapshot.field(field).unwrap_or_default();
        if normalize_value(shown) != normalize_value(value) {
            return Err(RootlineError::Validation(format!(
                "{provider} shows {field} as {shown:?}, not {value:?}"
            )));
        }

        if let Some(role) = field.parent_role() {
            return self.link_parent(&person, role, &snapshot, value).await;
        }

        let parents = self.parent_names(entity_id).await?;
        let now = Utc::now();
        let ov = LocalOverride {
            id: Uuid::new_v4(),
            entity_type: EntityType::Person,
            entity_id: entity_id.to_string(),
            field_name: field.as_str().to_string(),
            original_value: Self::baseline(&person, &parents, field),
            override_value: Some(value.trim().to_string()),
            created_at: now,
            updated_at: now,
        };
        let stored = self.store().upsert_override(&ov).await?;
        info!(
            canonical_id = %entity_id,
            field = %field,
            provider = %provider,
            "Override saved"
        );
        Ok(ApplyOutcome::OverrideSaved(stored))
    }

    async fn link_parent(
        &self,
        child: &CanonicalPerson,
        role: ParentRole,
        snapshot: &ScrapedRecord,
        name: &str,
    ) -> Result<ApplyOutcome, RootlineError> {
        let provider = snapshot.source;
        let parent_external_id = snapshot.parent_external_id(role).ok_or_else(|| {
            RootlineError::Validation(format!(
                "{provider} names a {role} but links no record for them"
            ))
        })?;

        let candidate_id = self
            .identity
            .get_or_create_canonical_id(provider, parent_external_id, name, PersonAttrs::default())
            .await?;
        let candidate = self.person(candidate_id).await?;

        let role_match = snapshot.parent_source != Some(ParentSource::LinkOrder);
        let confidence = link_confidence(role_match, names_match(&candidate.display_name, name));

        if confidence < self.auto_link_threshold {
            info!(
                child = %child.id,
                role = %role,
                candidate = %candidate_id,
                confidence,
                "Parent candidate below auto-link threshold"
            );
            return Ok(ApplyOutcome::NeedsConfirmation {
                candidate_id,
                confidence,
            });
        }

        let edge = self
            .add_edge(child.id, candidate_id, role, Some(provider), confidence)
            .await?;
        Ok(ApplyOutcome::ParentLinked {
            parent_id: edge.parent_id,
            confidence,
        })
    }

    async fn add_edge(
        &self,
        child_id: Uuid,
        parent_id: Uuid,
        role: ParentRole,
        source: Option<Provider>,
        confidence: f64,
    ) -> Result<ParentEdge, RootlineError> {
        if child_id == parent_id {
            return Err(RootlineError::Validation(format!(
                "{child_id} cannot be their own {role}"
            )));
        }
        let edge = ParentEdge {
            child_id,
            parent_id,
            role,
            source,
            confidence,
            created_at: Utc::now(),
        };
        let kept = self.store().add_parent_edge(&edge).await?;
        if kept.parent_id != parent_id {
            warn!(
                child = %child_id,
                role = %role,
                existing = %kept.parent_id,
                requested = %parent_id,
                "Parent conflict"
            );
            return Err(RootlineError::ParentConflict {
                child: child_id,
                role,
                existing: kept.parent_id,
                requested: parent_id,
            });
        }
        info!(child = %child_id, role = %role, parent = %parent_id, confidence, "Parent linked");
        Ok(kept)
    }

    /// Record a parent edge the user confirmed by hand.
    pub async fn confirm_parent_link(
        &self,
        child_id: Uuid,
        parent_id: Uuid,
        role: ParentRole,
    ) -> Result<ParentEdge, RootlineError> {
        self.person(child_id).await?;
        self.person(parent_id).await?;
        self.add_edge(child_id, parent_id, role, None, 1.0).await
    }

    /// Drop the override so the baseline is displayed again.
    pub async fn revert_override(&self, entity_id: Uuid, field: FieldName) -> Result<bool, RootlineError> {
        let removed = self
            .store()
            .delete_override(EntityType::Person, &entity_id.to_string(), field.as_str())
            .await?;
        if removed {
            info!(canonical_id = %entity_id, field = %field, "Override reverted");
        }
        Ok(removed)
    }

    /// Fields that changed between the two newest snapshots from `provider`.
    pub async fn snapshot_changes(
        &self,
        canonical_id: Uuid,
        provider: Provider,
    ) -> Result<Vec<FieldChange>, RootlineError> {
        let recent = self.store().recent_records(canonical_id, provider, 2).await?;
        let [current, previous] = recent.as_slice() else {
            return Ok(Vec::new());
        };

        Ok(FieldName::ALL
            .into_iter()
            .filter_map(|field| {
                let before = non_empty(previous.field(field));
                let after = non_empty(current.field(field));
                let same = match (before, after) {
                    (Some(a), Some(b)) => normalize_value(a) == normalize_value(b),
                    (None, None) => true,
                    _ => false,
                };
                (!same).then(|| FieldChange {
                    field,
                    previous: before.map(String::from),
                    current: after.map(String::from),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_baseline() {
        assert_eq!(classify(Some("John Smith"), Some("John Smith")), ComparisonStatus::Match);
        assert_eq!(
            classify(Some("John Smith"), Some("Jonathan Smith")),
            ComparisonStatus::Different
        );
        assert_eq!(classify(None, Some("1850")), ComparisonStatus::MissingLocal);
        assert_eq!(classify(Some("1850"), None), ComparisonStatus::MissingProvider);
        assert_eq!(classify(None, None), ComparisonStatus::MissingProvider);
    }

    #[test]
    fn normalization_ignores_case_and_spacing() {
        assert_eq!(classify(Some(" john  SMITH "), Some("John Smith")), ComparisonStatus::Match);
        assert_eq!(classify(Some(""), Some("York")), ComparisonStatus::MissingLocal);
        assert_eq!(classify(Some("York"), Some("   ")), ComparisonStatus::MissingProvider);
    }

    #[test]
    fn confidence_scoring() {
        assert_eq!(link_confidence(true, false), 0.7);
        assert_eq!(link_confidence(true, true), 1.0);
        assert!((link_confidence(false, true) - 0.3).abs() < f64::EPSILON);
        assert_eq!(link_confidence(false, false), 0.0);
    }

    #[test]
    fn empty_names_never_match() {
        assert!(!names_match("", "  "));
        assert!(names_match("Ann  Lee", "ann lee"));
    }
}
