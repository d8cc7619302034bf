//! Provider hint review: scrape each suggested candidate, score it against
//! the person it was suggested for and link it when confident.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use rootline_common::{
    Hint, HintStatus, IdentityMeta, ParentRole, Provider, RootlineError, ScrapedRecord,
    SyncSettings,
};

use crate::identity::IdentityResolver;
use crate::pacing::{RateLimiter, RetryPolicy};
use crate::providers::ProviderScraper;
use crate::reconcile::{link_confidence, names_match};
use crate::session::SessionKeeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HintDisposition {
    Accepted,
    NeedsReview,
    /// The candidate identity already belongs to someone else.
    Conflict,
    /// The candidate page could not be scraped.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct HintOutcome {
    pub hint_id: Uuid,
    pub external_id: String,
    pub disposition: HintDisposition,
    pub confidence: Option<f64>,
    pub message: Option<String>,
}

impl HintOutcome {
    fn new(hint: &Hint, disposition: HintDisposition) -> Self {
        Self {
            hint_id: hint.id,
            external_id: hint.external_id.clone(),
            disposition,
            confidence: None,
            message: None,
        }
    }
}

#[derive(Clone)]
pub struct HintProcessor {
    identity: Arc<IdentityResolver>,
    session: Arc<SessionKeeper>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    auto_link_threshold: f64,
}

impl HintProcessor {
    pub fn new(
        identity: Arc<IdentityResolver>,
        session: Arc<SessionKeeper>,
        limiter: Arc<RateLimiter>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            identity,
            session,
            limiter,
            retry: RetryPolicy::from_settings(settings),
            auto_link_threshold: settings.auto_link_threshold,
        }
    }

    pub async fn pending(
        &self,
        provider: Option<Provider>,
        limit: usize,
    ) -> Result<Vec<Hint>, RootlineError> {
        Ok(self.identity.store().pending_hints(provider, limit).await?)
    }

    /// Candidate parents that resolve to parents already linked to the person.
    async fn structural_match(
        &self,
        canonical_id: Uuid,
        candidate: &ScrapedRecord,
    ) -> Result<bool, RootlineError> {
        let store = self.identity.store();
        let known: HashSet<(ParentRole, Uuid)> = store
            .parent_edges(canonical_id)
            .await?
            .into_iter()
            .map(|e| (e.role, e.parent_id))
            .collect();
        if known.is_empty() {
            return Ok(false);
        }

        let mut matched = false;
        for role in [ParentRole::Father, ParentRole::Mother] {
            let Some(parent_ext) = candidate.parent_external_id(role) else {
                continue;
            };
            let Some(resolved) = self.identity.resolve_id(parent_ext, candidate.source).await? else {
                continue;
            };
            if known.contains(&(role, resolved)) {
                matched = true;
            } else if known.iter().any(|(r, _)| *r == role) {
                // A different known parent in the same role rules the candidate out.
                return Ok(false);
            }
        }
        Ok(matched)
    }

    async fn review(
        &self,
        hint: &Hint,
        candidate: &ScrapedRecord,
    ) -> Result<HintOutcome, RootlineError> {
        let store = self.identity.store();
        let person = store
            .get_person(hint.canonical_id)
            .await?
            .ok_or_else(|| RootlineError::NotFound(format!("canonical person {}", hint.canonical_id)))?;

        let structural = self.structural_match(hint.canonical_id, candidate).await?;
        let name = names_match(&person.display_name, candidate.display_name());
        let confidence = link_confidence(structural, name);

        if confidence < self.auto_link_threshold {
            let message = format!("confidence {confidence:.2} below auto-link threshold");
            store
                .update_hint(hint.id, HintStatus::NeedsReview, Some(confidence), Some(&message))
                .await?;
            return Ok(HintOutcome {
                confidence: Some(confidence),
                message: Some(message),
                ..HintOutcome::new(hint, HintDisposition::NeedsReview)
            });
        }

        let meta = IdentityMeta {
            profile_url: Some(candidate.source_url.clone()),
            confidence: Some(confidence),
        };
        match self
            .identity
            .register_external_id(hint.canonical_id, hint.source, &hint.external_id, meta)
            .await
        {
            Ok(_) => {
                store.save_record(hint.canonical_id, candidate).await?;
                store
                    .update_hint(hint.id, HintStatus::Accepted, Some(confidence), None)
                    .await?;
                info!(
                    hint_id = %hint.id,
                    canonical_id = %hint.canonical_id,
                    provider = %hint.source,
                    external_id = %hint.external_id,
                    confidence,
                    "Hint accepted"
                );
                Ok(HintOutcome {
                    confidence: Some(confidence),
                    ..HintOutcome::new(hint, HintDisposition::Accepted)
                })
            }
            Err(e @ (RootlineError::Conflict { .. } | RootlineError::Validation(_))) => {
                let message = e.to_string();
                warn!(hint_id = %hint.id, error = %e, "Hint conflicts with an existing identity");
                store
                    .update_hint(hint.id, HintStatus::NeedsReview, Some(confidence), Some(&message))
                    .await?;
                Ok(HintOutcome {
                    confidence: Some(confidence),
                    message: Some(message),
                    ..HintOutcome::new(hint, HintDisposition::Conflict)
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_candidate(
        &self,
        scraper: &dyn ProviderScraper,
        external_id: &str,
    ) -> Result<ScrapedRecord, RootlineError> {
        self.retry
            .run("login-check", || self.session.ensure_logged_in(scraper))
            .await?;
        self.limiter.wait(scraper.provider()).await;
        self.retry
            .run(external_id, || scraper.scrape_person_by_id(external_id))
            .await
    }

    /// One outcome per hint, in order. Authentication and storage failures
    /// end the stream with an error.
    pub fn process_hints(
        &self,
        scraper: Arc<dyn ProviderScraper>,
        hints: Vec<Hint>,
    ) -> impl Stream<Item = Result<HintOutcome, RootlineError>> + Send + 'static {
        let this = self.clone();

        try_stream! {
            let provider = scraper.provider();
            info!(provider = %provider, hints = hints.len(), "Hint processing starting");

            for hint in hints {
                if hint.source != provider {
                    yield HintOutcome {
                        message: Some(format!("hint is for {}, not {provider}", hint.source)),
                        ..HintOutcome::new(&hint, HintDisposition::Failed)
                    };
                    continue;
                }

                let external_id = hint.external_id.as_str();
                let candidate = match this.fetch_candidate(scraper.as_ref(), external_id).await {
                    Ok(record) => record,
                    Err(e) if !e.is_fatal() => {
                        warn!(hint_id = %hint.id, external_id, error = %e, "Hint candidate scrape failed");
                        yield HintOutcome {
                            message: Some(e.to_string()),
                            ..HintOutcome::new(&hint, HintDisposition::Failed)
                        };
                        continue;
                    }
                    Err(e) => Err(e)?,
                };

                yield this.review(&hint, &candidate).await?;
            }
        }
    }
}
