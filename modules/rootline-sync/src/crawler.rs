//! Breadth-first ancestor traversal over one provider.
//!
//! The crawl is a lazy stream: nothing is fetched until it is polled, and
//! each poll advances by at most one person. Dropping the stream stops the
//! traversal between units.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_stream::try_stream;
use chrono::Utc;
use futures::Stream;
use tracing::{error, info, warn};
use uuid::Uuid;

use rootline_common::{
    ParentEdge, ParentIds, ParentRole, ParentSource, RootlineError, ScrapedRecord, SyncSettings,
};

use crate::identity::IdentityResolver;
use crate::pacing::{ConsecutiveFailures, RateLimiter, RetryPolicy};
use crate::providers::ProviderScraper;
use crate::session::SessionKeeper;

/// One unit of crawl output.
#[derive(Debug, Clone)]
pub enum CrawlStep {
    Scraped {
        generation: u32,
        canonical_id: Uuid,
        record: ScrapedRecord,
    },
    /// Non-fatal failure recorded against one person; traversal continues.
    Failed {
        generation: u32,
        external_id: String,
        error: String,
    },
    /// Circuit breaker tripped. Always the last item.
    Halted { consecutive_failures: u32 },
}

impl CrawlStep {
    pub fn external_id(&self) -> Option<&str> {
        match self {
            CrawlStep::Scraped { record, .. } => Some(&record.external_id),
            CrawlStep::Failed { external_id, .. } => Some(external_id),
            CrawlStep::Halted { .. } => None,
        }
    }
}

/// Persons a full binary ancestor tree of `max_generations` holds.
pub fn full_tree_size(max_generations: u32) -> u64 {
    let g = max_generations.min(62);
    (1u64 << (g + 1)) - 1
}

struct Pending {
    external_id: String,
    generation: u32,
    /// Child whose parent this entry is, with the role it fills.
    child: Option<(Uuid, ParentRole)>,
}

#[derive(Clone)]
pub struct AncestorCrawler {
    identity: Arc<IdentityResolver>,
    session: Arc<SessionKeeper>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    max_consecutive_failures: u32,
}

impl AncestorCrawler {
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
            max_consecutive_failures: settings.max_consecutive_failures,
        }
    }

    /// Login check, paced scrape and, when the provider keeps family on a
    /// separate view and the page named no parents, a paced parent lookup.
    /// Parents are `None` when `wants_parents` is false.
    async fn fetch_person(
        &self,
        scraper: &dyn ProviderScraper,
        external_id: &str,
        wants_parents: bool,
    ) -> Result<(ScrapedRecord, Option<ParentIds>), RootlineError> {
        let provider = scraper.provider();
        self.retry
            .run("login-check", || self.session.ensure_logged_in(scraper))
            .await?;
        self.limiter.wait(provider).await;

        let record = self
            .retry
            .run(external_id, || scraper.scrape_person_by_id(external_id))
            .await?;
        if !wants_parents {
            return Ok((record, None));
        }

        let parents = if record.father_external_id.is_none()
            && record.mother_external_id.is_none()
            && scraper.has_family_view()
        {
            self.limiter.wait(provider).await;
            self.retry
                .run(external_id, || scraper.extract_parent_ids(external_id))
                .await?
        } else {
            ParentIds {
                father_id: record.father_external_id.clone(),
                mother_id: record.mother_external_id.clone(),
                father_name: record.father_name.clone(),
                mother_name: record.mother_name.clone(),
                source: record.parent_source.unwrap_or(ParentSource::RoleTagged),
            }
        };
        Ok((record, Some(parents)))
    }

    /// Walk ancestors of `root_external_id`, generation by generation,
    /// father before mother. Authentication and storage failures end the
    /// stream with an error; extraction failures and exhausted transient
    /// retries are yielded as `Failed`.
    pub fn crawl_ancestors(
        &self,
        scraper: Arc<dyn ProviderScraper>,
        root_external_id: &str,
        max_generations: u32,
    ) -> impl Stream<Item = Result<CrawlStep, RootlineError>> + Send + 'static {
        let this = self.clone();
        let root = root_external_id.trim().to_string();

        try_stream! {
            let provider = scraper.provider();
            let store = this.identity.store().clone();
            let mut breaker = ConsecutiveFailures::new(this.max_consecutive_failures);
            let mut visited: HashSet<String> = HashSet::from([root.clone()]);
            let mut queue = VecDeque::from([Pending {
                external_id: root,
                generation: 0,
                child: None,
            }]);

            info!(provider = %provider, max_generations, "Ancestor crawl starting");

            while let Some(entry) = queue.pop_front() {
                let external_id = entry.external_id.as_str();

                let wants_parents = entry.generation < max_generations;
                let (record, parents) = match this
                    .fetch_person(scraper.as_ref(), external_id, wants_parents)
                    .await
                {
                    Ok(fetched) => fetched,
                    Err(e) if !e.is_fatal() => {
                        warn!(
                            provider = %provider,
                            external_id,
                            generation = entry.generation,
                            error = %e,
                            "Person fetch failed, continuing"
                        );
                        let tripped = breaker.record_failure();
                        yield CrawlStep::Failed {
                            generation: entry.generation,
                            external_id: entry.external_id.clone(),
                            error: e.to_string(),
                        };
                        if tripped {
                            error!(
                                provider = %provider,
                                consecutive_failures = breaker.count(),
                                "Circuit breaker tripped, halting crawl"
                            );
                            yield CrawlStep::Halted {
                                consecutive_failures: breaker.count(),
                            };
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        error!(provider = %provider, external_id, error = %e, "Crawl aborted");
                        Err(e)?
                    }
                };
                breaker.record_success();

                let upsert = this.identity.canonicalize(&record).await?;
                store.save_record(upsert.canonical_id, &record).await?;

                if let Some((child_id, role)) = entry.child {
                    let edge = ParentEdge {
                        child_id,
                        parent_id: upsert.canonical_id,
                        role,
                        source: Some(provider),
                        confidence: 1.0,
                        created_at: Utc::now(),
                    };
                    let kept = store.add_parent_edge(&edge).await?;
                    if kept.parent_id != upsert.canonical_id {
                        warn!(
                            child = %child_id,
                            role = %role,
                            existing = %kept.parent_id,
                            scraped = %upsert.canonical_id,
                            "Child already has a different parent in this role, keeping existing"
                        );
                    }
                }

                if let Some(parents) = parents {
                    for (role, parent_id) in [
                        (ParentRole::Father, parents.father_id),
                        (ParentRole::Mother, parents.mother_id),
                    ] {
                        let Some(parent_id) = parent_id.map(|id| id.trim().to_string()) else {
                            continue;
                        };
                        if parent_id.is_empty() || !visited.insert(parent_id.clone()) {
                            continue;
                        }
                        queue.push_back(Pending {
                            external_id: parent_id,
                            generation: entry.generation + 1,
                            child: Some((upsert.canonical_id, role)),
                        });
                    }
                }

                info!(
                    provider = %provider,
                    external_id,
                    generation = entry.generation,
                    canonical_id = %upsert.canonical_id,
                    queued = queue.len(),
                    "Scraped ancestor"
                );
                yield CrawlStep::Scraped {
                    generation: entry.generation,
                    canonical_id: upsert.canonical_id,
                    record,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_tree_counts_root_and_every_generation() {
        assert_eq!(full_tree_size(0), 1);
        assert_eq!(full_tree_size(1), 3);
        assert_eq!(full_tree_size(5), 63);
    }
}
