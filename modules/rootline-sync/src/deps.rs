use std::sync::Arc;

use typed_builder::TypedBuilder;

use rootline_common::SyncSettings;
use rootline_store::FamilyStore;

use crate::crawler::AncestorCrawler;
use crate::credentials::CredentialStore;
use crate::hints::HintProcessor;
use crate::identity::IdentityResolver;
use crate::operations::{OperationController, OperationRegistry};
use crate::pacing::RateLimiter;
use crate::reconcile::ReconciliationEngine;
use crate::session::SessionKeeper;

/// Shared dependency container for the sync engine. Holds long-lived,
/// cloneable resources; engine components are built from it.
#[derive(Clone, TypedBuilder)]
pub struct SyncDeps {
    pub store: Arc<dyn FamilyStore>,
    pub credentials: Arc<dyn CredentialStore>,
    #[builder(default)]
    pub settings: SyncSettings,
}

impl SyncDeps {
    pub fn identity(&self) -> Arc<IdentityResolver> {
        Arc::new(IdentityResolver::new(self.store.clone()))
    }

    pub fn session(&self) -> Arc<SessionKeeper> {
        Arc::new(SessionKeeper::new(
            self.credentials.clone(),
            self.settings.auto_login,
        ))
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(&self.settings))
    }

    pub fn reconciler(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(self.identity(), self.settings.auto_link_threshold)
    }

    /// Crawler and hint processor sharing one session keeper and one
    /// per-provider pacing clock.
    pub fn workers(&self) -> (AncestorCrawler, HintProcessor) {
        let identity = self.identity();
        let session = self.session();
        let limiter = self.rate_limiter();
        let crawler = AncestorCrawler::new(
            identity.clone(),
            session.clone(),
            limiter.clone(),
            &self.settings,
        );
        let hints = HintProcessor::new(identity, session, limiter, &self.settings);
        (crawler, hints)
    }

    pub fn controller(&self, registry: Arc<OperationRegistry>) -> OperationController {
        let (crawler, hints) = self.workers();
        OperationController::new(registry, crawler, hints, self.settings.clone())
    }
}
