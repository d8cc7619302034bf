pub mod profile;
pub mod profiled;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use rootline_common::{ParentIds, Provider, RootlineError, ScrapedRecord, SyncSettings, TreeSummary};

use crate::browser::PagePool;

pub use profiled::ProfiledScraper;

/// Capability set every genealogy provider implements.
#[async_trait]
pub trait ProviderScraper: Send + Sync {
    fn provider(&self) -> Provider;

    async fn check_login_status(&self) -> Result<bool, RootlineError>;

    async fn perform_login(&self, username: &str, secret: &str) -> Result<(), RootlineError>;

    async fn scrape_person_by_id(&self, external_id: &str) -> Result<ScrapedRecord, RootlineError>;

    async fn extract_parent_ids(&self, external_id: &str) -> Result<ParentIds, RootlineError>;

    /// Whether family members live on a view separate from the person page,
    /// so `extract_parent_ids` can find parents the person page lacks.
    fn has_family_view(&self) -> bool {
        false
    }

    async fn list_trees(&self) -> Result<Vec<TreeSummary>, RootlineError>;
}

/// Provider enum → scraper. Explicit registrations take precedence over the
/// profile-driven default.
pub struct ScraperRegistry {
    pool: Arc<PagePool>,
    settings: SyncSettings,
    registered: HashMap<Provider, Arc<dyn ProviderScraper>>,
}

impl ScraperRegistry {
    pub fn new(pool: Arc<PagePool>, settings: SyncSettings) -> Self {
        Self {
            pool,
            settings,
            registered: HashMap::new(),
        }
    }

    pub fn register(&mut self, scraper: Arc<dyn ProviderScraper>) {
        self.registered.insert(scraper.provider(), scraper);
    }

    pub fn build(&self, provider: Provider) -> Result<Arc<dyn ProviderScraper>, RootlineError> {
        if let Some(scraper) = self.registered.get(&provider) {
            return Ok(scraper.clone());
        }
        let scraper = ProfiledScraper::new(provider, self.pool.clone(), &self.settings)?;
        Ok(Arc::new(scraper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPageFactory, MockScraper};

    fn registry() -> ScraperRegistry {
        let pool = Arc::new(PagePool::new(Arc::new(MockPageFactory::new()), 1));
        ScraperRegistry::new(pool, SyncSettings::unpaced())
    }

    #[test]
    fn builds_a_scraper_for_every_provider() {
        let registry = registry();
        for provider in Provider::ALL {
            assert_eq!(registry.build(provider).unwrap().provider(), provider);
        }
    }

    #[tokio::test]
    async fn registered_scraper_takes_precedence() {
        let mut registry = registry();
        let mock = Arc::new(MockScraper::new(Provider::Geni).with_person("G1", "Ada", None, None));
        registry.register(mock);

        let scraper = registry.build(Provider::Geni).unwrap();
        let record = scraper.scrape_person_by_id("G1").await.unwrap();
        assert_eq!(record.name.as_deref(), Some("Ada"));
    }
}
