// Test mocks for the sync engine.
//
// Three mocks matching the trait boundaries the engine talks through:
// - MockScraper (ProviderScraper) — HashMap-based external ID→record, with
//   scripted failures and session expiry
// - MockCredentials (CredentialStore) — fixed provider→credentials table
// - MockPageFactory (PageFactory) — HashMap-based URL→HTML pages
//
// Plus helpers for building records, settings and deps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use rootline_common::{
    ParentIds, ParentSource, Provider, RootlineError, ScrapedRecord, SyncSettings, TreeSummary,
};
use rootline_store::MemoryStore;

use crate::browser::{BrowserPage, PageFactory};
use crate::credentials::{CredentialStore, Credentials};
use crate::deps::SyncDeps;
use crate::providers::ProviderScraper;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pacing and backoff disabled so tests run at full speed.
pub fn test_settings() -> SyncSettings {
    SyncSettings::unpaced()
}

pub fn test_deps(store: Arc<MemoryStore>, credentials: MockCredentials) -> SyncDeps {
    SyncDeps::builder()
        .store(store)
        .credentials(Arc::new(credentials))
        .settings(test_settings())
        .build()
}

/// A snapshot as a provider page would yield it.
pub fn record(
    provider: Provider,
    external_id: &str,
    name: &str,
    father: Option<&str>,
    mother: Option<&str>,
) -> ScrapedRecord {
    let url = format!("https://{}.test/person/{external_id}", provider.as_str());
    let mut record = ScrapedRecord::new(provider, external_id, &url);
    record.name = Some(name.to_string());
    record.father_external_id = father.map(String::from);
    record.mother_external_id = mother.map(String::from);
    if father.is_some() || mother.is_some() {
        record.parent_source = Some(ParentSource::RoleTagged);
    }
    record
}

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Extraction,
    Transient,
    Authentication,
    Permanent(u16),
}

impl MockFailure {
    fn to_error(self, provider: Provider, external_id: &str) -> RootlineError {
        match self {
            MockFailure::Extraction => RootlineError::extraction(external_id, "selector not found"),
            MockFailure::Transient => RootlineError::NetworkTransient("connection reset".into()),
            MockFailure::Authentication => RootlineError::Authentication {
                provider,
                message: "redirected to login".into(),
            },
            MockFailure::Permanent(status) => RootlineError::NetworkPermanent {
                status,
                message: "rejected".into(),
            },
        }
    }
}

/// HashMap-based scraper. Unregistered IDs fail with an extraction error.
/// Builder pattern: `.with_person()`, `.with_record()`, `.with_failure()`,
/// `.with_flaky()`, `.with_flaky_login()`, `.with_family()`, `.logged_out()`,
/// `.accepting_login()`.
pub struct MockScraper {
    provider: Provider,
    records: HashMap<String, ScrapedRecord>,
    failures: HashMap<String, MockFailure>,
    flaky: Mutex<HashMap<String, u32>>,
    /// Login checks numbered `(after, after + times]` fail transiently.
    flaky_login: Option<(u32, u32)>,
    /// Parents served by a separate family view, when one is scripted.
    family: Option<HashMap<String, ParentIds>>,
    trees: Vec<TreeSummary>,
    accepted_login: Option<(String, String)>,
    expire_after: Option<usize>,
    delay: Duration,
    logged_in: AtomicBool,
    logins: AtomicU32,
    login_checks: AtomicU32,
    calls: Mutex<Vec<String>>,
    parent_lookups: Mutex<Vec<String>>,
}

impl MockScraper {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            records: HashMap::new(),
            failures: HashMap::new(),
            flaky: Mutex::new(HashMap::new()),
            flaky_login: None,
            family: None,
            trees: vec![TreeSummary {
                tree_id: "tree-1".into(),
                name: "Family Tree".into(),
                url: None,
            }],
            accepted_login: None,
            expire_after: None,
            delay: Duration::ZERO,
            logged_in: AtomicBool::new(true),
            logins: AtomicU32::new(0),
            login_checks: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            parent_lookups: Mutex::new(Vec::new()),
        }
    }

    pub fn with_person(
        self,
        external_id: &str,
        name: &str,
        father: Option<&str>,
        mother: Option<&str>,
    ) -> Self {
        let record = record(self.provider, external_id, name, father, mother);
        self.with_record(record)
    }

    pub fn with_record(mut self, record: ScrapedRecord) -> Self {
        self.records.insert(record.external_id.clone(), record);
        self
    }

    pub fn with_failure(mut self, external_id: &str, failure: MockFailure) -> Self {
        self.failures.insert(external_id.to_string(), failure);
        self
    }

    /// The first `times` fetches of `external_id` fail transiently.
    pub fn with_flaky(self, external_id: &str, times: u32) -> Self {
        self.flaky
            .lock()
            .unwrap()
            .insert(external_id.to_string(), times);
        self
    }

    /// After `after` successful login checks, the next `times` fail transiently.
    pub fn with_flaky_login(mut self, after: u32, times: u32) -> Self {
        self.flaky_login = Some((after, times));
        self
    }

    /// Give the provider a separate family view listing these parents.
    /// Persons without an entry fail extraction on that view.
    pub fn with_family(mut self, external_id: &str, father: Option<&str>, mother: Option<&str>) -> Self {
        self.family.get_or_insert_with(HashMap::new).insert(
            external_id.to_string(),
            ParentIds {
                father_id: father.map(String::from),
                mother_id: mother.map(String::from),
                father_name: None,
                mother_name: None,
                source: ParentSource::RoleTagged,
            },
        );
        self
    }

    pub fn logged_out(self) -> Self {
        self.logged_in.store(false, Ordering::SeqCst);
        self
    }

    pub fn accepting_login(mut self, username: &str, secret: &str) -> Self {
        self.accepted_login = Some((username.to_string(), secret.to_string()));
        self
    }

    /// The session lapses once `scrapes` person fetches have been made.
    pub fn expire_session_after(mut self, scrapes: usize) -> Self {
        self.expire_after = Some(scrapes);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// External IDs passed to `scrape_person_by_id`, in call order.
    pub fn scrape_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// External IDs passed to `extract_parent_ids`, in call order.
    pub fn parent_lookups(&self) -> Vec<String> {
        self.parent_lookups.lock().unwrap().clone()
    }

    pub fn login_attempts(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderScraper for MockScraper {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn check_login_status(&self) -> Result<bool, RootlineError> {
        let check = self.login_checks.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, times)) = self.flaky_login {
            if check > after && check <= after + times {
                return Err(MockFailure::Transient.to_error(self.provider, "login-check"));
            }
        }
        Ok(self.logged_in.load(Ordering::SeqCst))
    }

    async fn perform_login(&self, username: &str, secret: &str) -> Result<(), RootlineError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        match &self.accepted_login {
            Some((u, s)) if u == username && s == secret => {
                self.logged_in.store(true, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(RootlineError::Authentication {
                provider: self.provider,
                message: "credentials rejected".into(),
            }),
        }
    }

    async fn scrape_person_by_id(&self, external_id: &str) -> Result<ScrapedRecord, RootlineError> {
        let made = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(external_id.to_string());
            calls.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if !self.logged_in.load(Ordering::SeqCst) {
            return Err(MockFailure::Authentication.to_error(self.provider, external_id));
        }
        if self.expire_after == Some(made) {
            self.logged_in.store(false, Ordering::SeqCst);
        }

        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(external_id).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(MockFailure::Transient.to_error(self.provider, external_id));
            }
        }
        if let Some(failure) = self.failures.get(external_id) {
            return Err(failure.to_error(self.provider, external_id));
        }

        self.records
            .get(external_id)
            .cloned()
            .ok_or_else(|| RootlineError::extraction(external_id, "no such person"))
    }

    async fn extract_parent_ids(&self, external_id: &str) -> Result<ParentIds, RootlineError> {
        self.parent_lookups
            .lock()
            .unwrap()
            .push(external_id.to_string());
        if let Some(family) = &self.family {
            return family
                .get(external_id)
                .cloned()
                .ok_or_else(|| RootlineError::extraction(external_id, "family view did not render"));
        }
        let record = self
            .records
            .get(external_id)
            .ok_or_else(|| RootlineError::extraction(external_id, "no such person"))?;
        Ok(ParentIds {
            father_id: record.father_external_id.clone(),
            mother_id: record.mother_external_id.clone(),
            father_name: record.father_name.clone(),
            mother_name: record.mother_name.clone(),
            source: record.parent_source.unwrap_or(ParentSource::RoleTagged),
        })
    }

    async fn list_trees(&self) -> Result<Vec<TreeSummary>, RootlineError> {
        Ok(self.trees.clone())
    }

    fn has_family_view(&self) -> bool {
        self.family.is_some()
    }
}

// ---------------------------------------------------------------------------
// MockCredentials
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockCredentials {
    entries: HashMap<Provider, Credentials>,
}

impl MockCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Provider, username: &str, secret: &str) -> Self {
        self.entries.insert(
            provider,
            Credentials {
                username: username.to_string(),
                secret: secret.to_string(),
            },
        );
        self
    }
}

impl CredentialStore for MockCredentials {
    fn credentials_for(&self, provider: Provider) -> Option<Credentials> {
        self.entries.get(&provider).cloned()
    }
}

// ---------------------------------------------------------------------------
// MockPageFactory
// ---------------------------------------------------------------------------

/// Hands out pages that render registered HTML. Unregistered URLs render
/// an empty document.
#[derive(Default)]
pub struct MockPageFactory {
    pages: Arc<HashMap<String, String>>,
}

impl MockPageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        Arc::make_mut(&mut self.pages).insert(url.to_string(), html.to_string());
        self
    }
}

impl PageFactory for MockPageFactory {
    fn create(&self) -> Box<dyn BrowserPage> {
        Box::new(MockPage {
            pages: self.pages.clone(),
            url: None,
            html: String::new(),
        })
    }
}

pub struct MockPage {
    pages: Arc<HashMap<String, String>>,
    url: Option<String>,
    html: String,
}

#[async_trait]
impl BrowserPage for MockPage {
    async fn goto(&mut self, url: &str) -> browserless_client::Result<()> {
        self.html = self.pages.get(url).cloned().unwrap_or_default();
        self.url = Some(url.to_string());
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> browserless_client::Result<bool> {
        Ok(self.exists(selector))
    }

    async fn fill(&mut self, _selector: &str, _value: &str) -> browserless_client::Result<()> {
        Ok(())
    }

    async fn click(&mut self, _selector: &str) -> browserless_client::Result<()> {
        Ok(())
    }

    fn html(&self) -> &str {
        &self.html
    }

    fn current_url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}
