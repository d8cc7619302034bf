use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use rootline_common::{
    ParentIds, ParentSource, Provider, RootlineError, ScrapedRecord, SyncSettings, TreeSummary,
};

use super::profile::{profile, ProviderProfile, TreeListing};
use super::ProviderScraper;
use crate::browser::{
    classify_browser_error, select_attr, select_links, select_text, PageLease, PagePool,
};

/// Profile-driven scraper. One instance per provider, sharing the page pool.
pub struct ProfiledScraper {
    profile: &'static ProviderProfile,
    pool: Arc<PagePool>,
    selector_timeout: Duration,
    id_re: Regex,
}

impl ProfiledScraper {
    pub fn new(
        provider: Provider,
        pool: Arc<PagePool>,
        settings: &SyncSettings,
    ) -> Result<Self, RootlineError> {
        let profile = profile(provider);
        let id_re = Regex::new(profile.id_pattern)
            .map_err(|e| RootlineError::Config(format!("{provider} id pattern: {e}")))?;
        Ok(Self {
            profile,
            pool,
            selector_timeout: Duration::from_millis(settings.selector_timeout_ms),
            id_re,
        })
    }

    fn classify(&self, target: &str, err: browserless_client::BrowserlessError) -> RootlineError {
        classify_browser_error(self.profile.provider, target, err)
    }

    fn session_expired(&self, detail: &str) -> RootlineError {
        RootlineError::Authentication {
            provider: self.profile.provider,
            message: detail.to_string(),
        }
    }

    /// Navigate a pooled page to the person and wait for the name to render.
    async fn open_person(&self, external_id: &str) -> Result<PageLease, RootlineError> {
        let url = self.profile.person_url(external_id);
        let mut page = self.pool.acquire().await?;

        page.goto(&url)
            .await
            .map_err(|e| self.classify(external_id, e))?;

        if page
            .current_url()
            .is_some_and(|u| self.profile.is_login_redirect(u))
        {
            return Err(self.session_expired("redirected to sign-in while opening a person page"));
        }

        let found = page
            .wait_for_selector(self.profile.fields.name, self.selector_timeout)
            .await
            .map_err(|e| self.classify(external_id, e))?;
        if !found {
            return Err(RootlineError::extraction(
                external_id,
                format!("name selector did not appear within {:?}", self.selector_timeout),
            ));
        }

        Ok(page)
    }
}

#[async_trait]
impl ProviderScraper for ProfiledScraper {
    fn provider(&self) -> Provider {
        self.profile.provider
    }

    async fn check_login_status(&self) -> Result<bool, RootlineError> {
        let mut page = self.pool.interactive().await;
        page.goto(self.profile.home_url)
            .await
            .map_err(|e| self.classify("login-check", e))?;
        if page
            .current_url()
            .is_some_and(|u| self.profile.is_login_redirect(u))
        {
            return Ok(false);
        }
        page.wait_for_selector(self.profile.logged_in, self.selector_timeout)
            .await
            .map_err(|e| self.classify("login-check", e))
    }

    async fn perform_login(&self, username: &str, secret: &str) -> Result<(), RootlineError> {
        let provider = self.profile.provider;
        let selectors = &self.profile.login;
        let mut page = self.pool.interactive().await;

        page.goto(self.profile.login_url)
            .await
            .map_err(|e| self.classify("login", e))?;
        let form = page
            .wait_for_selector(selectors.username, self.selector_timeout)
            .await
            .map_err(|e| self.classify("login", e))?;
        if !form {
            return Err(self.session_expired("login form did not render"));
        }

        page.fill(selectors.username, username)
            .await
            .map_err(|e| self.classify("login", e))?;
        page.fill(selectors.password, secret)
            .await
            .map_err(|e| self.classify("login", e))?;
        page.click(selectors.submit)
            .await
            .map_err(|e| self.classify("login", e))?;

        let signed_in = page
            .wait_for_selector(self.profile.logged_in, self.selector_timeout)
            .await
            .map_err(|e| self.classify("login", e))?;
        if !signed_in {
            return Err(self.session_expired("credentials were rejected"));
        }
        info!(provider = %provider, "Signed in");
        Ok(())
    }

    async fn scrape_person_by_id(&self, external_id: &str) -> Result<ScrapedRecord, RootlineError> {
        let page = self.open_person(external_id).await?;
        let source_url = page
            .current_url()
            .map(String::from)
            .unwrap_or_else(|| self.profile.person_url(external_id));
        parse_person(self.profile, &self.id_re, page.html(), external_id, &source_url)
    }

    async fn extract_parent_ids(&self, external_id: &str) -> Result<ParentIds, RootlineError> {
        let Some(url) = self.profile.family_url(external_id) else {
            let page = self.open_person(external_id).await?;
            return Ok(parse_parents(self.profile, &self.id_re, page.html(), external_id));
        };

        let mut page = self.pool.acquire().await?;
        page.goto(&url)
            .await
            .map_err(|e| self.classify(external_id, e))?;
        if page
            .current_url()
            .is_some_and(|u| self.profile.is_login_redirect(u))
        {
            return Err(self.session_expired("redirected to sign-in while opening a family view"));
        }
        // No parents section rendered means no parents are recorded.
        let listed = page
            .wait_for_selector(self.profile.parents.section, self.selector_timeout)
            .await
            .map_err(|e| self.classify(external_id, e))?;
        if !listed {
            return Ok(ParentIds::none());
        }
        Ok(parse_parents(self.profile, &self.id_re, page.html(), external_id))
    }

    fn has_family_view(&self) -> bool {
        self.profile.family_url.is_some()
    }

    async fn list_trees(&self) -> Result<Vec<TreeSummary>, RootlineError> {
        match &self.profile.trees {
            TreeListing::Shared(name) => Ok(vec![TreeSummary {
                tree_id: self.profile.provider.as_str().to_string(),
                name: name.to_string(),
                url: Some(self.profile.home_url.to_string()),
            }]),
            TreeListing::Page {
                url,
                links,
                id_pattern,
            } => {
                let tree_re = Regex::new(id_pattern)
                    .map_err(|e| RootlineError::Config(format!("tree id pattern: {e}")))?;
                let mut page = self.pool.acquire().await?;
                page.goto(url).await.map_err(|e| self.classify("trees", e))?;
                if page
                    .current_url()
                    .is_some_and(|u| self.profile.is_login_redirect(u))
                {
                    return Err(self.session_expired("redirected to sign-in while listing trees"));
                }
                page.wait_for_selector(links, self.selector_timeout)
                    .await
                    .map_err(|e| self.classify("trees", e))?;
                Ok(parse_trees(page.html(), links, &tree_re, url))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Page parsing
// ---------------------------------------------------------------------------

/// Text of the first match, or its `content` attribute for `<meta>` fields.
fn field_value(html: &str, selector: &str) -> Option<String> {
    select_text(html, selector)
        .into_iter()
        .next()
        .or_else(|| select_attr(html, selector, "content").into_iter().next())
}

fn capture_id(id_re: &Regex, href: &str) -> Option<String> {
    id_re
        .captures(href)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Build a snapshot from a rendered person page. A page without a name is
/// an extraction failure.
pub fn parse_person(
    profile: &ProviderProfile,
    id_re: &Regex,
    html: &str,
    external_id: &str,
    source_url: &str,
) -> Result<ScrapedRecord, RootlineError> {
    let fields = &profile.fields;
    let name = field_value(html, fields.name)
        .ok_or_else(|| RootlineError::extraction(external_id, "person name not found"))?;

    let mut record = ScrapedRecord::new(profile.provider, external_id, source_url);
    record.name = Some(name);
    record.gender = field_value(html, fields.gender);
    record.birth_date = field_value(html, fields.birth_date);
    record.birth_place = field_value(html, fields.birth_place);
    record.death_date = field_value(html, fields.death_date);
    record.death_place = field_value(html, fields.death_place);
    record.photo_url = select_attr(html, fields.photo, "src").into_iter().next();

    let parents = parse_parents(profile, id_re, html, external_id);
    if parents.father_id.is_some() || parents.mother_id.is_some() {
        record.parent_source = Some(parents.source);
    }
    record.father_external_id = parents.father_id;
    record.mother_external_id = parents.mother_id;
    record.father_name = parents.father_name;
    record.mother_name = parents.mother_name;

    let mut seen = HashSet::new();
    record.spouse_external_ids = select_links(html, profile.spouses)
        .iter()
        .filter_map(|l| capture_id(id_re, &l.href))
        .filter(|id| id != external_id && seen.insert(id.clone()))
        .collect();

    debug!(
        provider = %profile.provider,
        external_id,
        father = ?record.father_external_id,
        mother = ?record.mother_external_id,
        "Parsed person page"
    );
    Ok(record)
}

/// Locate parents. Role-labelled links win; otherwise the first two person
/// links in the parents section are taken as father then mother.
pub fn parse_parents(
    profile: &ProviderProfile,
    id_re: &Regex,
    html: &str,
    external_id: &str,
) -> ParentIds {
    let tagged = |selector: &str| {
        select_links(html, selector)
            .into_iter()
            .find_map(|l| capture_id(id_re, &l.href).map(|id| (id, l.text)))
            .filter(|(id, _)| id != external_id)
    };

    let father = tagged(profile.parents.father);
    let mother = tagged(profile.parents.mother);
    if father.is_some() || mother.is_some() {
        let (father_id, father_name) = split(father);
        let (mother_id, mother_name) = split(mother);
        return ParentIds {
            father_id,
            mother_id,
            father_name,
            mother_name,
            source: ParentSource::RoleTagged,
        };
    }

    let mut seen = HashSet::new();
    let mut ordered = select_links(html, profile.parents.section)
        .into_iter()
        .filter_map(|l| capture_id(id_re, &l.href).map(|id| (id, l.text)))
        .filter(|(id, _)| id != external_id && seen.insert(id.clone()));

    let father = ordered.next();
    let mother = ordered.next();
    if father.is_none() {
        return ParentIds::none();
    }

    warn!(
        provider = %profile.provider,
        external_id,
        "Parent roles are not labelled, assigning by link order"
    );
    let (father_id, father_name) = split(father);
    let (mother_id, mother_name) = split(mother);
    ParentIds {
        father_id,
        mother_id,
        father_name,
        mother_name,
        source: ParentSource::LinkOrder,
    }
}

fn split(link: Option<(String, String)>) -> (Option<String>, Option<String>) {
    match link {
        Some((id, name)) => (Some(id), Some(name).filter(|n| !n.is_empty())),
        None => (None, None),
    }
}

fn parse_trees(html: &str, links: &str, tree_re: &Regex, index_url: &str) -> Vec<TreeSummary> {
    let base = url::Url::parse(index_url).ok();
    let mut seen = HashSet::new();
    select_links(html, links)
        .into_iter()
        .filter_map(|l| {
            let tree_id = capture_id(tree_re, &l.href)?;
            if !seen.insert(tree_id.clone()) {
                return None;
            }
            let url = base
                .as_ref()
                .and_then(|b| b.join(&l.href).ok())
                .map(|u| u.to_string());
            Some(TreeSummary {
                tree_id,
                name: l.text,
                url,
            })
        })
        .collect()
}
