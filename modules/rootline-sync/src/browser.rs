//! Browser automation seam.
//!
//! `BrowserPage` is the only thing provider scrapers talk to. The shipped
//! implementation drives a Browserless instance through its `/function`
//! endpoint; every page shares one cookie jar so a login on the interactive
//! page is visible to the crawl pages.
//!
//! DOM queries run synchronously over the last rendered HTML. `scraper::Html`
//! is not `Send`, so it is parsed inside each query and never held across an
//! await.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use browserless_client::{BrowserlessClient, BrowserlessError};
use rootline_common::{Provider, RootlineError};

// ---------------------------------------------------------------------------
// BrowserPage
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&mut self, url: &str) -> browserless_client::Result<()>;

    /// Wait up to `timeout` for `selector`. `Ok(false)` means it never appeared.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> browserless_client::Result<bool>;

    async fn fill(&mut self, selector: &str, value: &str) -> browserless_client::Result<()>;

    async fn click(&mut self, selector: &str) -> browserless_client::Result<()>;

    /// Rendered HTML of the current document.
    fn html(&self) -> &str;

    fn current_url(&self) -> Option<&str>;

    fn text(&self, selector: &str) -> Option<String> {
        select_text(self.html(), selector).into_iter().next()
    }

    fn text_all(&self, selector: &str) -> Vec<String> {
        select_text(self.html(), selector)
    }

    fn attr_all(&self, selector: &str, attr: &str) -> Vec<String> {
        select_attr(self.html(), selector, attr)
    }

    fn links(&self, selector: &str) -> Vec<PageLink> {
        select_links(self.html(), selector)
    }

    fn exists(&self, selector: &str) -> bool {
        !select_text_raw(self.html(), selector).is_empty()
    }
}

/// An anchor's target together with its visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    pub href: String,
    pub text: String,
}

/// Trimmed, whitespace-collapsed text of every element matching `selector`.
/// Empty strings are dropped. An invalid selector matches nothing.
pub fn select_text(html: &str, selector: &str) -> Vec<String> {
    select_text_raw(html, selector)
        .into_iter()
        .map(|t| collapse_whitespace(&t))
        .filter(|t| !t.is_empty())
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn select_text_raw(html: &str, selector: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .map(|el| el.text().collect::<String>())
        .collect()
}

pub fn select_attr(html: &str, selector: &str, attr: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Anchors matching `selector` that carry a non-empty `href`.
pub fn select_links(html: &str, selector: &str) -> Vec<PageLink> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .filter_map(|el| {
            let href = el.value().attr("href")?.trim();
            if href.is_empty() {
                return None;
            }
            Some(PageLink {
                href: href.to_string(),
                text: collapse_whitespace(&el.text().collect::<String>()),
            })
        })
        .collect()
}

/// Map a transport error into the engine taxonomy.
/// `target` names the unit of work (usually the external ID).
pub fn classify_browser_error(provider: Provider, target: &str, err: BrowserlessError) -> RootlineError {
    if err.is_transient() {
        return RootlineError::NetworkTransient(err.to_string());
    }
    match err {
        BrowserlessError::Api { status: 401 | 403, message } => RootlineError::Authentication {
            provider,
            message: format!("browser request rejected: {message}"),
        },
        BrowserlessError::Api { status, message } => {
            RootlineError::NetworkPermanent { status, message }
        }
        other => RootlineError::extraction(target, other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Browserless-backed page
// ---------------------------------------------------------------------------

/// Puppeteer script run by Browserless for every page interaction.
/// Restores the shared cookies, navigates, replays buffered form actions,
/// optionally waits for a selector, then returns the rendered state.
const PAGE_SCRIPT: &str = r#"
export default async function ({ page, context }) {
  if (context.cookies && context.cookies.length) {
    await page.setCookie(...context.cookies);
  }
  await page.goto(context.url, { waitUntil: "networkidle2" });
  for (const action of context.actions || []) {
    if (action.kind === "fill") {
      await page.type(action.selector, action.value);
    } else if (action.kind === "click") {
      await Promise.all([
        page.waitForNavigation({ waitUntil: "networkidle2" }).catch(() => null),
        page.click(action.selector),
      ]);
    }
  }
  let found = true;
  if (context.waitFor) {
    found = await page
      .waitForSelector(context.waitFor, { timeout: context.timeoutMs })
      .then(() => true)
      .catch(() => false);
  }
  return {
    data: { url: page.url(), html: await page.content(), cookies: await page.cookies(), found },
    type: "application/json",
  };
}
"#;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PageAction {
    Fill { selector: String, value: String },
    Click { selector: String },
}

#[derive(Debug, Deserialize)]
struct PageState {
    url: String,
    html: String,
    #[serde(default)]
    cookies: serde_json::Value,
    #[serde(default)]
    found: bool,
}

/// Cookie jar shared by every page created from one factory.
pub type CookieJar = Arc<Mutex<serde_json::Value>>;

pub struct BrowserlessPage {
    client: Arc<BrowserlessClient>,
    cookies: CookieJar,
    url: Option<String>,
    html: String,
    /// Fills are buffered and replayed together with the next click.
    pending: Vec<PageAction>,
}

impl BrowserlessPage {
    pub fn new(client: Arc<BrowserlessClient>, cookies: CookieJar) -> Self {
        Self {
            client,
            cookies,
            url: None,
            html: String::new(),
            pending: Vec::new(),
        }
    }

    fn cookies_snapshot(&self) -> serde_json::Value {
        self.cookies
            .lock()
            .map(|c| c.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    async fn render(
        &mut self,
        url: &str,
        actions: Vec<PageAction>,
        wait_for: Option<(&str, Duration)>,
    ) -> browserless_client::Result<bool> {
        let context = serde_json::json!({
            "url": url,
            "cookies": self.cookies_snapshot(),
            "actions": actions,
            "waitFor": wait_for.map(|(s, _)| s),
            "timeoutMs": wait_for.map(|(_, t)| t.as_millis() as u64),
        });

        let state: PageState = self.client.function(PAGE_SCRIPT, context).await?;
        debug!(url = state.url.as_str(), bytes = state.html.len(), "Page rendered");

        if state.cookies.is_array() {
            if let Ok(mut jar) = self.cookies.lock() {
                *jar = state.cookies;
            }
        }
        self.url = Some(state.url);
        self.html = state.html;
        Ok(state.found)
    }

    fn require_url(&self) -> browserless_client::Result<String> {
        self.url
            .clone()
            .ok_or_else(|| BrowserlessError::Parse("page has not navigated yet".into()))
    }
}

#[async_trait]
impl BrowserPage for BrowserlessPage {
    async fn goto(&mut self, url: &str) -> browserless_client::Result<()> {
        self.pending.clear();
        self.render(url, Vec::new(), None).await?;
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> browserless_client::Result<bool> {
        if self.exists(selector) {
            return Ok(true);
        }
        let url = self.require_url()?;
        self.render(&url, Vec::new(), Some((selector, timeout))).await
    }

    async fn fill(&mut self, selector: &str, value: &str) -> browserless_client::Result<()> {
        self.pending.push(PageAction::Fill {
            selector: selector.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> browserless_client::Result<()> {
        let url = self.require_url()?;
        let mut actions = std::mem::take(&mut self.pending);
        actions.push(PageAction::Click {
            selector: selector.to_string(),
        });
        self.render(&url, actions, None).await?;
        Ok(())
    }

    fn html(&self) -> &str {
        &self.html
    }

    fn current_url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Page pool
// ---------------------------------------------------------------------------

pub trait PageFactory: Send + Sync {
    fn create(&self) -> Box<dyn BrowserPage>;
}

pub struct BrowserlessPageFactory {
    client: Arc<BrowserlessClient>,
    cookies: CookieJar,
}

impl BrowserlessPageFactory {
    pub fn new(client: BrowserlessClient) -> Self {
        Self {
            client: Arc::new(client),
            cookies: Arc::new(Mutex::new(serde_json::Value::Array(Vec::new()))),
        }
    }
}

impl PageFactory for BrowserlessPageFactory {
    fn create(&self) -> Box<dyn BrowserPage> {
        Box::new(BrowserlessPage::new(self.client.clone(), self.cookies.clone()))
    }
}

type IdlePages = Arc<Mutex<Vec<Box<dyn BrowserPage>>>>;

/// Bounded pool of crawl pages plus one page reserved for login flows.
pub struct PagePool {
    factory: Arc<dyn PageFactory>,
    permits: Arc<Semaphore>,
    idle: IdlePages,
    interactive: tokio::sync::Mutex<Box<dyn BrowserPage>>,
}

impl PagePool {
    pub fn new(factory: Arc<dyn PageFactory>, size: usize) -> Self {
        let size = size.max(1);
        info!(size, "Page pool ready (plus one interactive page)");
        Self {
            interactive: tokio::sync::Mutex::new(factory.create()),
            factory,
            permits: Arc::new(Semaphore::new(size)),
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wait for a free crawl page. The lease returns it to the pool on drop.
    pub async fn acquire(&self) -> Result<PageLease, RootlineError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RootlineError::Anyhow(anyhow::anyhow!("page pool closed: {e}")))?;

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let page = reused.unwrap_or_else(|| self.factory.create());

        Ok(PageLease {
            page: Some(page),
            idle: self.idle.clone(),
            _permit: permit,
        })
    }

    /// Exclusive access to the interactive page used for login.
    pub async fn interactive(&self) -> tokio::sync::MutexGuard<'_, Box<dyn BrowserPage>> {
        self.interactive.lock().await
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|i| i.len()).unwrap_or(0)
    }
}

/// Scoped page checkout. Dropping it, on any exit path, returns the page.
pub struct PageLease {
    page: Option<Box<dyn BrowserPage>>,
    idle: IdlePages,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PageLease {
    type Target = dyn BrowserPage;

    fn deref(&self) -> &Self::Target {
        self.page.as_deref().expect("lease holds a page until dropped")
    }
}

impl DerefMut for PageLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.page
            .as_deref_mut()
            .expect("lease holds a page until dropped")
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            if let Ok(mut idle) = self.idle.lock() {
                idle.push(page);
            }
        }
    }
}
