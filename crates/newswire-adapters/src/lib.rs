//! Source adapter contracts, feed/page adapter implementations and the image resolver.

use std::io::Cursor;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newswire_core::{is_absolute_http_url, Article, CategoryUrl, DEFAULT_CATEGORY};
use newswire_storage::{ArticleSink, FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newswire-adapters";

pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(12);

static EMBEDDED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"http\S+").expect("static regex compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Feed,
    Page,
}

/// Shared services for one adapter invocation.
pub struct AdapterContext<'a> {
    pub run_id: Uuid,
    pub http: &'a HttpFetcher,
    pub images: &'a ImageResolver,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdapterReport {
    pub categories_attempted: usize,
    pub categories_failed: Vec<String>,
    pub items_emitted: usize,
    pub items_skipped: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unreadable feed: {0}")]
    Feed(String),
    #[error("every category failed for {source_name}: {}", describe_failures(.failures))]
    AllCategoriesFailed {
        source_name: String,
        failures: Vec<CategoryFailure>,
    },
}

/// Why one category of a source could not be scraped; `reason` carries the full cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryFailure {
    pub category: String,
    pub reason: String,
}

fn describe_failures(failures: &[CategoryFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.category, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// `err` and every underlying cause, outermost first.
pub fn error_chain<E>(err: E) -> String
where
    E: std::error::Error + Send + Sync + 'static,
{
    format!("{:#}", anyhow::Error::from(err))
}

/// One source: knows its categories and how to turn them into articles for a sink.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;
    fn base_url(&self) -> &str;
    fn strategy(&self) -> Strategy;
    fn default_categories(&self) -> &[CategoryUrl];

    /// Scrape `categories` (or the adapter's defaults when empty) into `sink`.
    async fn run(
        &self,
        ctx: &AdapterContext<'_>,
        categories: &[CategoryUrl],
        sink: &dyn ArticleSink,
    ) -> Result<AdapterReport, AdapterError>;
}

/// Raw item as found in a feed entry or listing page, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemCandidate {
    pub title: String,
    pub link: String,
    pub subtitle: String,
    pub body: String,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
trait CategoryScraper: Send + Sync {
    fn name(&self) -> &str;
    fn base(&self) -> &str;

    async fn scrape_category(
        &self,
        ctx: &AdapterContext<'_>,
        category: &CategoryUrl,
    ) -> Result<Vec<ItemCandidate>, AdapterError>;
}

async fn drive_categories<A: CategoryScraper + ?Sized>(
    adapter: &A,
    ctx: &AdapterContext<'_>,
    categories: &[CategoryUrl],
    sink: &dyn ArticleSink,
) -> Result<AdapterReport, AdapterError> {
    let mut report = AdapterReport::default();
    let mut failures = Vec::new();

    for category in categories {
        if category.url.trim().is_empty() {
            debug!(category = %category.category, "no url mapped; skipping category");
            continue;
        }
        report.categories_attempted += 1;

        let items = match adapter.scrape_category(ctx, category).await {
            Ok(items) => items,
            Err(err) => {
                let reason = error_chain(err);
                warn!(category = %category.category, url = %category.url, error = %reason, "category failed");
                report.categories_failed.push(category.category.clone());
                failures.push(CategoryFailure {
                    category: category.category.clone(),
                    reason,
                });
                continue;
            }
        };

        for item in items {
            match normalize_item(adapter.name(), adapter.base(), &category.category, item) {
                Some(mut article) => {
                    if !article.has_image() {
                        let resolved = ctx.images.resolve(ctx.http, &article.url).await;
                        article = article.with_image_url(resolved);
                    }
                    sink.save(article).await;
                    report.items_emitted += 1;
                }
                None => report.items_skipped += 1,
            }
        }
    }

    if report.categories_attempted > 0
        && report.categories_failed.len() == report.categories_attempted
    {
        return Err(AdapterError::AllCategoriesFailed {
            source_name: adapter.name().to_string(),
            failures,
        });
    }

    info!(
        categories = report.categories_attempted,
        failed = report.categories_failed.len(),
        emitted = report.items_emitted,
        skipped = report.items_skipped,
        "adapter finished"
    );
    Ok(report)
}

fn normalize_item(
    source_name: &str,
    base_url: &str,
    category: &str,
    item: ItemCandidate,
) -> Option<Article> {
    let title = clean_text(&item.title);
    if title.is_empty() {
        return None;
    }
    let url = resolve_link(base_url, &item.link)?;
    let image = item
        .image_url
        .as_deref()
        .and_then(|src| resolve_link(base_url, src))
        .unwrap_or_default();

    Some(
        Article::new(source_name, title, category, url)
            .with_subtitle(clean_text(&item.subtitle))
            .with_body(clean_text(&item.body))
            .with_image_url(image)
            .with_published_at(item.published_at),
    )
}

/// Collapse whitespace, drop embedded raw URLs and non-breaking spaces.
pub fn clean_text(input: &str) -> String {
    let text = input.replace('\u{a0}', " ");
    let text = EMBEDDED_URL.replace_all(&text, "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain text of an HTML fragment, normalized with [`clean_text`].
pub fn strip_html(fragment: &str) -> String {
    if !fragment.contains('<') {
        return clean_text(fragment);
    }
    let parsed = Html::parse_fragment(fragment);
    let text = parsed.root_element().text().collect::<Vec<_>>().join(" ");
    clean_text(&text)
}

/// Absolute http(s) form of `href`, resolving relative paths against `base_url`.
pub fn resolve_link(base_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    if is_absolute_http_url(href) {
        return Some(href.to_string());
    }
    let joined = Url::parse(base_url).ok()?.join(href).ok()?;
    if matches!(joined.scheme(), "http" | "https") {
        Some(joined.to_string())
    } else {
        None
    }
}

fn parse_selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn non_blank_attr(element: ElementRef<'_>, attr: &str) -> Option<String> {
    element
        .value()
        .attr(attr)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Best-effort representative image for an article page.
#[derive(Debug, Clone, Copy)]
pub struct ImageResolver {
    timeout: Duration,
}

impl Default for ImageResolver {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_TIMEOUT)
    }
}

impl ImageResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Image URL for `page_url`, or an empty string when the page cannot be fetched or has none.
    pub async fn resolve(&self, http: &HttpFetcher, page_url: &str) -> String {
        match http
            .fetch_bytes_with_timeout("image-resolver", page_url, Some(self.timeout))
            .await
        {
            Ok(resp) => extract_image_url(&resp.text(), &resp.final_url).unwrap_or_default(),
            Err(err) => {
                debug!(url = page_url, error = %error_chain(err), "image lookup failed");
                String::new()
            }
        }
    }
}

/// `og:image` (property form, then name form), else the first `<img>`'s `src`.
///
/// Only the first element of each kind is consulted.
pub fn extract_image_url(html: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let candidates = [
        ("meta[property=\"og:image\"]", "content"),
        ("meta[name=\"og:image\"]", "content"),
        ("img", "src"),
    ];

    let found = candidates.iter().find_map(|(css, attr)| {
        let selector = Selector::parse(css).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| non_blank_attr(el, attr))
    })?;

    Some(resolve_link(page_url, &found).unwrap_or(found))
}

/// RSS/Atom backed source.
#[derive(Debug, Clone)]
pub struct FeedAdapter {
    name: String,
    base_url: String,
    categories: Vec<CategoryUrl>,
}

impl FeedAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        categories: Vec<CategoryUrl>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            categories,
        }
    }
}

/// Map every entry of an RSS/Atom document to an [`ItemCandidate`].
pub fn parse_feed_items(bytes: &[u8]) -> Result<Vec<ItemCandidate>, AdapterError> {
    let feed =
        feed_rs::parser::parse(Cursor::new(bytes)).map_err(|e| AdapterError::Feed(e.to_string()))?;

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = select_entry_link(&entry);
            let image_url = select_entry_image(&entry);
            let body = entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
                .unwrap_or_default();
            ItemCandidate {
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                link,
                subtitle: String::new(),
                body: strip_html(&body),
                image_url,
                published_at: entry.published.or(entry.updated),
            }
        })
        .collect())
}

fn select_entry_link(entry: &feed_rs::model::Entry) -> String {
    for link in &entry.links {
        let href = link.href.trim();
        if href.is_empty() {
            continue;
        }
        let rel = link.rel.as_deref().unwrap_or("");
        if rel.is_empty() || rel.eq_ignore_ascii_case("alternate") {
            return href.to_string();
        }
    }
    if let Some(link) = entry.links.iter().find(|l| !l.href.trim().is_empty()) {
        return link.href.trim().to_string();
    }
    let id = entry.id.trim();
    if is_absolute_http_url(id) {
        return id.to_string();
    }
    String::new()
}

fn select_entry_image(entry: &feed_rs::model::Entry) -> Option<String> {
    for media in &entry.media {
        if let Some(thumb) = media.thumbnails.iter().find(|t| !t.image.uri.trim().is_empty()) {
            return Some(thumb.image.uri.trim().to_string());
        }
        for content in &media.content {
            let Some(url) = content.url.as_ref().map(|u| u.as_str()) else {
                continue;
            };
            let is_image = content
                .content_type
                .as_ref()
                .map(|m| m.to_string().starts_with("image/"))
                .unwrap_or(false);
            if is_image {
                return Some(url.to_string());
            }
        }
    }
    None
}

#[async_trait]
impl CategoryScraper for FeedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> &str {
        &self.base_url
    }

    async fn scrape_category(
        &self,
        ctx: &AdapterContext<'_>,
        category: &CategoryUrl,
    ) -> Result<Vec<ItemCandidate>, AdapterError> {
        let resp = ctx.http.fetch_bytes(&self.name, &category.url).await?;
        parse_feed_items(&resp.body)
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn strategy(&self) -> Strategy {
        Strategy::Feed
    }

    fn default_categories(&self) -> &[CategoryUrl] {
        &self.categories
    }

    async fn run(
        &self,
        ctx: &AdapterContext<'_>,
        categories: &[CategoryUrl],
        sink: &dyn ArticleSink,
    ) -> Result<AdapterReport, AdapterError> {
        let categories = if categories.is_empty() {
            self.default_categories()
        } else {
            categories
        };
        let span = info_span!("adapter", source = %self.name, run_id = %ctx.run_id, strategy = "feed");
        drive_categories(self, ctx, categories, sink)
            .instrument(span)
            .await
    }
}

/// CSS selectors describing one listing-page layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSelectors {
    pub item: String,
    pub title: String,
    /// Defaults to the anchor inside (or being) the title element.
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default = "default_image_selector")]
    pub image: String,
}

fn default_image_selector() -> String {
    "img".to_string()
}

#[derive(Debug)]
struct CompiledSelectors {
    item: Selector,
    title: Selector,
    link: Option<Selector>,
    subtitle: Option<Selector>,
    image: Selector,
    anchor: Selector,
}

impl CompiledSelectors {
    fn compile(selectors: &PageSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            item: parse_selector(&selectors.item)?,
            title: parse_selector(&selectors.title)?,
            link: selectors.link.as_deref().map(parse_selector).transpose()?,
            subtitle: selectors.subtitle.as_deref().map(parse_selector).transpose()?,
            image: parse_selector(&selectors.image)?,
            anchor: parse_selector("a[href]")?,
        })
    }
}

/// HTML listing-page backed source.
#[derive(Debug)]
pub struct PageAdapter {
    name: String,
    base_url: String,
    categories: Vec<CategoryUrl>,
    selectors: CompiledSelectors,
}

impl PageAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        categories: Vec<CategoryUrl>,
        selectors: &PageSelectors,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            categories,
            selectors: CompiledSelectors::compile(selectors)?,
        })
    }

    /// Extract every listing item of `html`. Items without a title element are skipped.
    pub fn parse_listing(&self, html: &str) -> Vec<ItemCandidate> {
        let document = Html::parse_document(html);
        document
            .select(&self.selectors.item)
            .filter_map(|item| self.parse_item(item))
            .collect()
    }

    fn parse_item(&self, item: ElementRef<'_>) -> Option<ItemCandidate> {
        let sel = &self.selectors;
        let title_el = item.select(&sel.title).next()?;
        let title = title_el.text().collect::<Vec<_>>().join(" ");

        let link = match &sel.link {
            Some(link_sel) => item
                .select(link_sel)
                .next()
                .and_then(|a| non_blank_attr(a, "href")),
            None if title_el.value().name() == "a" => non_blank_attr(title_el, "href"),
            None => title_el
                .select(&sel.anchor)
                .next()
                .and_then(|a| non_blank_attr(a, "href")),
        }
        .unwrap_or_default();

        let subtitle = sel
            .subtitle
            .as_ref()
            .and_then(|s| item.select(s).next())
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();

        let image_url = item
            .select(&sel.image)
            .next()
            .and_then(|img| non_blank_attr(img, "src").or_else(|| non_blank_attr(img, "data-src")));

        Some(ItemCandidate {
            title,
            link,
            subtitle,
            body: String::new(),
            image_url,
            published_at: None,
        })
    }
}

#[async_trait]
impl CategoryScraper for PageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> &str {
        &self.base_url
    }

    async fn scrape_category(
        &self,
        ctx: &AdapterContext<'_>,
        category: &CategoryUrl,
    ) -> Result<Vec<ItemCandidate>, AdapterError> {
        let resp = ctx.http.fetch_bytes(&self.name, &category.url).await?;
        Ok(self.parse_listing(&resp.text()))
    }
}

#[async_trait]
impl SourceAdapter for PageAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn strategy(&self) -> Strategy {
        Strategy::Page
    }

    fn default_categories(&self) -> &[CategoryUrl] {
        &self.categories
    }

    async fn run(
        &self,
        ctx: &AdapterContext<'_>,
        categories: &[CategoryUrl],
        sink: &dyn ArticleSink,
    ) -> Result<AdapterReport, AdapterError> {
        let categories = if categories.is_empty() {
            self.default_categories()
        } else {
            categories
        };
        let span = info_span!("adapter", source = %self.name, run_id = %ctx.run_id, strategy = "page");
        drive_categories(self, ctx, categories, sink)
            .instrument(span)
            .await
    }
}

/// Declarative description of one source, as written in the source registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    pub base_url: String,
    pub strategy: Strategy,
    /// Category used for a page source that lists no categories.
    #[serde(default)]
    pub default_category: Option<String>,
    #[serde(default)]
    pub categories: Vec<CategoryUrl>,
    #[serde(default)]
    pub page: Option<PageSelectors>,
}

pub fn build_adapter(definition: &SourceDefinition) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    if !is_absolute_http_url(&definition.base_url) {
        return Err(AdapterError::Message(format!(
            "source {} has a non-http base_url {:?}",
            definition.name, definition.base_url
        )));
    }

    match definition.strategy {
        Strategy::Feed => {
            if definition.categories.is_empty() {
                return Err(AdapterError::Message(format!(
                    "feed source {} declares no categories",
                    definition.name
                )));
            }
            Ok(Box::new(FeedAdapter::new(
                definition.name.clone(),
                definition.base_url.clone(),
                definition.categories.clone(),
            )))
        }
        Strategy::Page => {
            let selectors = definition.page.as_ref().ok_or_else(|| {
                AdapterError::Message(format!("page source {} has no selectors", definition.name))
            })?;
            let categories = if definition.categories.is_empty() {
                vec![CategoryUrl::new(
                    definition.default_category
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
                    definition.base_url.clone(),
                )]
            } else {
                definition.categories.clone()
            };
            Ok(Box::new(PageAdapter::new(
                definition.name.clone(),
                definition.base_url.clone(),
                categories,
                selectors,
            )?))
        }
    }
}
