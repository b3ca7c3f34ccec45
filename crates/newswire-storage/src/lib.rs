//! Retrying HTTP fetch utilities and the article persistence boundary for newswire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newswire_core::{
    truncate_chars, Article, RejectReason, Source, StoredArticle, DEFAULT_CATEGORY, TITLE_MAX_CHARS,
};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "newswire-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only server errors are worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some("Mozilla/5.0 (compatible; newswire/0.1)".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The one HTTP client of a scrape pass. Retries live here and nowhere else.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_with_timeout(source, url, None).await
    }

    /// GET `url`, retrying 5xx responses and transport failures with exponential backoff.
    pub async fn fetch_bytes_with_timeout(
        &self,
        source: &str,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, url);
        self.fetch_with_retries(url, timeout).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(%status, attempt, ?delay, "retrying after server error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, attempt, ?delay, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Validated, defaulted article ready for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRecord {
    pub source_name: String,
    pub title: String,
    pub category: String,
    pub subtitle: String,
    pub body: String,
    pub url: String,
    pub image_url: String,
    pub published_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl ArticleRecord {
    pub fn prepare(article: Article, now: DateTime<Utc>) -> Result<Self, RejectReason> {
        if let Some(reason) = article.rejection_reason() {
            return Err(reason);
        }
        let category = if article.category.trim().is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            article.category
        };
        Ok(Self {
            source_name: article.source_name,
            title: truncate_chars(article.title.trim(), TITLE_MAX_CHARS),
            category,
            subtitle: article.subtitle,
            body: article.body,
            url: article.url.trim().to_string(),
            image_url: article.image_url.unwrap_or_default(),
            published_at: article.published_at.unwrap_or(now),
            ingested_at: now,
        })
    }
}

/// Durable article storage keyed by (source, url).
///
/// `upsert_article` must resolve or create the source by exact name and, on a
/// repeated url, overwrite only subtitle, body, image, published and ingested
/// timestamps. Each call is one transaction.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn upsert_article(&self, record: &ArticleRecord) -> Result<UpsertOutcome, StoreError>;

    async fn find_article(
        &self,
        source_name: &str,
        url: &str,
    ) -> Result<Option<StoredArticle>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgArticleStore {
    pool: PgPool,
}

impl PgArticleStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn upsert_article(&self, record: &ArticleRecord) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM sources WHERE name = $1")
            .bind(&record.source_name)
            .fetch_optional(&mut *tx)
            .await?;
        let source_id = match existing {
            Some(id) => id,
            None => {
                sqlx::query_scalar(
                    "INSERT INTO sources (name, base_url, created_at) VALUES ($1, '', $2) \
                     ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
                     RETURNING id",
                )
                .bind(&record.source_name)
                .bind(record.ingested_at)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO articles (source_id, title, category, subtitle, body, url, image_url, published_at, ingested_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (source_id, url) DO UPDATE SET \
                 subtitle = EXCLUDED.subtitle, \
                 body = EXCLUDED.body, \
                 image_url = EXCLUDED.image_url, \
                 published_at = EXCLUDED.published_at, \
                 ingested_at = EXCLUDED.ingested_at \
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(source_id)
        .bind(&record.title)
        .bind(&record.category)
        .bind(&record.subtitle)
        .bind(&record.body)
        .bind(&record.url)
        .bind(&record.image_url)
        .bind(record.published_at)
        .bind(record.ingested_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn find_article(
        &self,
        source_name: &str,
        url: &str,
    ) -> Result<Option<StoredArticle>, StoreError> {
        let row = sqlx::query(
            "SELECT a.id, a.source_id, a.title, a.category, a.subtitle, a.body, a.url, \
                    a.image_url, a.published_at, a.ingested_at \
             FROM articles a JOIN sources s ON a.source_id = s.id \
             WHERE s.name = $1 AND a.url = $2",
        )
        .bind(source_name)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<StoredArticle, sqlx::Error> {
            Ok(StoredArticle {
                id: row.try_get("id")?,
                source_id: row.try_get("source_id")?,
                title: row.try_get("title")?,
                category: row.try_get("category")?,
                subtitle: row.try_get("subtitle")?,
                body: row.try_get("body")?,
                url: row.try_get("url")?,
                image_url: row.try_get("image_url")?,
                published_at: row.try_get("published_at")?,
                ingested_at: row.try_get("ingested_at")?,
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<Source>,
    articles: Vec<StoredArticle>,
}

/// In-process store with the same upsert rules as Postgres; used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryArticleStore {
    state: Mutex<MemoryState>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sources(&self) -> Vec<Source> {
        self.state.lock().await.sources.clone()
    }

    pub async fn articles(&self) -> Vec<StoredArticle> {
        self.state.lock().await.articles.clone()
    }

    pub async fn articles_with_url(&self, url: &str) -> Vec<StoredArticle> {
        self.state
            .lock()
            .await
            .articles
            .iter()
            .filter(|a| a.url == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn upsert_article(&self, record: &ArticleRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;

        let source_id = match state.sources.iter().find(|s| s.name == record.source_name) {
            Some(source) => source.id,
            None => {
                let id = state.sources.len() as i64 + 1;
                state.sources.push(Source {
                    id,
                    name: record.source_name.clone(),
                    base_url: String::new(),
                    created_at: record.ingested_at,
                });
                id
            }
        };

        if let Some(existing) = state
            .articles
            .iter_mut()
            .find(|a| a.source_id == source_id && a.url == record.url)
        {
            existing.subtitle = record.subtitle.clone();
            existing.body = record.body.clone();
            existing.image_url = record.image_url.clone();
            existing.published_at = record.published_at;
            existing.ingested_at = record.ingested_at;
            return Ok(UpsertOutcome::Updated);
        }

        let id = state.articles.len() as i64 + 1;
        state.articles.push(StoredArticle {
            id,
            source_id,
            title: record.title.clone(),
            category: record.category.clone(),
            subtitle: record.subtitle.clone(),
            body: record.body.clone(),
            url: record.url.clone(),
            image_url: record.image_url.clone(),
            published_at: record.published_at,
            ingested_at: record.ingested_at,
        });
        Ok(UpsertOutcome::Inserted)
    }

    async fn find_article(
        &self,
        source_name: &str,
        url: &str,
    ) -> Result<Option<StoredArticle>, StoreError> {
        let state = self.state.lock().await;
        let Some(source) = state.sources.iter().find(|s| s.name == source_name) else {
            return Ok(None);
        };
        Ok(state
            .articles
            .iter()
            .find(|a| a.source_id == source.id && a.url == url)
            .cloned())
    }
}

/// Where adapters hand their articles. Saving never fails from the caller's point of view.
#[async_trait]
pub trait ArticleSink: Send + Sync {
    async fn save(&self, article: Article);
}

#[derive(Debug, Default)]
pub struct SinkStats {
    inserted: AtomicUsize,
    updated: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStatsSnapshot {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl SinkStatsSnapshot {
    /// Counts accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &SinkStatsSnapshot) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            inserted: self.inserted.saturating_sub(earlier.inserted),
            updated: self.updated.saturating_sub(earlier.updated),
            skipped: self.skipped.saturating_sub(earlier.skipped),
            failed: self.failed.saturating_sub(earlier.failed),
        }
    }

    pub fn saved(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Validates articles and upserts them into an [`ArticleStore`], logging instead of failing.
pub struct PersistenceSink {
    store: Arc<dyn ArticleStore>,
    stats: SinkStats,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn ArticleStore>) -> Self {
        Self {
            store,
            stats: SinkStats::default(),
        }
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<dyn ArticleStore> {
        &self.store
    }
}

#[async_trait]
impl ArticleSink for PersistenceSink {
    async fn save(&self, article: Article) {
        let source_name = article.source_name.clone();
        let record = match ArticleRecord::prepare(article, Utc::now()) {
            Ok(record) => record,
            Err(reason) => {
                warn!(source = %source_name, %reason, "skipping article");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.store.upsert_article(&record).await {
            Ok(UpsertOutcome::Inserted) => {
                self.stats.inserted.fetch_add(1, Ordering::Relaxed);
                info!(source = %record.source_name, title = %truncate_chars(&record.title, 80), "saved article");
            }
            Ok(UpsertOutcome::Updated) => {
                self.stats.updated.fetch_add(1, Ordering::Relaxed);
                debug!(source = %record.source_name, url = %record.url, "refreshed article");
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(source = %record.source_name, url = %record.url, error = %err, "could not save article");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use chrono::TimeZone;

    fn article(url: &str) -> Article {
        Article::new("La República", "Congreso aprueba reforma", "Política", url)
            .with_subtitle("primera")
            .with_body("cuerpo uno")
            .with_image_url("https://larepublica.pe/uno.jpg")
    }

    fn memory_sink() -> (Arc<MemoryArticleStore>, PersistenceSink) {
        let store = Arc::new(MemoryArticleStore::new());
        let sink = PersistenceSink::new(store.clone());
        (store, sink)
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::NonRetryable);
    }

    #[test]
    fn prepare_applies_defaults_and_truncation() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().unwrap();
        let long_title = "x".repeat(400);
        let record = ArticleRecord::prepare(
            Article::new("Andina", long_title, "  ", "https://andina.pe/nota"),
            now,
        )
        .unwrap();
        assert_eq!(record.title.chars().count(), TITLE_MAX_CHARS);
        assert_eq!(record.category, DEFAULT_CATEGORY);
        assert_eq!(record.published_at, now);
        assert_eq!(record.ingested_at, now);
        assert_eq!(record.image_url, "");
    }

    #[tokio::test]
    async fn articles_missing_title_or_url_are_never_stored() {
        let (store, sink) = memory_sink();
        sink.save(Article::new("RPP", "", "Portada", "https://rpp.pe/a")).await;
        sink.save(Article::new("RPP", "Titular", "Portada", "")).await;
        sink.save(Article::new("RPP", "Titular", "Portada", "/relativa")).await;

        assert!(store.articles().await.is_empty());
        assert!(store.sources().await.is_empty());
        assert_eq!(sink.stats().skipped, 3);
        assert_eq!(sink.stats().saved(), 0);
    }

    #[tokio::test]
    async fn repeat_url_updates_mutable_fields_only() {
        let (store, sink) = memory_sink();
        let url = "https://larepublica.pe/politica/reforma";
        sink.save(article(url)).await;

        let mut second = Article::new("La República", "Titular editado", "Portada", url)
            .with_subtitle("segunda")
            .with_body("cuerpo dos")
            .with_image_url("https://larepublica.pe/dos.jpg");
        second.published_at = Some(Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).single().unwrap());
        sink.save(second).await;

        let rows = store.articles_with_url(url).await;
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.title, "Congreso aprueba reforma");
        assert_eq!(row.category, "Política");
        assert_eq!(row.subtitle, "segunda");
        assert_eq!(row.body, "cuerpo dos");
        assert_eq!(row.image_url, "https://larepublica.pe/dos.jpg");
        assert_eq!(
            row.published_at,
            Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).single().unwrap()
        );
        assert_eq!(sink.stats().inserted, 1);
        assert_eq!(sink.stats().updated, 1);
    }

    #[tokio::test]
    async fn sources_are_created_once_and_matched_case_sensitively() {
        let (store, sink) = memory_sink();
        sink.save(Article::new("Andina", "Uno", "Portada", "https://andina.pe/1")).await;
        sink.save(Article::new("Andina", "Dos", "Portada", "https://andina.pe/2")).await;
        sink.save(Article::new("ANDINA", "Tres", "Portada", "https://andina.pe/3")).await;

        let sources = store.sources().await;
        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|s| s.base_url.is_empty()));
        let found = store.find_article("Andina", "https://andina.pe/2").await.unwrap();
        assert_eq!(found.map(|a| a.title), Some("Dos".to_string()));
        assert!(store.find_article("Andina", "https://andina.pe/3").await.unwrap().is_none());
    }

    struct BrokenStore;

    #[async_trait]
    impl ArticleStore for BrokenStore {
        async fn upsert_article(&self, _record: &ArticleRecord) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn find_article(
            &self,
            _source_name: &str,
            _url: &str,
        ) -> Result<Option<StoredArticle>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn store_failures_are_counted_not_propagated() {
        let sink = PersistenceSink::new(Arc::new(BrokenStore));
        sink.save(article("https://larepublica.pe/a")).await;
        sink.save(article("https://larepublica.pe/b")).await;
        assert_eq!(sink.stats().failed, 2);
        assert_eq!(sink.stats().saved(), 0);
    }

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        })
        .unwrap()
    }

    async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> (AxumStatus, &'static str) {
        if hits.fetch_add(1, Ordering::SeqCst) < 2 {
            (AxumStatus::SERVICE_UNAVAILABLE, "busy")
        } else {
            (AxumStatus::OK, "listo")
        }
    }

    async fn missing(State(hits): State<Arc<AtomicUsize>>) -> (AxumStatus, &'static str) {
        hits.fetch_add(1, Ordering::SeqCst);
        (AxumStatus::NOT_FOUND, "nope")
    }

    async fn broken(State(hits): State<Arc<AtomicUsize>>) -> (AxumStatus, &'static str) {
        hits.fetch_add(1, Ordering::SeqCst);
        (AxumStatus::INTERNAL_SERVER_ERROR, "boom")
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_server(Router::new().route("/flaky", get(flaky)).with_state(hits.clone())).await;

        let resp = fast_fetcher(5)
            .fetch_bytes("test", &format!("{base}/flaky"))
            .await
            .unwrap();
        assert_eq!(resp.text(), "listo");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_server(Router::new().route("/missing", get(missing)).with_state(hits.clone())).await;

        let err = fast_fetcher(5)
            .fetch_bytes("test", &format!("{base}/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_server(Router::new().route("/broken", get(broken)).with_state(hits.clone())).await;

        let err = fast_fetcher(2)
            .fetch_bytes("test", &format!("{base}/broken"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
