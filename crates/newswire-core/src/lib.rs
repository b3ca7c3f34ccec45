//! Core domain model for newswire: articles as adapters emit them, and as the store keeps them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "newswire-core";

/// Category label used when an adapter does not supply one.
pub const DEFAULT_CATEGORY: &str = "General";

/// Width of the `articles.title` column.
pub const TITLE_MAX_CHARS: usize = 255;

/// One normalized news item, handed from an adapter to the persistence sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub source_name: String,
    pub title: String,
    pub category: String,
    pub subtitle: String,
    pub body: String,
    pub url: String,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Article {
    pub fn new(
        source_name: impl Into<String>,
        title: impl Into<String>,
        category: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            title: title.into(),
            category: category.into(),
            subtitle: String::new(),
            body: String::new(),
            url: url.into(),
            image_url: None,
            published_at: None,
        }
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = subtitle.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_image_url(mut self, image_url: impl Into<String>) -> Self {
        let image_url = image_url.into();
        self.image_url = if image_url.trim().is_empty() {
            None
        } else {
            Some(image_url)
        };
        self
    }

    pub fn with_published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }

    pub fn has_image(&self) -> bool {
        self.image_url
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }

    /// Reason this article must not be stored, if any.
    pub fn rejection_reason(&self) -> Option<RejectReason> {
        if self.title.trim().is_empty() {
            return Some(RejectReason::MissingTitle);
        }
        if self.url.trim().is_empty() {
            return Some(RejectReason::MissingUrl);
        }
        if !is_absolute_http_url(&self.url) {
            return Some(RejectReason::RelativeUrl);
        }
        None
    }

    pub fn is_persistable(&self) -> bool {
        self.rejection_reason().is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    MissingTitle,
    MissingUrl,
    RelativeUrl,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::MissingTitle => "missing title",
            RejectReason::MissingUrl => "missing url",
            RejectReason::RelativeUrl => "url is not an absolute http(s) url",
        };
        f.write_str(text)
    }
}

/// One logical category of a source and the feed or listing page that backs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryUrl {
    #[serde(alias = "name")]
    pub category: String,
    pub url: String,
}

impl CategoryUrl {
    pub fn new(category: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            url: url.into(),
        }
    }
}

/// Persisted publisher record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted article row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub category: String,
    pub subtitle: String,
    pub body: String,
    pub url: String,
    pub image_url: String,
    pub published_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

pub fn is_absolute_http_url(candidate: &str) -> bool {
    match Url::parse(candidate.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => input[..byte_idx].to_string(),
        None => input.to_string(),
    }
}
