//! Source connector contracts + the news, discussion, enrichment and fixture connectors.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dio_core::SourcePayload;
use dio_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "dio-connectors";

/// Headlines at least this similar are treated as the same story.
pub const HEADLINE_DUPLICATE_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    News,
    Discussion,
    CompanyEnrichment,
    PeopleEnrichment,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub company: String,
    pub entity_id: String,
    pub user_id: String,
}

impl FetchContext {
    pub fn new(
        company: impl Into<String>,
        entity_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            company: company.into(),
            entity_id: entity_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Resolved settings for one configured source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSettings {
    pub source_id: String,
    pub kind: ConnectorKind,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_results: usize,
    pub fixture_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("missing credential for source {0}")]
    MissingCredential(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
    #[error("unexpected payload shape: {0}")]
    Payload(String),
    #[error("reading fixture {path}: {message}")]
    Fixture { path: PathBuf, message: String },
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> ConnectorKind;

    async fn fetch_raw(&self, ctx: &FetchContext) -> Result<SourcePayload, ConnectorError>;

    /// Boundary used by the coordinator: a failure is logged and yields `None`,
    /// so the caller can keep whatever it already holds for this source.
    async fn fetch(&self, ctx: &FetchContext) -> Option<SourcePayload> {
        match self.fetch_raw(ctx).await {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(
                    source_id = self.source_id(),
                    kind = ?self.kind(),
                    entity_id = %ctx.entity_id,
                    error = %err,
                    "connector failed"
                );
                None
            }
        }
    }
}

pub fn connector_for_source(
    settings: &ConnectorSettings,
    http: Arc<HttpFetcher>,
) -> Box<dyn SourceConnector> {
    let source_id = settings.source_id.clone();
    let max_results = settings.max_results.max(1);
    let base = |default: &str| {
        settings
            .base_url
            .clone()
            .unwrap_or_else(|| default.to_string())
    };
    match settings.kind {
        ConnectorKind::News => Box::new(NewsConnector {
            source_id,
            base_url: base("https://newsapi.org"),
            api_key: settings.api_key.clone(),
            max_results,
            http,
        }),
        ConnectorKind::Discussion => Box::new(DiscussionConnector {
            source_id,
            base_url: base("https://hn.algolia.com"),
            max_results,
            http,
        }),
        ConnectorKind::CompanyEnrichment => Box::new(CompanyEnrichmentConnector {
            source_id,
            base_url: base("https://api.enrichment.example"),
            api_key: settings.api_key.clone(),
            http,
        }),
        ConnectorKind::PeopleEnrichment => Box::new(PeopleEnrichmentConnector {
            source_id,
            base_url: base("https://api.enrichment.example"),
            api_key: settings.api_key.clone(),
            max_results,
            http,
        }),
        ConnectorKind::Fixture => Box::new(FixtureConnector {
            source_id,
            root: settings
                .fixture_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("fixtures")),
        }),
    }
}

fn build_url(base: &str, path: &str, params: &[(&str, String)]) -> Result<String, ConnectorError> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse_with_params(&joined, params)
        .map(|url| url.to_string())
        .map_err(|e| ConnectorError::InvalidUrl(format!("{joined}: {e}")))
}

fn require_key<'a>(source_id: &str, key: &'a Option<String>) -> Result<&'a str, ConnectorError> {
    key.as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ConnectorError::MissingCredential(source_id.to_string()))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> Result<&'a Vec<JsonValue>, ConnectorError> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ConnectorError::Payload(format!("expected array at {}", path.join("."))))
}

/// Copies the listed keys that are present and non-null.
fn pick(value: &JsonValue, keys: &[(&str, &str)]) -> JsonValue {
    let mut out = serde_json::Map::new();
    for (from, to) in keys {
        if let Some(v) = value.get(*from).filter(|v| !v.is_null()) {
            out.insert((*to).to_string(), v.clone());
        }
    }
    JsonValue::Object(out)
}

pub fn normalize_headline(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keeps the first of any group of near-identical headlines.
pub fn dedupe_headlines(items: SourcePayload) -> SourcePayload {
    let mut kept: Vec<(String, JsonValue)> = Vec::new();
    for item in items {
        let headline = normalize_headline(item.get("title").and_then(JsonValue::as_str).unwrap_or(""));
        if headline.is_empty() {
            continue;
        }
        let duplicate = kept
            .iter()
            .any(|(seen, _)| jaro_winkler(seen, &headline) >= HEADLINE_DUPLICATE_THRESHOLD);
        if !duplicate {
            kept.push((headline, item));
        }
    }
    kept.into_iter().map(|(_, item)| item).collect()
}

pub struct NewsConnector {
    source_id: String,
    base_url: String,
    api_key: Option<String>,
    max_results: usize,
    http: Arc<HttpFetcher>,
}

pub fn map_news_response(body: &JsonValue, max_results: usize) -> Result<SourcePayload, ConnectorError> {
    let articles = json_array(body, &["articles"])?;
    let items = articles
        .iter()
        .map(|a| {
            json!({
                "title": json_str(a, &["title"]).unwrap_or_default(),
                "url": json_str(a, &["url"]),
                "source": json_str(a, &["source", "name"]),
                "published_at": json_str(a, &["publishedAt"]),
                "description": json_str(a, &["description"]),
            })
        })
        .collect();
    Ok(dedupe_headlines(items).into_iter().take(max_results).collect())
}

#[async_trait]
impl SourceConnector for NewsConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::News
    }

    async fn fetch_raw(&self, ctx: &FetchContext) -> Result<SourcePayload, ConnectorError> {
        let key = require_key(&self.source_id, &self.api_key)?;
        let url = build_url(
            &self.base_url,
            "v2/everything",
            &[
                ("q", format!("\"{}\"", ctx.company)),
                ("sortBy", "publishedAt".to_string()),
                ("language", "en".to_string()),
                // over-fetch so dedup still leaves a full page
                ("pageSize", (self.max_results * 2).to_string()),
            ],
        )?;
        let body = self
            .http
            .get_json(&self.source_id, &url, &[("X-Api-Key", key.to_string())])
            .await?;
        map_news_response(&body, self.max_results)
    }
}

pub struct DiscussionConnector {
    source_id: String,
    base_url: String,
    max_results: usize,
    http: Arc<HttpFetcher>,
}

pub fn map_discussion_response(body: &JsonValue, max_results: usize) -> Result<SourcePayload, ConnectorError> {
    let hits = json_array(body, &["hits"])?;
    Ok(hits
        .iter()
        .filter(|hit| json_str(hit, &["title"]).is_some())
        .take(max_results)
        .map(|hit| {
            let mut item = pick(
                hit,
                &[
                    ("title", "title"),
                    ("url", "url"),
                    ("points", "points"),
                    ("num_comments", "comments"),
                    ("created_at", "created_at"),
                ],
            );
            if let (Some(id), Some(map)) = (json_str(hit, &["objectID"]), item.as_object_mut()) {
                map.insert(
                    "discussion_url".to_string(),
                    json!(format!("https://news.ycombinator.com/item?id={id}")),
                );
            }
            item
        })
        .collect())
}

#[async_trait]
impl SourceConnector for DiscussionConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Discussion
    }

    async fn fetch_raw(&self, ctx: &FetchContext) -> Result<SourcePayload, ConnectorError> {
        let url = build_url(
            &self.base_url,
            "api/v1/search",
            &[
                ("query", ctx.company.clone()),
                ("tags", "story".to_string()),
                ("hitsPerPage", self.max_results.to_string()),
            ],
        )?;
        let body = self.http.get_json(&self.source_id, &url, &[]).await?;
        map_discussion_response(&body, self.max_results)
    }
}

pub struct CompanyEnrichmentConnector {
    source_id: String,
    base_url: String,
    api_key: Option<String>,
    http: Arc<HttpFetcher>,
}

pub fn map_company_response(body: &JsonValue) -> SourcePayload {
    let company = body.get("company").unwrap_or(body);
    let item = pick(
        company,
        &[
            ("name", "name"),
            ("domain", "domain"),
            ("industry", "industry"),
            ("employee_count", "employee_count"),
            ("founded_year", "founded_year"),
            ("location", "location"),
            ("description", "description"),
            ("total_funding", "total_funding"),
        ],
    );
    match item.as_object() {
        Some(map) if !map.is_empty() => vec![item],
        _ => Vec::new(),
    }
}

#[async_trait]
impl SourceConnector for CompanyEnrichmentConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::CompanyEnrichment
    }

    async fn fetch_raw(&self, ctx: &FetchContext) -> Result<SourcePayload, ConnectorError> {
        let key = require_key(&self.source_id, &self.api_key)?;
        let url = build_url(&self.base_url, "v1/companies/enrich", &[("name", ctx.company.clone())])?;
        let body = self
            .http
            .get_json(&self.source_id, &url, &[("Authorization", format!("Bearer {key}"))])
            .await?;
        Ok(map_company_response(&body))
    }
}

pub struct PeopleEnrichmentConnector {
    source_id: String,
    base_url: String,
    api_key: Option<String>,
    max_results: usize,
    http: Arc<HttpFetcher>,
}

pub fn map_people_response(body: &JsonValue, max_results: usize) -> Result<SourcePayload, ConnectorError> {
    let people = json_array(body, &["people"])?;
    Ok(people
        .iter()
        .filter(|p| json_str(p, &["name"]).is_some())
        .take(max_results)
        .map(|p| {
            pick(
                p,
                &[
                    ("name", "name"),
                    ("title", "title"),
                    ("seniority", "seniority"),
                    ("department", "department"),
                    ("linkedin_url", "linkedin_url"),
                ],
            )
        })
        .collect())
}

#[async_trait]
impl SourceConnector for PeopleEnrichmentConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::PeopleEnrichment
    }

    async fn fetch_raw(&self, ctx: &FetchContext) -> Result<SourcePayload, ConnectorError> {
        let key = require_key(&self.source_id, &self.api_key)?;
        let url = build_url(
            &self.base_url,
            "v1/people/search",
            &[
                ("company", ctx.company.clone()),
                ("limit", self.max_results.to_string()),
            ],
        )?;
        let body = self
            .http
            .get_json(&self.source_id, &url, &[("Authorization", format!("Bearer {key}"))])
            .await?;
        map_people_response(&body, self.max_results)
    }
}

/// Offline connector: `<root>/<source_id>/<company-slug>.json` holding a JSON array.
pub struct FixtureConnector {
    source_id: String,
    root: PathBuf,
}

impl FixtureConnector {
    pub fn new(source_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
        }
    }

    pub fn fixture_path(&self, company: &str) -> PathBuf {
        self.root
            .join(&self.source_id)
            .join(format!("{}.json", company_slug(company)))
    }
}

pub fn company_slug(input: &str) -> String {
    normalize_headline(input).replace(' ', "-")
}

#[async_trait]
impl SourceConnector for FixtureConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Fixture
    }

    async fn fetch_raw(&self, ctx: &FetchContext) -> Result<SourcePayload, ConnectorError> {
        let path = self.fixture_path(&ctx.company);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(ConnectorError::Fixture {
                    path,
                    message: err.to_string(),
                })
            }
        };
        serde_json::from_str(&text).map_err(|e| ConnectorError::Fixture {
            path,
            message: e.to_string(),
        })
    }
}
