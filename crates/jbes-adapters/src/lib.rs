//! Board scraper capability, per-board scraper registry, and the fixture and
//! HTML listing scrapers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use jbes_core::{Board, BoardId, RawListing};
use jbes_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jbes-adapters";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("network error: {0}")]
    Network(#[from] FetchError),
    #[error("rate limited by {url}")]
    RateLimited { url: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scraper configuration: {0}")]
    Validation(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ScrapeError {
    fn from_fetch(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status: 429, url, .. } => Self::RateLimited { url },
            other => Self::Network(other),
        }
    }
}

/// Pluggable per-board scraping capability.
#[async_trait]
pub trait BoardScraper: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn scrape(&self, board: &Board) -> Result<Vec<RawListing>, ScrapeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSelectors {
    pub item: String,
    pub title: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Scraper strategy for one board, as written in `boards.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScraperSpec {
    Fixture {
        path: PathBuf,
    },
    Html {
        listing_urls: Vec<String>,
        selectors: HtmlSelectors,
    },
}

/// Reads listings from a JSON array on disk.
#[derive(Debug, Clone)]
pub struct FixtureScraper {
    path: PathBuf,
}

impl FixtureScraper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BoardScraper for FixtureScraper {
    fn kind(&self) -> &'static str {
        "fixture"
    }

    async fn scrape(&self, board: &Board) -> Result<Vec<RawListing>, ScrapeError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ScrapeError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        let listings: Vec<RawListing> = serde_json::from_str(&text)
            .map_err(|e| ScrapeError::Parse(format!("{}: {e}", self.path.display())))?;
        debug!(board_id = board.id, count = listings.len(), "loaded fixture listings");
        Ok(listings)
    }
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    company: Option<Selector>,
    link: Option<Selector>,
    location: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|e| ScrapeError::Validation(format!("selector `{selector}`: {e}")))
}

impl CompiledSelectors {
    fn new(spec: &HtmlSelectors) -> Result<Self, ScrapeError> {
        Ok(Self {
            item: compile(&spec.item)?,
            title: compile(&spec.title)?,
            company: spec.company.as_deref().map(compile).transpose()?,
            link: spec.link.as_deref().map(compile).transpose()?,
            location: spec.location.as_deref().map(compile).transpose()?,
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(item: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Extracts one listing per `item` match. Relative links resolve against `page_url`.
pub fn parse_listing_html(
    html: &str,
    page_url: &str,
    selectors: &HtmlSelectors,
) -> Result<Vec<RawListing>, ScrapeError> {
    let compiled = CompiledSelectors::new(selectors)?;
    let base = reqwest::Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let listings = document
        .select(&compiled.item)
        .map(|item| {
            let url = compiled
                .link
                .as_ref()
                .and_then(|sel| item.select(sel).next())
                .and_then(|a| a.value().attr("href"))
                .map(|href| match &base {
                    Some(base) => base
                        .join(href)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| href.to_string()),
                    None => href.to_string(),
                });
            RawListing {
                title: first_text(&item, &compiled.title).unwrap_or_default(),
                company: compiled.company.as_ref().and_then(|sel| first_text(&item, sel)),
                url,
                location: compiled.location.as_ref().and_then(|sel| first_text(&item, sel)),
            }
        })
        .collect();
    Ok(listings)
}

/// Fetches each listing page over HTTP and extracts listings with CSS selectors.
pub struct HtmlListingScraper {
    http: Arc<HttpFetcher>,
    listing_urls: Vec<String>,
    selectors: HtmlSelectors,
}

impl HtmlListingScraper {
    pub fn new(http: Arc<HttpFetcher>, listing_urls: Vec<String>, selectors: HtmlSelectors) -> Result<Self, ScrapeError> {
        if listing_urls.is_empty() {
            return Err(ScrapeError::Validation("html scraper needs at least one listing url".into()));
        }
        CompiledSelectors::new(&selectors)?;
        Ok(Self {
            http,
            listing_urls,
            selectors,
        })
    }
}

#[async_trait]
impl BoardScraper for HtmlListingScraper {
    fn kind(&self) -> &'static str {
        "html"
    }

    async fn scrape(&self, board: &Board) -> Result<Vec<RawListing>, ScrapeError> {
        let mut out = Vec::new();
        for url in &self.listing_urls {
            let page = self
                .http
                .fetch_text(board.id, url)
                .await
                .map_err(ScrapeError::from_fetch)?;
            let listings = parse_listing_html(&page.body, &page.final_url, &self.selectors)?;
            if listings.is_empty() {
                warn!(board_id = board.id, url, "listing page yielded no items");
            }
            out.extend(listings);
        }
        Ok(out)
    }
}

/// Scraper strategy map keyed by board id.
#[derive(Default, Clone)]
pub struct ScraperRegistry {
    scrapers: HashMap<BoardId, Arc<dyn BoardScraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, board_id: BoardId, scraper: Arc<dyn BoardScraper>) -> &mut Self {
        self.scrapers.insert(board_id, scraper);
        self
    }

    pub fn with(mut self, board_id: BoardId, scraper: Arc<dyn BoardScraper>) -> Self {
        self.register(board_id, scraper);
        self
    }

    pub fn scraper_for(&self, board_id: BoardId) -> Option<Arc<dyn BoardScraper>> {
        self.scrapers.get(&board_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }

    /// Builds a scraper for `spec`. Fixture paths resolve against `base_dir`.
    pub fn build_scraper(
        spec: &ScraperSpec,
        http: &Arc<HttpFetcher>,
        base_dir: &Path,
    ) -> Result<Arc<dyn BoardScraper>, ScrapeError> {
        Ok(match spec {
            ScraperSpec::Fixture { path } => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                Arc::new(FixtureScraper::new(path))
            }
            ScraperSpec::Html {
                listing_urls,
                selectors,
            } => Arc::new(HtmlListingScraper::new(
                Arc::clone(http),
                listing_urls.clone(),
                selectors.clone(),
            )?),
        })
    }
}
