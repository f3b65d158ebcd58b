//! Shared HTTP client for board scrapers. Each board gets its own lane with a
//! concurrency limit and a cooldown that a throttling response (429) puts the
//! whole lane into, so parallel listing pages of one board back off together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jbes_core::BoardId;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// What a failed attempt against a board allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    /// The board asked us to slow down, optionally saying for how long.
    Throttled(Option<Duration>),
    GiveUp,
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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (0-based), or `None` to stop.
    ///
    /// Delays double from `base_delay` up to `max_delay`. A board's
    /// `Retry-After` is a floor; one longer than `max_delay` ends the fetch.
    pub fn next_delay(&self, retry: usize, disposition: RetryDisposition) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(31) as u32))
            .min(self.max_delay);
        match disposition {
            RetryDisposition::GiveUp => None,
            RetryDisposition::Retry | RetryDisposition::Throttled(None) => Some(doubled),
            RetryDisposition::Throttled(Some(after)) if after > self.max_delay => None,
            RetryDisposition::Throttled(Some(after)) => Some(doubled.max(after)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_board_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_board_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("board {board_id}: http status {status} for {url}")]
    HttpStatus {
        board_id: BoardId,
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 429, .. })
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) if err.is_timeout() || err.is_connect() => RetryDisposition::Retry,
            Self::HttpStatus { status: 429, retry_after, .. } => RetryDisposition::Throttled(*retry_after),
            Self::HttpStatus { status, .. } if *status >= 500 => RetryDisposition::Retry,
            _ => RetryDisposition::GiveUp,
        }
    }
}

/// `Retry-After` given in seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug)]
struct BoardLane {
    permits: Semaphore,
    cooldown_until: Mutex<Option<Instant>>,
}

impl BoardLane {
    fn new(permits: usize) -> Self {
        Self {
            permits: Semaphore::new(permits),
            cooldown_until: Mutex::new(None),
        }
    }

    async fn wait_out_cooldown(&self) {
        let until = *self.cooldown_until.lock().await;
        if let Some(until) = until {
            tokio::time::sleep_until(until).await;
        }
    }

    async fn cool_down(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut slot = self.cooldown_until.lock().await;
        if slot.map_or(true, |current| current < until) {
            *slot = Some(until);
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Semaphore,
    per_board_limit: usize,
    lanes: Mutex<HashMap<BoardId, Arc<BoardLane>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let user_agent = config
            .user_agent
            .unwrap_or_else(|| format!("jbes/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .gzip(true)
            .brotli(true)
            .build()
            .context("building board HTTP client")?;
        Ok(Self {
            client,
            global_limit: Semaphore::new(config.global_concurrency.max(1)),
            per_board_limit: config.per_board_concurrency.max(1),
            lanes: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn lane(&self, board_id: BoardId) -> Arc<BoardLane> {
        let mut lanes = self.lanes.lock().await;
        Arc::clone(
            lanes
                .entry(board_id)
                .or_insert_with(|| Arc::new(BoardLane::new(self.per_board_limit))),
        )
    }

    /// GET `url` for `board_id` as text. Permits are released while a retry waits.
    pub async fn fetch_text(&self, board_id: BoardId, url: &str) -> Result<FetchedResponse, FetchError> {
        let lane = self.lane(board_id).await;
        self.fetch_in_lane(&lane, board_id, url)
            .instrument(info_span!("board_fetch", board_id, url))
            .await
    }

    async fn fetch_in_lane(
        &self,
        lane: &BoardLane,
        board_id: BoardId,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            lane.wait_out_cooldown().await;
            let attempt = {
                let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
                let _board = lane.permits.acquire().await.map_err(|_| FetchError::Closed)?;
                self.attempt(board_id, url).await
            };
            let err = match attempt {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            let disposition = err.disposition();
            let Some(delay) = self.backoff.next_delay(retry, disposition) else {
                return Err(err);
            };
            if matches!(disposition, RetryDisposition::Throttled(_)) {
                lane.cool_down(delay).await;
            }
            debug!(retry, ?delay, error = %err, "retrying board fetch");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn attempt(&self, board_id: BoardId, url: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                board_id,
                status: status.as_u16(),
                url: final_url,
                retry_after: retry_after(response.headers()),
            });
        }
        let body = response.text().await?;
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
