//! Repost detection: clusters postings of one board that advertise the same
//! job again. The detector is the only writer of `repost_count` and
//! `repost_cluster_id`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jbes_core::titles::string_similarity;
use jbes_core::{
    days_between_ceil, title_similarity, BoardId, Clock, Posting, PostingEvent, PostingEventType,
    PostingId,
};
use jbes_storage::{PostingFilter, PostingOrder, RecordStore, StoreResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::stats::{mean, round_to};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    Url,
    TitleCompany,
    Similarity,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::TitleCompany => "title-company",
            Self::Similarity => "similarity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepostMatch {
    pub original_id: PostingId,
    pub repost_id: PostingId,
    pub score: f64,
    pub match_type: MatchType,
    pub confirmed: bool,
    pub gap_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepostCluster {
    pub original: Posting,
    pub reposts: Vec<RepostMatch>,
    pub total_reposts: usize,
    pub average_gap_days: i64,
    pub repost_frequency: f64,
}

impl RepostCluster {
    fn new(original: Posting, reposts: Vec<RepostMatch>) -> Self {
        let gaps: Vec<f64> = reposts.iter().map(|m| m.gap_days as f64).collect();
        let average_gap_days = mean(&gaps).map(|g| g.round() as i64).unwrap_or(0);
        let first_gap = reposts.first().map(|m| m.gap_days).unwrap_or(0);
        let repost_frequency = if first_gap > 0 {
            reposts.len() as f64 / first_gap as f64 * 30.0
        } else {
            0.0
        };
        Self {
            original,
            total_reposts: reposts.len(),
            reposts,
            average_gap_days,
            repost_frequency,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RepostConfig {
    pub min_gap_days: i64,
    pub title_threshold: f64,
    pub company_threshold: f64,
    pub similarity_weight: f64,
    pub confirm_threshold: f64,
}

impl Default for RepostConfig {
    fn default() -> Self {
        Self {
            min_gap_days: 1,
            title_threshold: 0.75,
            company_threshold: 0.70,
            similarity_weight: 0.9,
            confirm_threshold: 0.95,
        }
    }
}

const EVENT_PREFIX: &str = "Repost detected: posting ";

fn event_note(m: &RepostMatch) -> String {
    format!(
        "{EVENT_PREFIX}{} ({}, score: {:.2})",
        m.repost_id,
        m.match_type.as_str(),
        m.score
    )
}

/// Repost id named in a `repost_detected` note.
fn noted_repost_id(note: &str) -> Option<PostingId> {
    let rest = note.strip_prefix(EVENT_PREFIX)?;
    rest.split_whitespace().next()?.parse().ok()
}

fn normalized(value: &str) -> String {
    value.trim().to_lowercase()
}

/// First matching tier for `candidate` as a repost of `original`, if any.
///
/// Both postings need a first sighting and `candidate` must be seen strictly later.
pub fn detect_repost_match(original: &Posting, candidate: &Posting, config: &RepostConfig) -> Option<RepostMatch> {
    let start = original.first_seen?;
    let seen = candidate.first_seen?;
    if seen <= start || original.id == candidate.id {
        return None;
    }

    let same_url = matches!(
        (original.canonical_url(), candidate.canonical_url()),
        (Some(a), Some(b)) if a == b
    );
    let (score, match_type) = if same_url {
        (1.0, MatchType::Url)
    } else {
        let (company_a, company_b) = (original.company_name()?, candidate.company_name()?);
        if normalized(&original.title) == normalized(&candidate.title)
            && normalized(company_a) == normalized(company_b)
        {
            (0.95, MatchType::TitleCompany)
        } else {
            if original.normalized_title != candidate.normalized_title {
                return None;
            }
            let title_sim = title_similarity(&original.title, &candidate.title);
            let company_sim = string_similarity(company_a, company_b);
            if title_sim < config.title_threshold || company_sim < config.company_threshold {
                return None;
            }
            (title_sim * config.similarity_weight, MatchType::Similarity)
        }
    };

    Some(RepostMatch {
        original_id: original.id,
        repost_id: candidate.id,
        score,
        match_type,
        confirmed: score >= config.confirm_threshold,
        gap_days: days_between_ceil(start, seen),
    })
}

/// Forward-only clustering of one board's postings.
///
/// Postings are walked by `first_seen`; a posting claimed by an earlier cluster
/// neither starts a cluster nor joins another one. Claiming is greedy so that
/// every posting carries at most one `repost_cluster_id`. Use
/// [`RepostDetector::find_reposts_for_posting`] to see every forward match of a
/// single posting, claimed or not.
pub fn cluster_postings(postings: &[Posting], config: &RepostConfig) -> Vec<RepostCluster> {
    let mut ordered: Vec<&Posting> = postings.iter().filter(|p| p.first_seen.is_some()).collect();
    ordered.sort_by_key(|p| (p.first_seen, p.id));

    let mut claimed: HashSet<PostingId> = HashSet::new();
    let mut clusters = Vec::new();
    for (i, original) in ordered.iter().enumerate() {
        if claimed.contains(&original.id) {
            continue;
        }
        let mut matches: Vec<RepostMatch> = ordered[i + 1..]
            .iter()
            .filter(|c| c.normalized_title == original.normalized_title && !claimed.contains(&c.id))
            .filter_map(|c| detect_repost_match(original, c, config))
            .filter(|m| m.gap_days >= config.min_gap_days)
            .collect();
        if matches.is_empty() {
            continue;
        }
        matches.sort_by_key(|m| m.gap_days);
        claimed.insert(original.id);
        claimed.extend(matches.iter().map(|m| m.repost_id));
        clusters.push(RepostCluster::new((*original).clone(), matches));
    }
    clusters
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepostDetection {
    pub clusters: usize,
    pub detected: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepostStats {
    pub board_id: BoardId,
    pub total_postings: i64,
    pub postings_with_reposts: usize,
    pub total_repost_events: usize,
    pub average_reposts_per_posting: f64,
    pub repost_percentage: f64,
    pub average_gap_days: f64,
}

pub struct RepostDetector {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: RepostConfig,
}

impl RepostDetector {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, config: RepostConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &RepostConfig {
        &self.config
    }

    pub async fn find_reposts_for_posting(&self, posting: &Posting) -> StoreResult<Vec<RepostMatch>> {
        let candidates = self
            .store
            .select_postings(
                &PostingFilter::for_board(posting.board_id)
                    .with_role_family(posting.normalized_title)
                    .ordered(PostingOrder::FirstSeenAsc),
            )
            .await?;
        let mut matches: Vec<RepostMatch> = candidates
            .iter()
            .filter_map(|c| detect_repost_match(posting, c, &self.config))
            .collect();
        matches.sort_by_key(|m| m.gap_days);
        Ok(matches)
    }

    pub async fn detect_reposts_for_board(&self, board_id: BoardId) -> StoreResult<Vec<RepostCluster>> {
        let postings = self
            .store
            .select_postings(&PostingFilter::for_board(board_id).ordered(PostingOrder::FirstSeenAsc))
            .await?;
        Ok(cluster_postings(&postings, &self.config))
    }

    /// Clusters the board and writes counts, cluster ids and events for new pairs.
    ///
    /// A pair's event is written before the repost's cluster id, and a pair
    /// whose event is missing from the log gets it on the next pass. Postings
    /// no longer part of any cluster have their repost fields reset.
    pub async fn bulk_detect_for_board(&self, board_id: BoardId) -> StoreResult<RepostDetection> {
        let postings = self
            .store
            .select_postings(&PostingFilter::for_board(board_id).ordered(PostingOrder::FirstSeenAsc))
            .await?;
        let clusters = cluster_postings(&postings, &self.config);
        let recorded: HashSet<(PostingId, PostingId)> = self
            .store
            .board_events(board_id, Some(PostingEventType::RepostDetected))
            .await?
            .iter()
            .filter_map(|e| Some((e.posting_id, noted_repost_id(e.notes.as_deref()?)?)))
            .collect();

        let mut want_count: HashMap<PostingId, i64> = HashMap::new();
        let mut want_cluster: HashMap<PostingId, PostingId> = HashMap::new();
        for cluster in &clusters {
            want_count.insert(cluster.original.id, cluster.total_reposts as i64);
            for m in &cluster.reposts {
                want_cluster.insert(m.repost_id, m.original_id);
            }
        }
        let matches: HashMap<PostingId, &RepostMatch> = clusters
            .iter()
            .flat_map(|c| c.reposts.iter())
            .map(|m| (m.repost_id, m))
            .collect();

        let now = self.clock.now();
        let mut outcome = RepostDetection {
            clusters: clusters.len(),
            ..RepostDetection::default()
        };
        for posting in &postings {
            let count = want_count.get(&posting.id).copied().unwrap_or(0);
            if posting.repost_count != count {
                match self.store.set_repost_count(posting.id, count).await {
                    Ok(()) => outcome.updated += 1,
                    Err(err) => {
                        outcome.failed += 1;
                        warn!(posting_id = posting.id, error = %err, "repost count update failed");
                    }
                }
            }

            if let Some(m) = matches.get(&posting.id) {
                if !recorded.contains(&(m.original_id, m.repost_id)) {
                    let event = PostingEvent {
                        posting_id: m.original_id,
                        event_type: PostingEventType::RepostDetected,
                        event_date: now,
                        notes: Some(event_note(m)),
                    };
                    if let Err(err) = self.store.append_event(&event).await {
                        outcome.failed += 1;
                        warn!(posting_id = m.original_id, error = %err, "repost event write failed");
                        continue;
                    }
                    outcome.detected += 1;
                    debug!(original_id = m.original_id, repost_id = m.repost_id, "repost detected");
                }
            }

            let cluster_id = want_cluster.get(&posting.id).copied();
            if posting.repost_cluster_id != cluster_id {
                if let Err(err) = self.store.set_repost_cluster(posting.id, cluster_id).await {
                    outcome.failed += 1;
                    warn!(posting_id = posting.id, error = %err, "repost cluster update failed");
                }
            }
        }
        info!(
            board_id,
            clusters = outcome.clusters,
            detected = outcome.detected,
            failed = outcome.failed,
            "repost detection finished"
        );
        Ok(outcome)
    }

    pub async fn repost_stats_for_board(&self, board_id: BoardId) -> StoreResult<RepostStats> {
        let postings = self
            .store
            .select_postings(&PostingFilter::for_board(board_id))
            .await?;
        let events = self
            .store
            .board_events(board_id, Some(PostingEventType::RepostDetected))
            .await?;
        let clusters = cluster_postings(&postings, &self.config);

        let total = postings.len() as i64;
        let with_reposts = postings.iter().filter(|p| p.repost_count > 0).count();
        let repost_sum: i64 = postings.iter().map(|p| p.repost_count).sum();
        let gaps: Vec<f64> = clusters.iter().map(|c| c.average_gap_days as f64).collect();
        let (average_reposts_per_posting, repost_percentage) = if total > 0 {
            (
                round_to(repost_sum as f64 / total as f64, 2),
                round_to(with_reposts as f64 / total as f64 * 100.0, 1),
            )
        } else {
            (0.0, 0.0)
        };
        Ok(RepostStats {
            board_id,
            total_postings: total,
            postings_with_reposts: with_reposts,
            total_repost_events: events.len(),
            average_reposts_per_posting,
            repost_percentage,
            average_gap_days: mean(&gaps).map(|g| round_to(g, 1)).unwrap_or(0.0),
        })
    }
}
