//! Lifespan and repost summaries per board and per role family.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use jbes_core::{BoardId, Clock, Posting, RoleFamily, MILLIS_PER_DAY};
use jbes_storage::{PostingFilter, RecordStore, StoreResult};
use serde::Serialize;

use crate::stats::{mean, median_sorted, percentile_sorted, round_to};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifespanMetrics {
    pub board_id: BoardId,
    pub avg_lifespan_days: f64,
    pub median_lifespan_days: i64,
    pub p25_lifespan_days: i64,
    pub p75_lifespan_days: i64,
    pub min_lifespan_days: i64,
    pub max_lifespan_days: i64,
    pub total_postings: usize,
    pub active_days_avg: Option<f64>,
}

/// Lifespan summary over postings with lifespan data, `None` when there is none.
pub fn lifespan_metrics(board_id: BoardId, postings: &[Posting], now: DateTime<Utc>) -> Option<LifespanMetrics> {
    let mut spans: Vec<i64> = postings.iter().filter_map(|p| p.lifespan_days).collect();
    if spans.is_empty() {
        return None;
    }
    spans.sort_unstable();
    let total: i64 = spans.iter().sum();

    let active_days: Vec<f64> = postings
        .iter()
        .filter(|p| !p.disappeared)
        .filter_map(|p| p.first_seen)
        .map(|seen| ((now - seen).num_milliseconds().max(0) / MILLIS_PER_DAY) as f64)
        .collect();

    Some(LifespanMetrics {
        board_id,
        avg_lifespan_days: round_to(total as f64 / spans.len() as f64, 1),
        median_lifespan_days: median_sorted(&spans)?,
        p25_lifespan_days: percentile_sorted(&spans, 25.0)?,
        p75_lifespan_days: percentile_sorted(&spans, 75.0)?,
        min_lifespan_days: spans[0],
        max_lifespan_days: spans[spans.len() - 1],
        total_postings: spans.len(),
        active_days_avg: mean(&active_days).map(|d| round_to(d, 1)),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifespanBucket {
    pub label: &'static str,
    pub min_days: i64,
    pub max_days: Option<i64>,
    pub count: usize,
    pub percentage: f64,
}

const LIFESPAN_BUCKETS: [(&str, i64, Option<i64>); 6] = [
    ("0-7", 0, Some(7)),
    ("8-14", 8, Some(14)),
    ("15-30", 15, Some(30)),
    ("31-60", 31, Some(60)),
    ("61-90", 61, Some(90)),
    ("90+", 91, None),
];

pub fn lifespan_distribution(postings: &[Posting]) -> Vec<LifespanBucket> {
    let spans: Vec<i64> = postings.iter().filter_map(|p| p.lifespan_days).collect();
    let total = spans.len();
    LIFESPAN_BUCKETS
        .iter()
        .map(|&(label, min_days, max_days)| {
            let count = spans
                .iter()
                .filter(|&&d| d >= min_days && max_days.map_or(true, |max| d <= max))
                .count();
            let percentage = if total == 0 {
                0.0
            } else {
                (count as f64 / total as f64 * 100.0).round()
            };
            LifespanBucket {
                label,
                min_days,
                max_days,
                count,
                percentage,
            }
        })
        .collect()
}

/// Running totals for one role family.
#[derive(Debug, Clone, Default)]
pub struct RoleAggregate {
    pub count: usize,
    pub total_lifespan: i64,
    pub lifespans: Vec<i64>,
    pub boards: IndexMap<BoardId, usize>,
    pub reposted: usize,
    pub total_reposts: i64,
    board_reposts: IndexMap<BoardId, (usize, usize)>,
}

impl RoleAggregate {
    fn add(&mut self, posting: &Posting) {
        self.count += 1;
        *self.boards.entry(posting.board_id).or_default() += 1;
        if let Some(days) = posting.lifespan_days {
            self.total_lifespan += days;
            self.lifespans.push(days);
        }
        let entry = self.board_reposts.entry(posting.board_id).or_default();
        entry.0 += 1;
        if posting.repost_count > 0 {
            self.reposted += 1;
            entry.1 += 1;
        }
        self.total_reposts += posting.repost_count;
    }

    fn most_common_board(&self) -> Option<BoardId> {
        self.boards
            .iter()
            .fold(None, |best: Option<(BoardId, usize)>, (&board, &n)| match best {
                Some((_, top)) if top >= n => best,
                _ => Some((board, n)),
            })
            .map(|(board, _)| board)
    }

    fn worst_repost_board(&self) -> Option<BoardId> {
        self.board_reposts
            .iter()
            .filter(|(_, (_, reposted))| *reposted > 0)
            .map(|(&board, &(total, reposted))| (board, reposted as f64 / total as f64))
            .fold(None, |best: Option<(BoardId, f64)>, (board, rate)| match best {
                Some((_, top)) if top >= rate => best,
                _ => Some((board, rate)),
            })
            .map(|(board, _)| board)
    }
}

pub fn aggregate_by_role_family(postings: &[Posting]) -> IndexMap<RoleFamily, RoleAggregate> {
    let mut map: IndexMap<RoleFamily, RoleAggregate> = IndexMap::new();
    for posting in postings {
        map.entry(posting.normalized_title).or_default().add(posting);
    }
    map
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleLifespan {
    pub role_family: RoleFamily,
    pub count: usize,
    pub avg_lifespan_days: f64,
    pub median_lifespan_days: i64,
    pub boards: usize,
    pub top_board: Option<BoardId>,
}

pub fn role_lifespans(postings: &[Posting], limit: usize) -> Vec<RoleLifespan> {
    let mut rows: Vec<RoleLifespan> = aggregate_by_role_family(postings)
        .into_iter()
        .filter_map(|(family, mut agg)| {
            if agg.lifespans.is_empty() {
                return None;
            }
            agg.lifespans.sort_unstable();
            Some(RoleLifespan {
                role_family: family,
                count: agg.lifespans.len(),
                avg_lifespan_days: round_to(agg.total_lifespan as f64 / agg.lifespans.len() as f64, 1),
                median_lifespan_days: median_sorted(&agg.lifespans)?,
                boards: agg.boards.len(),
                top_board: agg.most_common_board(),
            })
        })
        .collect();
    rows.sort_by(|a, b| b.avg_lifespan_days.total_cmp(&a.avg_lifespan_days));
    rows.truncate(limit);
    rows
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifespanStats {
    pub board_id: BoardId,
    pub total_postings: usize,
    pub active_postings: usize,
    pub disappeared_postings: usize,
    pub metrics: Option<LifespanMetrics>,
    pub by_role_family: Vec<RoleLifespan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepostFrequencyMetrics {
    pub board_id: BoardId,
    pub total_postings: usize,
    pub total_reposts: i64,
    pub repost_rate: f64,
    pub avg_reposts_per_posting: f64,
    pub max_reposts: i64,
    pub unique_reposted: usize,
    pub offenders: usize,
}

const OFFENDER_MIN_REPOSTS: i64 = 3;

pub fn repost_frequency(board_id: BoardId, postings: &[Posting]) -> Option<RepostFrequencyMetrics> {
    if postings.is_empty() {
        return None;
    }
    let total = postings.len();
    let reposted = postings.iter().filter(|p| p.repost_count > 0).count();
    let total_reposts: i64 = postings.iter().map(|p| p.repost_count).sum();
    Some(RepostFrequencyMetrics {
        board_id,
        total_postings: total,
        total_reposts,
        repost_rate: round_to(reposted as f64 / total as f64 * 100.0, 1),
        avg_reposts_per_posting: round_to(total_reposts as f64 / total as f64, 2),
        max_reposts: postings.iter().map(|p| p.repost_count).max().unwrap_or(0),
        unique_reposted: reposted,
        offenders: postings
            .iter()
            .filter(|p| p.repost_count >= OFFENDER_MIN_REPOSTS)
            .count(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    Excellent,
    Good,
    Moderate,
    Concerning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepostSeverity {
    pub level: SeverityLevel,
    pub description: &'static str,
    pub recommendation: &'static str,
}

/// Severity tier for a repost rate in percent, on the quality-adjustment thresholds.
pub fn repost_severity(rate: f64) -> RepostSeverity {
    let (level, description, recommendation) = if rate < 5.0 {
        (
            SeverityLevel::Excellent,
            "Very few reposts; listings reflect real openings",
            "No action needed",
        )
    } else if rate < 15.0 {
        (
            SeverityLevel::Good,
            "Occasional reposts within normal hiring churn",
            "Monitor for changes",
        )
    } else if rate < 30.0 {
        (
            SeverityLevel::Moderate,
            "A noticeable share of listings are reposted",
            "Review frequently reposted roles",
        )
    } else if rate < 50.0 {
        (
            SeverityLevel::Concerning,
            "Many listings are reposted; freshness is doubtful",
            "Treat listing counts with caution",
        )
    } else {
        (
            SeverityLevel::Critical,
            "Most listings are reposts",
            "Listings on this board are not a reliable hiring signal",
        )
    };
    RepostSeverity {
        level,
        description,
        recommendation,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleRepostStats {
    pub role_family: RoleFamily,
    pub total_postings: usize,
    pub reposted: usize,
    pub repost_rate: f64,
    pub avg_reposts: f64,
    pub worst_board: Option<BoardId>,
}

pub fn role_repost_stats(postings: &[Posting], limit: usize) -> Vec<RoleRepostStats> {
    let mut rows: Vec<RoleRepostStats> = aggregate_by_role_family(postings)
        .into_iter()
        .map(|(family, agg)| RoleRepostStats {
            role_family: family,
            total_postings: agg.count,
            reposted: agg.reposted,
            repost_rate: round_to(agg.reposted as f64 / agg.count as f64 * 100.0, 1),
            avg_reposts: round_to(agg.total_reposts as f64 / agg.count as f64, 2),
            worst_board: agg.worst_repost_board(),
        })
        .collect();
    rows.sort_by(|a, b| b.repost_rate.total_cmp(&a.repost_rate));
    rows.truncate(limit);
    rows
}

/// Store-backed entry points over the pure summaries above.
pub struct Aggregator {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn board_postings(&self, board_id: BoardId) -> StoreResult<Vec<Posting>> {
        self.store.select_postings(&PostingFilter::for_board(board_id)).await
    }

    pub async fn board_lifespan_metrics(&self, board_id: BoardId) -> StoreResult<Option<LifespanMetrics>> {
        let postings = self.board_postings(board_id).await?;
        Ok(lifespan_metrics(board_id, &postings, self.clock.now()))
    }

    pub async fn lifespan_distribution(&self, board_id: BoardId) -> StoreResult<Vec<LifespanBucket>> {
        Ok(lifespan_distribution(&self.board_postings(board_id).await?))
    }

    pub async fn board_lifespan_stats(&self, board_id: BoardId) -> StoreResult<LifespanStats> {
        let postings = self.board_postings(board_id).await?;
        let disappeared = postings.iter().filter(|p| p.disappeared).count();
        Ok(LifespanStats {
            board_id,
            total_postings: postings.len(),
            active_postings: postings.len() - disappeared,
            disappeared_postings: disappeared,
            metrics: lifespan_metrics(board_id, &postings, self.clock.now()),
            by_role_family: role_lifespans(&postings, RoleFamily::ALL.len()),
        })
    }

    pub async fn lifespan_by_role_family(&self, limit: usize) -> StoreResult<Vec<RoleLifespan>> {
        let postings = self.store.select_postings(&PostingFilter::all().with_lifespan()).await?;
        Ok(role_lifespans(&postings, limit))
    }

    pub async fn board_repost_frequency(&self, board_id: BoardId) -> StoreResult<Option<RepostFrequencyMetrics>> {
        Ok(repost_frequency(board_id, &self.board_postings(board_id).await?))
    }

    pub async fn repost_frequency_by_role_family(&self, limit: usize) -> StoreResult<Vec<RoleRepostStats>> {
        let postings = self.store.select_postings(&PostingFilter::all()).await?;
        Ok(role_repost_stats(&postings, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn mk(board_id: BoardId, family: RoleFamily, lifespan: Option<i64>, reposts: i64, disappeared: bool) -> Posting {
        Posting {
            id: 0,
            board_id,
            title: "t".into(),
            company: None,
            url: None,
            normalized_title: family,
            first_seen: Some(now() - Duration::days(10) - Duration::hours(3)),
            last_seen: Some(now()),
            disappeared,
            disappeared_at: None,
            lifespan_days: lifespan,
            repost_count: reposts,
            repost_cluster_id: None,
        }
    }

    #[test]
    fn lifespan_metrics_use_nearest_rank_percentiles() {
        let postings: Vec<Posting> = [3, 9, 1, 20, 7]
            .into_iter()
            .map(|d| mk(1, RoleFamily::Sales, Some(d), 0, true))
            .chain([mk(1, RoleFamily::Sales, None, 0, false)])
            .collect();
        let m = lifespan_metrics(1, &postings, now()).unwrap();
        assert_eq!(m.avg_lifespan_days, 8.0);
        assert_eq!(m.median_lifespan_days, 7);
        assert_eq!(m.p25_lifespan_days, 3);
        assert_eq!(m.p75_lifespan_days, 9);
        assert_eq!((m.min_lifespan_days, m.max_lifespan_days), (1, 20));
        assert_eq!(m.total_postings, 5);
        assert_eq!(m.active_days_avg, Some(10.0));

        assert!(lifespan_metrics(1, &postings[5..], now()).is_none());
    }

    #[test]
    fn distribution_buckets_are_inclusive() {
        let postings: Vec<Posting> = [0, 7, 8, 30, 90, 91]
            .into_iter()
            .map(|d| mk(1, RoleFamily::Sales, Some(d), 0, true))
            .collect();
        let counts: Vec<usize> = lifespan_distribution(&postings).iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![2, 1, 1, 0, 1, 1]);
        assert_eq!(lifespan_distribution(&postings)[0].percentage, 33.0);
    }

    #[test]
    fn repost_frequency_counts_offenders() {
        let postings = vec![
            mk(1, RoleFamily::Sales, None, 0, false),
            mk(1, RoleFamily::Sales, None, 4, false),
            mk(1, RoleFamily::Sales, None, 1, false),
        ];
        let m = repost_frequency(1, &postings).unwrap();
        assert_eq!(m.repost_rate, 66.7);
        assert_eq!(m.avg_reposts_per_posting, 1.67);
        assert_eq!(m.max_reposts, 4);
        assert_eq!(m.offenders, 1);
        assert!(repost_frequency(1, &[]).is_none());
    }

    #[test]
    fn severity_follows_rate_tiers() {
        assert_eq!(repost_severity(4.9).level, SeverityLevel::Excellent);
        assert_eq!(repost_severity(5.0).level, SeverityLevel::Good);
        assert_eq!(repost_severity(29.9).level, SeverityLevel::Moderate);
        assert_eq!(repost_severity(30.0).level, SeverityLevel::Concerning);
        assert_eq!(repost_severity(50.0).level, SeverityLevel::Critical);
    }

    #[test]
    fn role_family_rollups_name_top_and_worst_boards() {
        let postings = vec![
            mk(1, RoleFamily::Designer, Some(10), 0, true),
            mk(2, RoleFamily::Designer, Some(20), 2, true),
            mk(2, RoleFamily::Designer, Some(30), 0, true),
            mk(1, RoleFamily::Finance, Some(4), 0, true),
        ];
        let lifespans = role_lifespans(&postings, 10);
        assert_eq!(lifespans[0].role_family, RoleFamily::Designer);
        assert_eq!(lifespans[0].avg_lifespan_days, 20.0);
        assert_eq!(lifespans[0].boards, 2);
        assert_eq!(lifespans[0].top_board, Some(2));
        assert_eq!(role_lifespans(&postings, 1).len(), 1);

        let reposts = role_repost_stats(&postings, 10);
        assert_eq!(reposts[0].role_family, RoleFamily::Designer);
        assert_eq!(reposts[0].repost_rate, 33.3);
        assert_eq!(reposts[0].worst_board, Some(2));
        assert_eq!(reposts[1].worst_board, None);
    }
}
