//! Week-over-week score comparison, z-score anomalies and windowed board trends
//! over the daily trend snapshots.

use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate};
use jbes_core::{BoardId, Clock, TrendSnapshot};
use jbes_storage::{RecordStore, StoreResult};
use serde::Serialize;

use crate::stats::{mean, round_to, std_dev};

const WEEKLY_LOOKBACK_WEEKS: i64 = 12;
const ANOMALY_WINDOW_DAYS: i64 = 30;
const ANOMALY_MIN_SNAPSHOTS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

impl TrendDirection {
    fn from_delta(delta: f64, threshold: f64) -> Self {
        if delta > threshold {
            Self::Up
        } else if delta < -threshold {
            Self::Down
        } else {
            Self::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyComparison {
    pub board_id: BoardId,
    pub week_start: NaiveDate,
    pub this_week_avg: f64,
    pub last_week_avg: f64,
    pub change: f64,
    pub direction: TrendDirection,
    pub trend_duration_weeks: u32,
    pub volatility: f64,
    pub momentum: f64,
}

pub fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(i64::from(day.weekday().num_days_from_sunday()))
}

fn scores_in(snapshots: &[TrendSnapshot], from: NaiveDate, until: NaiveDate) -> Vec<f64> {
    snapshots
        .iter()
        .filter(|s| s.snapshot_date >= from && s.snapshot_date < until)
        .map(|s| s.overall_score)
        .collect()
}

/// Compares the week containing `today` (weeks start Sunday) with the week before.
///
/// `trend_duration_weeks` counts consecutive rising or falling weeks. Flat
/// weeks never form a streak, so a stable comparison reports 1.
pub fn weekly_comparison(board_id: BoardId, snapshots: &[TrendSnapshot], today: NaiveDate) -> Option<WeeklyComparison> {
    let start = week_start(today);
    let week_avg = |k: i64| {
        let from = start - Duration::weeks(k);
        mean(&scores_in(snapshots, from, from + Duration::weeks(1)))
    };

    let this_scores = scores_in(snapshots, start, start + Duration::weeks(1));
    let this_avg = mean(&this_scores)?;
    let last_avg = week_avg(1)?;
    let change = this_avg - last_avg;
    let direction = TrendDirection::from_delta(change, 1.0);

    let mut duration = 1;
    let mut newer = last_avg;
    let lookback = if direction == TrendDirection::Stable { 1 } else { WEEKLY_LOOKBACK_WEEKS };
    for k in 2..=lookback {
        let Some(older) = week_avg(k) else {
            break;
        };
        if TrendDirection::from_delta(newer - older, 1.0) != direction {
            break;
        }
        duration += 1;
        newer = older;
    }

    Some(WeeklyComparison {
        board_id,
        week_start: start,
        this_week_avg: round_to(this_avg, 1),
        last_week_avg: round_to(last_avg, 1),
        change: round_to(change, 1),
        direction,
        trend_duration_weeks: duration,
        volatility: std_dev(&this_scores).map(|v| round_to(v, 2)).unwrap_or(0.0),
        momentum: change.round(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMetric {
    OverallScore,
    AvgLifespan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyAlert {
    pub board_id: BoardId,
    pub metric: AnomalyMetric,
    pub current_value: f64,
    pub expected_value: f64,
    pub deviation: f64,
    pub severity: AnomalySeverity,
    pub snapshot_date: NaiveDate,
    pub description: String,
}

fn z_alert(values: &[f64], current: f64) -> Option<(f64, f64, AnomalySeverity)> {
    let avg = mean(values)?;
    let sd = std_dev(values)?;
    if sd == 0.0 {
        return None;
    }
    let z = (current - avg) / sd;
    let severity = if z.abs() > 3.0 {
        AnomalySeverity::High
    } else if z.abs() > 2.0 {
        AnomalySeverity::Medium
    } else {
        return None;
    };
    Some((avg, z, severity))
}

/// Flags the latest snapshot when it sits more than two standard deviations
/// from the window mean. `snapshots` is oldest first.
pub fn detect_anomalies(board_id: BoardId, snapshots: &[TrendSnapshot]) -> Vec<AnomalyAlert> {
    let mut alerts = Vec::new();
    let Some(latest) = snapshots.last() else {
        return alerts;
    };
    if snapshots.len() < ANOMALY_MIN_SNAPSHOTS {
        return alerts;
    }

    let scores: Vec<f64> = snapshots.iter().map(|s| s.overall_score).collect();
    if let Some((avg, z, severity)) = z_alert(&scores, latest.overall_score) {
        let expected = avg.round();
        alerts.push(AnomalyAlert {
            board_id,
            metric: AnomalyMetric::OverallScore,
            current_value: latest.overall_score,
            expected_value: expected,
            deviation: round_to(z, 1),
            severity,
            snapshot_date: latest.snapshot_date,
            description: format!(
                "Unusual {} in overall score ({} vs expected {})",
                if z > 0.0 { "spike" } else { "drop" },
                latest.overall_score,
                expected
            ),
        });
    }

    let lifespans: Vec<f64> = snapshots.iter().filter_map(|s| s.avg_lifespan_days).collect();
    if let (Some(current), true) = (latest.avg_lifespan_days, lifespans.len() >= ANOMALY_MIN_SNAPSHOTS) {
        if let Some((avg, z, severity)) = z_alert(&lifespans, current) {
            let expected = avg.round();
            alerts.push(AnomalyAlert {
                board_id,
                metric: AnomalyMetric::AvgLifespan,
                current_value: current,
                expected_value: expected,
                deviation: round_to(z, 1),
                severity,
                snapshot_date: latest.snapshot_date,
                description: format!(
                    "Unusual {} in average lifespan ({}d vs expected {}d)",
                    if z > 0.0 { "increase" } else { "decrease" },
                    current,
                    expected
                ),
            });
        }
    }
    alerts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStrength {
    Strong,
    Moderate,
    Weak,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardTrend {
    pub board_id: BoardId,
    pub days: i64,
    pub snapshots: usize,
    pub first_score: f64,
    pub last_score: f64,
    pub change_percent: f64,
    pub direction: TrendDirection,
    pub strength: TrendStrength,
}

/// First versus last snapshot of the window; `None` with fewer than two snapshots.
pub fn board_trend(board_id: BoardId, snapshots: &[TrendSnapshot], days: i64) -> Option<BoardTrend> {
    if snapshots.len() < 2 {
        return None;
    }
    let first = snapshots.first()?.overall_score;
    let last = snapshots.last()?.overall_score;
    let change_percent = if first == 0.0 {
        if last == 0.0 {
            0.0
        } else {
            100.0
        }
    } else {
        (last - first) / first * 100.0
    };
    let strength = if change_percent.abs() > 5.0 {
        TrendStrength::Strong
    } else if change_percent.abs() > 2.0 {
        TrendStrength::Moderate
    } else {
        TrendStrength::Weak
    };
    Some(BoardTrend {
        board_id,
        days,
        snapshots: snapshots.len(),
        first_score: first,
        last_score: last,
        change_percent: round_to(change_percent, 1),
        direction: TrendDirection::from_delta(change_percent, 2.0),
        strength,
    })
}

pub struct TrendDetector {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl TrendDetector {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn weekly_comparison(&self, board_id: BoardId) -> StoreResult<Option<WeeklyComparison>> {
        let today = self.clock.today();
        let since = week_start(today) - Duration::weeks(WEEKLY_LOOKBACK_WEEKS);
        let snapshots = self.store.trend_snapshots(board_id, since).await?;
        Ok(weekly_comparison(board_id, &snapshots, today))
    }

    pub async fn detect_anomalies(&self, board_id: BoardId) -> StoreResult<Vec<AnomalyAlert>> {
        let since = self.clock.today() - Duration::days(ANOMALY_WINDOW_DAYS);
        let snapshots = self.store.trend_snapshots(board_id, since).await?;
        Ok(detect_anomalies(board_id, &snapshots))
    }

    pub async fn board_trend(&self, board_id: BoardId, days: i64) -> StoreResult<Option<BoardTrend>> {
        let since = self.clock.today() - Duration::days(days.max(1));
        let snapshots = self.store.trend_snapshots(board_id, since).await?;
        Ok(board_trend(board_id, &snapshots, days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn snap(day: NaiveDate, score: f64, lifespan: Option<f64>) -> TrendSnapshot {
        TrendSnapshot {
            board_id: 1,
            snapshot_date: day,
            overall_score: score,
            avg_lifespan_days: lifespan,
            avg_repost_rate: None,
            avg_employer_score: None,
            avg_candidate_score: None,
            total_postings: 0,
        }
    }

    // 2026-06-07 is a Sunday.
    #[test]
    fn weeks_start_on_sunday() {
        assert_eq!(week_start(date(2026, 6, 10)), date(2026, 6, 7));
        assert_eq!(week_start(date(2026, 6, 7)), date(2026, 6, 7));
        assert_eq!(week_start(date(2026, 6, 6)), date(2026, 5, 31));
    }

    #[test]
    fn weekly_comparison_counts_consecutive_rises() {
        let snapshots = vec![
            snap(date(2026, 5, 19), 60.0, None),
            snap(date(2026, 5, 26), 64.0, None),
            snap(date(2026, 6, 2), 70.0, None),
            snap(date(2026, 6, 8), 74.0, None),
            snap(date(2026, 6, 9), 76.0, None),
        ];
        let cmp = weekly_comparison(1, &snapshots, date(2026, 6, 10)).unwrap();
        assert_eq!(cmp.this_week_avg, 75.0);
        assert_eq!(cmp.last_week_avg, 70.0);
        assert_eq!(cmp.direction, TrendDirection::Up);
        assert_eq!(cmp.trend_duration_weeks, 3);
        assert_eq!(cmp.volatility, 1.0);
        assert_eq!(cmp.momentum, 5.0);
    }

    #[test]
    fn weekly_comparison_needs_both_weeks() {
        let snapshots = vec![snap(date(2026, 6, 8), 74.0, None)];
        assert!(weekly_comparison(1, &snapshots, date(2026, 6, 10)).is_none());
    }

    #[test]
    fn small_changes_are_stable() {
        let snapshots = vec![snap(date(2026, 6, 2), 70.0, None), snap(date(2026, 6, 8), 70.5, None)];
        let cmp = weekly_comparison(1, &snapshots, date(2026, 6, 10)).unwrap();
        assert_eq!(cmp.direction, TrendDirection::Stable);
        assert_eq!(cmp.trend_duration_weeks, 1);
    }

    #[test]
    fn flat_weeks_do_not_build_a_streak() {
        let snapshots = vec![
            snap(date(2026, 5, 12), 70.0, None),
            snap(date(2026, 5, 19), 70.2, None),
            snap(date(2026, 5, 26), 69.9, None),
            snap(date(2026, 6, 2), 70.1, None),
            snap(date(2026, 6, 8), 70.0, None),
        ];
        let cmp = weekly_comparison(1, &snapshots, date(2026, 6, 10)).unwrap();
        assert_eq!(cmp.direction, TrendDirection::Stable);
        assert_eq!(cmp.trend_duration_weeks, 1);
    }

    #[test]
    fn score_drop_raises_high_alert() {
        let mut snapshots: Vec<TrendSnapshot> = (1..=20)
            .map(|d| snap(date(2026, 6, d), if d % 2 == 0 { 71.0 } else { 69.0 }, Some(20.0)))
            .collect();
        snapshots.push(snap(date(2026, 6, 21), 40.0, Some(20.0)));
        let alerts = detect_anomalies(1, &snapshots);
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.metric, AnomalyMetric::OverallScore);
        assert_eq!(alert.severity, AnomalySeverity::High);
        assert_eq!(alert.deviation, -4.4);
        assert_eq!(alert.expected_value, 69.0);
        assert_eq!(alert.description, "Unusual drop in overall score (40 vs expected 69)");
    }

    #[test]
    fn flat_history_or_short_window_never_alerts() {
        let flat: Vec<TrendSnapshot> = (1..=10).map(|d| snap(date(2026, 6, d), 70.0, Some(12.0))).collect();
        assert!(detect_anomalies(1, &flat).is_empty());
        let short: Vec<TrendSnapshot> = (1..=6).map(|d| snap(date(2026, 6, d), d as f64 * 10.0, None)).collect();
        assert!(detect_anomalies(1, &short).is_empty());
    }

    #[test]
    fn board_trend_reports_direction_and_strength() {
        let snapshots = vec![
            snap(date(2026, 6, 1), 50.0, None),
            snap(date(2026, 6, 5), 60.0, None),
            snap(date(2026, 6, 9), 53.0, None),
        ];
        let trend = board_trend(1, &snapshots, 30).unwrap();
        assert_eq!(trend.change_percent, 6.0);
        assert_eq!(trend.direction, TrendDirection::Up);
        assert_eq!(trend.strength, TrendStrength::Strong);
        assert!(board_trend(1, &snapshots[..1], 30).is_none());
    }
}
