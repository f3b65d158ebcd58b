//! Composite 0-100 efficiency score per board with a repost-quality discount.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jbes_core::{BoardId, Clock, EfficiencyScore, SurveyRatings, TrendSnapshot};
use jbes_storage::{PostingFilter, RecordStore, StoreResult};
use serde::Serialize;
use tracing::warn;

use crate::aggregates::{lifespan_metrics, repost_frequency};
use crate::stats::mean;

pub const LIFESPAN_WEIGHT: f64 = 0.40;
pub const REPOST_WEIGHT: f64 = 0.30;
pub const EMPLOYER_WEIGHT: f64 = 0.20;
pub const CANDIDATE_WEIGHT: f64 = 0.10;

const NEUTRAL_SURVEY_SCORE: f64 = 50.0;

fn clamp_score(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// 100 at a week or less, 0 at 60 days or more.
pub fn lifespan_score(avg_lifespan_days: f64) -> f64 {
    clamp_score(100.0 - (avg_lifespan_days - 7.0) / 53.0 * 100.0)
}

pub fn repost_score(repost_rate_percent: f64) -> f64 {
    clamp_score(100.0 - repost_rate_percent * 2.0)
}

fn is_valid_rating(rating: f64) -> bool {
    (1.0..=5.0).contains(&rating)
}

fn valid_ratings(ratings: &[f64]) -> Vec<f64> {
    ratings.iter().copied().filter(|r| is_valid_rating(*r)).collect()
}

/// Ratings outside 1-5 (or NaN) that scoring ignores.
pub fn out_of_range_ratings(ratings: &[f64]) -> usize {
    ratings.iter().filter(|r| !is_valid_rating(**r)).count()
}

/// Mean 1-5 rating scaled to 0-100; neutral 50 without ratings.
pub fn survey_score(ratings: &[f64]) -> f64 {
    mean(&valid_ratings(ratings))
        .map(|avg| clamp_score(avg / 5.0 * 100.0))
        .unwrap_or(NEUTRAL_SURVEY_SCORE)
}

pub fn quality_adjustment(repost_rate_percent: f64) -> f64 {
    match repost_rate_percent {
        r if r < 5.0 => 1.0,
        r if r < 15.0 => 0.95,
        r if r < 30.0 => 0.85,
        r if r < 50.0 => 0.70,
        _ => 0.0,
    }
}

pub fn data_completeness(has_lifespan: bool, has_reposts: bool, ratings: &SurveyRatings) -> f64 {
    let present = [
        has_lifespan,
        has_reposts,
        !valid_ratings(&ratings.employer).is_empty(),
        !valid_ratings(&ratings.candidate).is_empty(),
    ];
    present.iter().filter(|p| **p).count() as f64 / present.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    #[serde(rename = "B+")]
    BPlus,
    B,
    #[serde(rename = "C+")]
    CPlus,
    C,
    D,
    F,
}

impl Grade {
    pub fn for_score(score: i32) -> Self {
        match score {
            s if s >= 90 => Self::APlus,
            s if s >= 85 => Self::A,
            s if s >= 80 => Self::BPlus,
            s if s >= 75 => Self::B,
            s if s >= 70 => Self::CPlus,
            s if s >= 60 => Self::C,
            s if s >= 50 => Self::D,
            _ => Self::F,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComponentBreakdown {
    pub weight: f64,
    pub score: f64,
    pub contribution: f64,
}

impl ComponentBreakdown {
    fn new(weight: f64, score: f64) -> Self {
        Self {
            weight,
            score,
            contribution: weight * score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub lifespan: ComponentBreakdown,
    pub reposts: ComponentBreakdown,
    pub employer_survey: ComponentBreakdown,
    pub candidate_survey: ComponentBreakdown,
    pub base_score: i32,
    pub quality_adjustment: f64,
    pub overall_score: i32,
}

/// Everything one board's score is computed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreInputs {
    pub board_id: BoardId,
    pub avg_lifespan_days: Option<f64>,
    pub repost_rate: Option<f64>,
    pub total_postings: i64,
    pub ratings: SurveyRatings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardScore {
    pub score: EfficiencyScore,
    pub breakdown: ScoreBreakdown,
    pub inputs: ScoreInputs,
}

impl BoardScore {
    /// Daily rollup row for this score.
    pub fn trend_snapshot(&self) -> TrendSnapshot {
        let has_employer = !valid_ratings(&self.inputs.ratings.employer).is_empty();
        let has_candidate = !valid_ratings(&self.inputs.ratings.candidate).is_empty();
        TrendSnapshot {
            board_id: self.score.board_id,
            snapshot_date: self.score.computed_at.date_naive(),
            overall_score: f64::from(self.score.overall_score),
            avg_lifespan_days: self.inputs.avg_lifespan_days,
            avg_repost_rate: self.inputs.repost_rate,
            avg_employer_score: has_employer.then_some(self.score.employer_survey_score),
            avg_candidate_score: has_candidate.then_some(self.score.candidate_survey_score),
            total_postings: self.inputs.total_postings,
        }
    }
}

/// Scores a board, or `None` when lifespan or repost data is missing.
pub fn compute_score(inputs: ScoreInputs, computed_at: DateTime<Utc>) -> Option<BoardScore> {
    let avg_lifespan = inputs.avg_lifespan_days?;
    let repost_rate = inputs.repost_rate?;

    let lifespan = ComponentBreakdown::new(LIFESPAN_WEIGHT, lifespan_score(avg_lifespan));
    let reposts = ComponentBreakdown::new(REPOST_WEIGHT, repost_score(repost_rate));
    let employer = ComponentBreakdown::new(EMPLOYER_WEIGHT, survey_score(&inputs.ratings.employer));
    let candidate = ComponentBreakdown::new(CANDIDATE_WEIGHT, survey_score(&inputs.ratings.candidate));

    let base = (lifespan.contribution + reposts.contribution + employer.contribution + candidate.contribution)
        .round() as i32;
    let adjustment = quality_adjustment(repost_rate);
    let overall = (f64::from(base) * adjustment).round().clamp(0.0, 100.0) as i32;

    let score = EfficiencyScore {
        board_id: inputs.board_id,
        overall_score: overall,
        lifespan_score: lifespan.score,
        repost_score: reposts.score,
        employer_survey_score: employer.score,
        candidate_survey_score: candidate.score,
        quality_adjustment: adjustment,
        data_completeness: data_completeness(true, true, &inputs.ratings),
        percentile: None,
        computed_at,
    };
    Some(BoardScore {
        score,
        breakdown: ScoreBreakdown {
            lifespan,
            reposts,
            employer_survey: employer,
            candidate_survey: candidate,
            base_score: base,
            quality_adjustment: adjustment,
            overall_score: overall,
        },
        inputs,
    })
}

/// Assigns percentiles in place: descending `overall_score`, stable for ties.
pub fn assign_percentiles(scores: &mut [EfficiencyScore]) {
    let n = scores.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].overall_score.cmp(&scores[a].overall_score));
    for (rank, idx) in order.into_iter().enumerate() {
        let pct = ((n - rank) as f64 / n as f64 * 100.0).round() as i32;
        scores[idx].percentile = Some(pct);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedScore {
    pub rank: usize,
    pub grade: Grade,
    pub score: EfficiencyScore,
}

/// Sorts by descending score and attaches 1-based rank, percentile and grade.
pub fn rank_scores(mut scores: Vec<EfficiencyScore>) -> Vec<RankedScore> {
    assign_percentiles(&mut scores);
    scores.sort_by(|a, b| b.overall_score.cmp(&a.overall_score));
    scores
        .into_iter()
        .enumerate()
        .map(|(i, score)| RankedScore {
            rank: i + 1,
            grade: Grade::for_score(score.overall_score),
            score,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBucket {
    pub label: &'static str,
    pub count: usize,
    pub percentage: f64,
}

const SCORE_BUCKETS: [(&str, i32, i32); 6] = [
    ("0-20", 0, 20),
    ("20-40", 20, 40),
    ("40-60", 40, 60),
    ("60-80", 60, 80),
    ("80-90", 80, 90),
    ("90-100", 90, 100),
];

/// Each score lands in the first bucket whose inclusive bounds contain it.
pub fn score_distribution(scores: &[EfficiencyScore]) -> Vec<ScoreBucket> {
    let mut counts = [0usize; SCORE_BUCKETS.len()];
    for score in scores {
        if let Some(i) = SCORE_BUCKETS
            .iter()
            .position(|&(_, lo, hi)| (lo..=hi).contains(&score.overall_score))
        {
            counts[i] += 1;
        }
    }
    SCORE_BUCKETS
        .iter()
        .zip(counts)
        .map(|(&(label, _, _), count)| ScoreBucket {
            label,
            count,
            percentage: if scores.is_empty() {
                0.0
            } else {
                (count as f64 / scores.len() as f64 * 100.0).round()
            },
        })
        .collect()
}

pub struct EfficiencyScorer {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl EfficiencyScorer {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn score_inputs(&self, board_id: BoardId) -> StoreResult<ScoreInputs> {
        let postings = self
            .store
            .select_postings(&PostingFilter::for_board(board_id))
            .await?;
        let ratings = self.store.survey_ratings(board_id).await?;
        let (employer, candidate) = (
            out_of_range_ratings(&ratings.employer),
            out_of_range_ratings(&ratings.candidate),
        );
        if employer + candidate > 0 {
            warn!(board_id, employer, candidate, "ignoring out-of-range survey ratings");
        }
        let now = self.clock.now();
        Ok(ScoreInputs {
            board_id,
            avg_lifespan_days: lifespan_metrics(board_id, &postings, now).map(|m| m.avg_lifespan_days),
            repost_rate: repost_frequency(board_id, &postings).map(|m| m.repost_rate),
            total_postings: postings.len() as i64,
            ratings,
        })
    }

    /// Computes without persisting; percentile stays unset.
    pub async fn compute_board_score(&self, board_id: BoardId) -> StoreResult<Option<BoardScore>> {
        let inputs = self.score_inputs(board_id).await?;
        Ok(compute_score(inputs, self.clock.now()))
    }

    pub async fn latest_ranked_scores(&self) -> StoreResult<Vec<RankedScore>> {
        let latest = self.store.latest_scores().await?;
        Ok(rank_scores(latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 6, 6, 0, 0).single().unwrap()
    }

    fn inputs(avg: Option<f64>, rate: Option<f64>, employer: Vec<f64>, candidate: Vec<f64>) -> ScoreInputs {
        ScoreInputs {
            board_id: 1,
            avg_lifespan_days: avg,
            repost_rate: rate,
            total_postings: 10,
            ratings: SurveyRatings { employer, candidate },
        }
    }

    fn score_of(overall: i32) -> EfficiencyScore {
        let mut s = compute_score(inputs(Some(7.0), Some(0.0), vec![], vec![]), at())
            .unwrap()
            .score;
        s.overall_score = overall;
        s
    }

    #[test]
    fn worked_example_without_surveys() {
        let board = compute_score(inputs(Some(20.0), Some(10.0), vec![], vec![]), at()).unwrap();
        assert!((board.score.lifespan_score - 75.471_698).abs() < 1e-4);
        assert_eq!(board.score.repost_score, 80.0);
        assert_eq!(board.score.employer_survey_score, 50.0);
        assert_eq!(board.breakdown.base_score, 69);
        assert_eq!(board.score.quality_adjustment, 0.95);
        assert_eq!(board.score.overall_score, 66);
        assert_eq!(board.score.data_completeness, 0.5);
    }

    #[test]
    fn surveys_and_completeness() {
        let board = compute_score(inputs(Some(7.0), Some(0.0), vec![5.0, 3.0], vec![4.0, 9.0]), at()).unwrap();
        assert_eq!(board.score.employer_survey_score, 80.0);
        assert_eq!(board.score.candidate_survey_score, 80.0);
        assert_eq!(board.score.data_completeness, 1.0);
        assert_eq!(board.score.overall_score, 94);

        let snap = board.trend_snapshot();
        assert_eq!(snap.avg_employer_score, Some(80.0));
        assert_eq!(snap.overall_score, 94.0);
    }

    #[test]
    fn out_of_range_ratings_are_counted() {
        assert_eq!(out_of_range_ratings(&[5.0, 0.0, 4.0, 9.0, f64::NAN]), 3);
        assert_eq!(out_of_range_ratings(&[1.0, 5.0]), 0);
        assert_eq!(survey_score(&[0.0, 9.0]), 50.0);
    }

    #[test]
    fn missing_metrics_skip_the_board() {
        assert!(compute_score(inputs(None, Some(0.0), vec![], vec![]), at()).is_none());
        assert!(compute_score(inputs(Some(3.0), None, vec![], vec![]), at()).is_none());
    }

    #[test]
    fn heavy_reposting_zeroes_the_score() {
        let board = compute_score(inputs(Some(1.0), Some(55.0), vec![5.0], vec![5.0]), at()).unwrap();
        assert_eq!(board.score.quality_adjustment, 0.0);
        assert_eq!(board.score.overall_score, 0);
    }

    #[test]
    fn overall_stays_in_range_and_adjustment_never_increases() {
        for avg in [0.0, 7.0, 33.0, 60.0, 400.0] {
            for rate in [0.0, 4.9, 14.9, 29.9, 49.9, 100.0] {
                let s = compute_score(inputs(Some(avg), Some(rate), vec![1.0], vec![5.0]), at()).unwrap();
                assert!((0..=100).contains(&s.score.overall_score));
            }
        }
        let rates = [0.0, 5.0, 14.0, 15.0, 29.0, 30.0, 49.0, 50.0, 90.0];
        for pair in rates.windows(2) {
            assert!(quality_adjustment(pair[1]) <= quality_adjustment(pair[0]));
        }
    }

    #[test]
    fn percentiles_favour_the_top_score() {
        let ranked = rank_scores(vec![score_of(60), score_of(80), score_of(70)]);
        assert_eq!(ranked[0].score.overall_score, 80);
        assert_eq!(ranked[0].score.percentile, Some(100));
        assert_eq!(ranked[1].score.percentile, Some(67));
        assert_eq!(ranked[2].score.percentile, Some(33));
        assert_eq!(ranked[0].grade, Grade::BPlus);
        assert_eq!(ranked[2].rank, 3);
    }

    #[test]
    fn distribution_uses_first_matching_bucket() {
        let scores = vec![score_of(20), score_of(90), score_of(55), score_of(100)];
        let counts: Vec<usize> = score_distribution(&scores).iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 0, 1, 0, 1, 1]);
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(Grade::for_score(90).as_str(), "A+");
        assert_eq!(Grade::for_score(89).as_str(), "A");
        assert_eq!(Grade::for_score(59).as_str(), "D");
        assert_eq!(Grade::for_score(49).as_str(), "F");
    }
}
