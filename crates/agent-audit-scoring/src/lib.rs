#![forbid(unsafe_code)]

use agent_audit_domain::{RunId, ScoreSnapshot, TraceEvent};

pub const DEFAULT_BASE_SCORE: i64 = 50;

pub const MIN_SCORE: i64 = 0;
pub const MAX_SCORE: i64 = 100;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScoreConfig {
    pub base_score: i64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            base_score: DEFAULT_BASE_SCORE,
        }
    }
}

fn clamp_score(raw: i64) -> u8 {
    u8::try_from(raw.clamp(MIN_SCORE, MAX_SCORE)).unwrap_or(u8::MAX)
}

/// Compute one post-clamp score snapshot per step, in input order.
///
/// The score is an explicit left-to-right fold over the step deltas starting
/// at the configured base: same steps always yield the same sequence, so a
/// run can be replayed deterministically for auditing. Missing deltas count
/// as 0, and the running value is clamped into `[0, 100]` after every step.
/// `top_contributors` stays empty; the field reserves space for future
/// factor attribution without committing to a model here.
#[must_use]
pub fn compute_scores(
    run_id: RunId,
    steps: &[TraceEvent],
    config: &ScoreConfig,
) -> Vec<ScoreSnapshot> {
    steps
        .iter()
        .scan(config.base_score, |score, step| {
            *score = score
                .saturating_add(step.score_delta.unwrap_or(0))
                .clamp(MIN_SCORE, MAX_SCORE);
            Some(ScoreSnapshot {
                run_id,
                step_index: step.index,
                score: clamp_score(*score),
                top_contributors: Vec::new(),
            })
        })
        .collect()
}
