use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Per-line counts the store computes over a window.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LineAggregate {
    pub line_id: String,
    pub event_count: i64,
    /// Sum of defect counts, the unknown sentinel excluded.
    pub total_defects: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopDefectLine {
    pub line_id: String,
    pub total_defects: i64,
    pub event_count: i64,
    pub defects_percent: f64,
}

impl From<LineAggregate> for TopDefectLine {
    fn from(line: LineAggregate) -> Self {
        Self {
            defects_percent: defects_percent(line.total_defects, line.event_count),
            line_id: line.line_id,
            total_defects: line.total_defects,
            event_count: line.event_count,
        }
    }
}

/// Ranking order: most defects first, then line id.
pub fn rank_order(a: &LineAggregate, b: &LineAggregate) -> Ordering {
    b.total_defects
        .cmp(&a.total_defects)
        .then_with(|| a.line_id.cmp(&b.line_id))
}

/// Keep the `limit` best ranked lines, in ranking order.
///
/// Selects the top `limit` before sorting so only the kept lines are fully ordered.
pub fn top_n(mut lines: Vec<LineAggregate>, limit: usize) -> Vec<LineAggregate> {
    if limit == 0 {
        return Vec::new();
    }
    if lines.len() > limit {
        lines.select_nth_unstable_by(limit - 1, rank_order);
        lines.truncate(limit);
    }
    lines.sort_by(rank_order);
    lines
}

/// Defects per hundred events, rounded half-up to two decimals.
///
/// Rounding happens on the exact ratio in integers, so midpoints like 1.005 go up.
pub fn defects_percent(total_defects: i64, event_count: i64) -> f64 {
    if event_count == 0 {
        return 0.0;
    }
    hundredths_half_up(
        i128::from(total_defects) * 10_000,
        i128::from(event_count),
    ) as f64
        / 100.0
}

/// `numerator / denominator` rounded to the nearest integer, halves away from zero.
/// `denominator` is an event count and always positive.
fn hundredths_half_up(numerator: i128, denominator: i128) -> i128 {
    let rounded = (2 * numerator.abs() + denominator) / (2 * denominator);

    if numerator < 0 {
        -rounded
    } else {
        rounded
    }
}
