use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defects per hour from which a machine is reported as `Warning`.
pub const WARNING_DEFECT_RATE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
}

impl HealthStatus {
    pub fn from_defect_rate(rate: f64) -> Self {
        if rate < WARNING_DEFECT_RATE {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        }
    }
}

/// Counts the store computes for one machine over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct StatsAggregate {
    pub events_count: i64,
    /// Sum of defect counts, the unknown sentinel excluded.
    pub defects_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStats {
    pub machine_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub events_count: i64,
    pub defects_count: i64,
    pub avg_defect_rate: f64,
    pub status: HealthStatus,
}

/// Window length in hours, at whole-second resolution.
pub fn window_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_seconds() as f64 / 3600.0
}

/// Defects per hour over the window, or 0 when the window is empty or inverted.
pub fn defect_rate(defects_count: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let hours = window_hours(start, end);
    if hours > 0.0 {
        defects_count as f64 / hours
    } else {
        0.0
    }
}

impl MachineStats {
    pub fn from_aggregate(
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        aggregate: StatsAggregate,
    ) -> Self {
        let avg_defect_rate = defect_rate(aggregate.defects_count, start, end);

        Self {
            machine_id: machine_id.to_owned(),
            start,
            end,
            events_count: aggregate.events_count,
            defects_count: aggregate.defects_count,
            avg_defect_rate,
            status: HealthStatus::from_defect_rate(avg_defect_rate),
        }
    }
}
