use std::time::Duration;

use chrono::NaiveDate;

/// One-sided 95% critical value of the standard normal distribution.
pub const CRITICAL_VALUE_95: f64 = 1.644854;

pub const DEFAULT_FIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    /// Months on or before this date are left out of the curve fit.
    pub cutoff: NaiveDate,
    pub fit_timeout: Duration,
    pub threshold: f64,
    /// First month of the aggregation grid (inclusive).
    pub grid_start: NaiveDate,
    /// End of the aggregation grid (exclusive).
    pub grid_end: NaiveDate,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cutoff: ymd(2007, 9, 30),
            fit_timeout: DEFAULT_FIT_TIMEOUT,
            threshold: CRITICAL_VALUE_95,
            grid_start: ymd(2004, 1, 1),
            grid_end: ymd(2019, 2, 1),
        }
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}
