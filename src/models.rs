use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type CellId = i32;

/// Kind of edit action, as reported by the history aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionType {
    Creation,
    Deletion,
    TagChange,
    GeometryChange,
}

impl fmt::Display for ContributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContributionType::Creation => write!(f, "CREATION"),
            ContributionType::Deletion => write!(f, "DELETION"),
            ContributionType::TagChange => write!(f, "TAG_CHANGE"),
            ContributionType::GeometryChange => write!(f, "GEOMETRY_CHANGE"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeCounts(pub BTreeMap<ContributionType, i64>);

impl fmt::Display for TypeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, (kind, count)) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{kind}={count}")?;
        }
        write!(f, "}}")
    }
}

/// Edit statistics of one cell for one calendar month.
///
/// `month` is always the first day of the month. The sum of `user_counts`
/// is counted at a different granularity than `contributions` and need not
/// match it.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyAggregate {
    pub month: NaiveDate,
    pub contributions: i64,
    pub type_counts: TypeCounts,
    pub user_counts: BTreeMap<i64, i64>,
}

impl MonthlyAggregate {
    pub fn empty(month: NaiveDate) -> Self {
        Self {
            month,
            contributions: 0,
            type_counts: TypeCounts::default(),
            user_counts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CumulativePoint {
    pub month: NaiveDate,
    pub count: i64,
}

/// Running total of contributions over a trimmed series of months.
#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeSeries {
    pub points: Vec<CumulativePoint>,
}

/// Coefficients of `f(t) = a / (1 + b * exp(-k * (t - u)))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FittedCurve {
    pub a: f64,
    pub b: f64,
    pub k: f64,
    pub u: f64,
}

impl FittedCurve {
    pub fn from_params(params: [f64; 4]) -> Self {
        Self {
            a: params[0],
            b: params[1],
            k: params[2],
            u: params[3],
        }
    }

    pub fn value_at(&self, t: f64) -> f64 {
        self.a / (1.0 + self.b * (-self.k * (t - self.u)).exp())
    }
}

impl fmt::Display for FittedCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.a, self.b, self.k, self.u)
    }
}

/// Result of the follow-up query for one cell and one month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityEdits {
    pub entities: i64,
    pub geometry_edits: i64,
    pub tag_edits: i64,
}

/// GeoJSON geometry of a grid cell, forwarded verbatim to the follow-up query.
#[derive(Debug, Clone, PartialEq)]
pub struct CellGeometry(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub month: NaiveDate,
    pub active_users: usize,
    pub contributions: i64,
    pub contribution_delta: i64,
    pub relative_change: f64,
    pub max_user_contribution: i64,
    pub curve: FittedCurve,
    pub type_counts: TypeCounts,
    pub entity_edits: EntityEdits,
    pub normalized_residual: f64,
}
