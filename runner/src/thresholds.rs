//! Pass/fail criteria evaluated against the aggregated metrics of a run.
//!
//! Thresholds are written `metric: aggregation operator value`, for example
//! `devworkspace_ready_duration: p(95)<120000` or `checks: rate>0.95`.
use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::{
    metrics::{self, Snapshot},
    sampler::PodGroup,
};

/// Errors produced while parsing a threshold.
#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    /// The threshold does not have the `metric: expression` shape.
    #[error("threshold {0:?} must be written metric: aggregation operator value")]
    Syntax(String),
    /// The aggregation is not one of count, value, rate, avg, min, max, med or p(N).
    #[error("unknown aggregation {0:?}")]
    UnknownAggregation(String),
    /// The comparison value is not a number.
    #[error("invalid threshold value {0:?}")]
    InvalidValue(String),
}

/// Statistic of a metric compared by a threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Value of a counter.
    Count,
    /// Value of a gauge.
    Value,
    /// Fraction of passing checks.
    Rate,
    /// Mean of a trend.
    Avg,
    /// Smallest sample of a trend.
    Min,
    /// Largest sample of a trend.
    Max,
    /// Median of a trend.
    Med,
    /// Percentile of a trend, between 0 and 100.
    Percentile(f64),
}

impl FromStr for Aggregation {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, ThresholdError> {
        Ok(match s {
            "count" => Aggregation::Count,
            "value" => Aggregation::Value,
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            other => {
                let percentile = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|n| n.parse::<f64>().ok())
                    .filter(|n| (0.0..=100.0).contains(n))
                    .ok_or_else(|| ThresholdError::UnknownAggregation(other.to_owned()))?;
                Aggregation::Percentile(percentile)
            }
        })
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Count => write!(f, "count"),
            Aggregation::Value => write!(f, "value"),
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

/// Comparison between the aggregated value and the threshold value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// <
    Lt,
    /// <=
    Le,
    /// >
    Gt,
    /// >=
    Ge,
    /// ==
    Eq,
    /// !=
    Ne,
}

impl Operator {
    const ALL: [(&'static str, Operator); 6] = [
        ("<=", Operator::Le),
        (">=", Operator::Ge),
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        ("<", Operator::Lt),
        (">", Operator::Gt),
    ];

    fn symbol(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(symbol, _)| *symbol)
            .unwrap_or_default()
    }

    fn compare(self, actual: f64, expected: f64) -> bool {
        match self {
            Operator::Lt => actual < expected,
            Operator::Le => actual <= expected,
            Operator::Gt => actual > expected,
            Operator::Ge => actual >= expected,
            Operator::Eq => actual == expected,
            Operator::Ne => actual != expected,
        }
    }
}

/// A single pass/fail criterion on one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Metric the threshold applies to
    pub metric: String,
    /// Statistic of the metric that is compared
    pub aggregation: Aggregation,
    /// Comparison
    pub operator: Operator,
    /// Value the statistic is compared with
    pub value: f64,
}

impl Threshold {
    fn new(metric: &str, aggregation: Aggregation, operator: Operator, value: f64) -> Self {
        Self {
            metric: metric.to_owned(),
            aggregation,
            operator,
            value,
        }
    }

    /// Compute the aggregated value of the metric, None when there is no data
    /// to compare with.
    fn actual(&self, snapshot: &Snapshot) -> Option<f64> {
        match self.aggregation {
            Aggregation::Count => Some(snapshot.counter(&self.metric) as f64),
            Aggregation::Value => Some(snapshot.gauge(&self.metric)),
            Aggregation::Rate if self.metric == metrics::CHECKS => snapshot.check_rate(),
            Aggregation::Rate => snapshot
                .checks
                .get(&self.metric)
                .filter(|counts| counts.passes + counts.fails > 0)
                .map(|counts| counts.passes as f64 / (counts.passes + counts.fails) as f64),
            Aggregation::Avg => snapshot.trend(&self.metric).map(|d| d.mean()),
            Aggregation::Min => snapshot.trend(&self.metric).map(|d| d.min()),
            Aggregation::Max => snapshot.trend(&self.metric).map(|d| d.max()),
            Aggregation::Med => snapshot
                .trend(&self.metric)
                .map(|d| d.estimate_quantile(0.5)),
            Aggregation::Percentile(p) => snapshot
                .trend(&self.metric)
                .map(|d| d.estimate_quantile(p / 100.0)),
        }
    }

    /// Evaluate the threshold. Missing data passes.
    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdResult {
        let actual = self.actual(snapshot);
        ThresholdResult {
            threshold: self.clone(),
            actual,
            passed: actual.map_or(true, |actual| self.operator.compare(actual, self.value)),
        }
    }
}

impl FromStr for Threshold {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, ThresholdError> {
        let syntax = || ThresholdError::Syntax(s.to_owned());
        let (metric, expression) = s.split_once(':').ok_or_else(syntax)?;
        let metric = metric.trim();
        if metric.is_empty() {
            return Err(syntax());
        }
        let idx = expression
            .find(|c| matches!(c, '<' | '>' | '=' | '!'))
            .ok_or_else(syntax)?;
        let (aggregation, comparison) = expression.split_at(idx);
        let (symbol, operator) = Operator::ALL
            .iter()
            .find(|(symbol, _)| comparison.starts_with(symbol))
            .ok_or_else(syntax)?;
        let value = comparison[symbol.len()..].trim();
        Ok(Self {
            metric: metric.to_owned(),
            aggregation: aggregation.trim().parse()?,
            operator: *operator,
            value: value
                .parse()
                .map_err(|_| ThresholdError::InvalidValue(value.to_owned()))?,
        })
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}{}{}",
            self.metric,
            self.aggregation,
            self.operator.symbol(),
            self.value
        )
    }
}

impl Serialize for Threshold {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    /// Evaluated threshold
    pub threshold: Threshold,
    /// Aggregated value, None without data
    pub actual: Option<f64>,
    /// True when the threshold held
    pub passed: bool,
}

/// Thresholds applied when none are given for a metric.
pub fn defaults(groups: &[PodGroup]) -> Vec<Threshold> {
    let mut thresholds = vec![
        Threshold::new(metrics::CHECKS, Aggregation::Rate, Operator::Gt, 0.95),
        Threshold::new(
            metrics::CREATE_DURATION,
            Aggregation::Percentile(95.0),
            Operator::Lt,
            15_000.0,
        ),
        Threshold::new(
            metrics::READY_DURATION,
            Aggregation::Percentile(95.0),
            Operator::Lt,
            120_000.0,
        ),
        Threshold::new(
            metrics::DELETE_DURATION,
            Aggregation::Percentile(95.0),
            Operator::Lt,
            15_000.0,
        ),
        Threshold::new(metrics::READY_FAILED, Aggregation::Count, Operator::Lt, 5.0),
    ];
    for group in groups {
        let names = group.metric_names();
        if group.cpu_ceiling.is_some() {
            thresholds.push(Threshold::new(
                &names.cpu_violations,
                Aggregation::Count,
                Operator::Eq,
                0.0,
            ));
        }
        if group.memory_ceiling.is_some() {
            thresholds.push(Threshold::new(
                &names.memory_violations,
                Aggregation::Count,
                Operator::Eq,
                0.0,
            ));
        }
        thresholds.push(Threshold::new(
            &names.restarts,
            Aggregation::Value,
            Operator::Eq,
            0.0,
        ));
    }
    thresholds
}

/// Replace the thresholds of every metric named in `overrides`.
pub fn with_overrides(defaults: Vec<Threshold>, overrides: &[Threshold]) -> Vec<Threshold> {
    defaults
        .into_iter()
        .filter(|threshold| !overrides.iter().any(|o| o.metric == threshold.metric))
        .chain(overrides.iter().cloned())
        .collect()
}

/// Evaluate every threshold against the snapshot.
pub fn evaluate(thresholds: &[Threshold], snapshot: &Snapshot) -> Vec<ThresholdResult> {
    thresholds
        .iter()
        .map(|threshold| threshold.evaluate(snapshot))
        .collect()
}
