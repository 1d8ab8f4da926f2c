//! Metric resolution: scraped quarter tables → the ten numeric cells.
//!
//! Scraped metric names drift (casing, brackets, percent signs, synonyms), so
//! each logical metric carries an ordered list of name variants. Resolution
//! tries every variant as an exact key first, then falls back to normalised
//! containment matching. The first variant that yields a number wins.

pub mod cleaner;

use crate::formula::{Environment, FormulaValue};
use crate::models::{ExtractedMetricSet, QuarterGroup};

use self::cleaner::{normalise_metric_key, parse_metric_cell, sort_quarters_desc};

// ── Logical metrics ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct LogicalMetric {
    pub label: &'static str,
    pub variants: &'static [&'static str],
}

pub const SALES_YOY: LogicalMetric = LogicalMetric {
    label: "Sales Growth YoY %",
    variants: &[
        "Sales Growth YoY %",
        "Sales Growth (YoY) %",
        "Sales YoY %",
        "Revenue Growth YoY %",
        "YoY Sales Growth %",
    ],
};

pub const EPS_YOY: LogicalMetric = LogicalMetric {
    label: "EPS Growth YoY %",
    variants: &[
        "EPS Growth YoY %",
        "EPS Growth (YoY) %",
        "EPS YoY %",
        "YoY EPS Growth %",
    ],
};

pub const OPM: LogicalMetric = LogicalMetric {
    label: "Operating Margin %",
    variants: &["Operating Margin %", "OPM %", "Operating Profit Margin %", "OPM"],
};

pub const SALES_QOQ: LogicalMetric = LogicalMetric {
    label: "Sales Growth QoQ %",
    variants: &[
        "Sales Growth QoQ %",
        "Sales Growth (QoQ) %",
        "Sales QoQ %",
        "Revenue Growth QoQ %",
        "QoQ Sales Growth %",
    ],
};

pub const EPS_QOQ: LogicalMetric = LogicalMetric {
    label: "EPS Growth QoQ %",
    variants: &[
        "EPS Growth QoQ %",
        "EPS Growth (QoQ) %",
        "EPS QoQ %",
        "QoQ EPS Growth %",
    ],
};

/// Metrics in cell order: index 0 feeds Q12/P12, index 4 feeds Q16/P16.
pub const CANONICAL_METRICS: [LogicalMetric; 5] = [SALES_YOY, EPS_YOY, OPM, SALES_QOQ, EPS_QOQ];

// ── Resolution ────────────────────────────────────────────────────────────────

/// Resolve one logical metric inside a single quarter.
///
/// Pass 1 tries each variant as an exact key. If any variant exists as a key
/// the result is decided there, null when none of those cells is numeric.
/// Pass 2 only runs when no variant key exists; it normalises both sides
/// and accepts containment in either direction; within that pass an equal
/// normalised key beats a stored key containing the variant, which beats a
/// variant containing the stored key.
pub fn resolve_in_quarter(group: &QuarterGroup, variants: &[&str]) -> Option<f64> {
    let mut exact_key_seen = false;
    for variant in variants {
        if let Some(cell) = group.metrics.get(*variant) {
            exact_key_seen = true;
            if let Some(v) = parse_metric_cell(cell.as_ref()) {
                return Some(v);
            }
        }
    }
    // An exact key with a blank cell is null; never fall back to fuzzy.
    if exact_key_seen {
        return None;
    }

    let stored: Vec<(String, Option<&String>)> = group
        .metrics
        .iter()
        .map(|(k, v)| (normalise_metric_key(k), v.as_ref()))
        .filter(|(k, _)| !k.is_empty())
        .collect();

    for variant in variants {
        let wanted = normalise_metric_key(variant);
        if wanted.is_empty() {
            continue;
        }
        for tier in 0..3 {
            let hit = stored
                .iter()
                .filter(|(k, _)| containment_tier(k, &wanted) == Some(tier))
                .find_map(|(_, v)| parse_metric_cell(*v));
            if hit.is_some() {
                return hit;
            }
        }
    }
    None
}

fn containment_tier(stored: &str, wanted: &str) -> Option<u8> {
    if stored == wanted {
        Some(0)
    } else if stored.contains(wanted) {
        Some(1)
    } else if wanted.contains(stored) {
        Some(2)
    } else {
        None
    }
}

/// Current and previous quarter values for one logical metric.
/// `groups` must already be sorted most-recent first.
pub fn resolve_pair(groups: &[QuarterGroup], metric: &LogicalMetric) -> (Option<f64>, Option<f64>) {
    let current = groups.first().and_then(|g| resolve_in_quarter(g, metric.variants));
    let previous = groups.get(1).and_then(|g| resolve_in_quarter(g, metric.variants));
    (current, previous)
}

/// Result of resolving a company's quarter history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub metrics: ExtractedMetricSet,
    pub current_quarter: Option<String>,
    pub previous_quarter: Option<String>,
}

/// Sort quarters most-recent first and fill all ten cells.
pub fn extract(mut groups: Vec<QuarterGroup>) -> Extraction {
    sort_quarters_desc(&mut groups);

    let [sales_yoy, eps_yoy, opm, sales_qoq, eps_qoq] =
        CANONICAL_METRICS.map(|m| resolve_pair(&groups, &m));

    Extraction {
        metrics: ExtractedMetricSet {
            q12: sales_yoy.0,
            q13: eps_yoy.0,
            q14: opm.0,
            q15: sales_qoq.0,
            q16: eps_qoq.0,
            p12: sales_yoy.1,
            p13: eps_yoy.1,
            p14: opm.1,
            p15: sales_qoq.1,
            p16: eps_qoq.1,
        },
        current_quarter: groups.first().map(|g| g.quarter.clone()),
        previous_quarter: groups.get(1).map(|g| g.quarter.clone()),
    }
}

/// Bind the ten cells for the formula evaluator. Absent slots are bound to
/// `Missing`, never to zero.
pub fn to_environment(metrics: &ExtractedMetricSet) -> Environment {
    let mut env = Environment::new();
    for (name, value) in metrics.cells() {
        env.set(name, value.map_or(FormulaValue::Missing, FormulaValue::Number));
    }
    env
}

// ── Tests ─────────────────────────────────────────────────────────────────────
