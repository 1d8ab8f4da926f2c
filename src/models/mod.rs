use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ── Companies & sectors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub sector_id: Option<String>,
    pub assigned_formula_id: Option<i64>,
    pub signals_calculated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sector {
    pub id: String,
    pub name: String,
    pub assigned_formula_id: Option<i64>,
}

// ── Quarterly metrics ─────────────────────────────────────────────────────────

/// One scraped cell: (company, quarter, metric) → raw text value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarterlyMetricPoint {
    pub company_id: String,
    pub quarter: String,
    pub metric_name: String,
    pub metric_value: Option<String>,
    pub scraped_at: NaiveDateTime,
}

/// All metric values of one company for one quarter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuarterGroup {
    pub quarter: String,
    pub metrics: BTreeMap<String, Option<String>>,
}

impl QuarterGroup {
    pub fn new(quarter: impl Into<String>) -> Self {
        Self {
            quarter: quarter.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with(mut self, metric: &str, value: &str) -> Self {
        self.metrics.insert(metric.to_string(), Some(value.to_string()));
        self
    }
}

/// Groups flat points into one `QuarterGroup` per quarter label (unordered).
pub fn group_by_quarter(points: &[QuarterlyMetricPoint]) -> Vec<QuarterGroup> {
    let mut by_quarter: BTreeMap<&str, QuarterGroup> = BTreeMap::new();
    for p in points {
        by_quarter
            .entry(p.quarter.as_str())
            .or_insert_with(|| QuarterGroup::new(p.quarter.clone()))
            .metrics
            .insert(p.metric_name.clone(), p.metric_value.clone());
    }
    by_quarter.into_values().collect()
}

/// The ten numeric cells the canonical rule reads.
///
/// `q*` slots come from the most recent quarter, `p*` slots from the one
/// before it. A `None` slot means the metric was absent or non-numeric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMetricSet {
    pub q12: Option<f64>, // Sales YoY %
    pub q13: Option<f64>, // EPS YoY %
    pub q14: Option<f64>, // Operating margin %
    pub q15: Option<f64>, // Sales QoQ %
    pub q16: Option<f64>, // EPS QoQ %
    pub p12: Option<f64>,
    pub p13: Option<f64>,
    pub p14: Option<f64>,
    pub p15: Option<f64>,
    pub p16: Option<f64>,
}

impl ExtractedMetricSet {
    /// Cell names paired with their slot, in Q12..Q16, P12..P16 order.
    pub fn cells(&self) -> [(&'static str, Option<f64>); 10] {
        [
            ("Q12", self.q12),
            ("Q13", self.q13),
            ("Q14", self.q14),
            ("Q15", self.q15),
            ("Q16", self.q16),
            ("P12", self.p12),
            ("P13", self.p13),
            ("P14", self.p14),
            ("P15", self.p15),
            ("P16", self.p16),
        ]
    }

    pub fn is_complete(&self) -> bool {
        self.cells().iter().all(|(_, v)| v.is_some())
    }
}

// ── Formulas ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FormulaScope {
    Global,
    Sector,
    Company,
}

impl FormulaScope {
    /// Higher is more specific.
    pub fn specificity(self) -> u8 {
        match self {
            FormulaScope::Company => 3,
            FormulaScope::Sector => 2,
            FormulaScope::Global => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormulaScope::Global => "global",
            FormulaScope::Sector => "sector",
            FormulaScope::Company => "company",
        }
    }
}

impl fmt::Display for FormulaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormulaScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(FormulaScope::Global),
            "sector" => Ok(FormulaScope::Sector),
            "company" => Ok(FormulaScope::Company),
            other => Err(format!("unknown formula scope '{}'", other)),
        }
    }
}

/// How a formula produces its result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormulaKind {
    /// `condition` is formula-language source text.
    #[default]
    Expression,
    /// Runs the built-in canonical classifier; `condition` is ignored.
    Canonical,
}

impl FormulaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FormulaKind::Expression => "expression",
            FormulaKind::Canonical => "canonical",
        }
    }
}

impl fmt::Display for FormulaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormulaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "expression" => Ok(FormulaKind::Expression),
            "canonical" => Ok(FormulaKind::Canonical),
            other => Err(format!("unknown formula kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Formula {
    pub id: i64,
    pub name: String,
    pub kind: FormulaKind,
    pub scope: FormulaScope,
    pub scope_value: Option<String>,
    pub condition: String,
    pub signal: String,
    pub priority: i32,
    pub enabled: bool,
    pub is_active_global: bool,
}

/// Fields an administrator supplies when creating or editing a formula.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewFormula {
    pub name: String,
    pub kind: FormulaKind,
    pub scope: FormulaScope,
    pub scope_value: Option<String>,
    pub condition: String,
    pub signal: String,
    pub priority: i32,
    pub enabled: bool,
    pub is_active_global: bool,
}

// ── Signals ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: i64,
    pub company_id: String,
    pub formula_id: i64,
    pub signal: String,
    pub value: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub calculated_at: NaiveDateTime,
}

/// A signal about to be written; the id is assigned by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub company_id: String,
    pub formula_id: i64,
    pub signal: String,
    pub value: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

// ── Raw CSV rows ──────────────────────────────────────────────────────────────

/// Company metadata CSV: company, name, sector
#[derive(Debug, Clone, Default)]
pub struct RawCompanyRow {
    pub company: Option<String>,
    pub name: Option<String>,
    pub sector: Option<String>,
}
