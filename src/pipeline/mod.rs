//! Signal calculation orchestrator: storage → metrics → formula/classifier → signals.
//!
//! ## Run modes
//!
//! `incremental` (default): companies whose quarterly data has not been
//!   written since their last calculation are skipped.
//!
//! `full`: every target company is recalculated.
//!
//! Either way a company is processed at most once per run, and re-running on
//! unchanged data leaves the same signal rows behind (delete-then-insert per
//! company and formula).

pub mod job;

use crate::classifier::{self, CanonicalSignal, NO_SIGNAL};
use crate::config::EngineConfig;
use crate::formula::{self, CompiledFormula, FormulaSyntaxError, FormulaValue};
use crate::metrics::{self, Extraction};
use crate::metrics::cleaner::normalise_company_id;
use crate::models::{Formula, FormulaKind, NewSignal, group_by_quarter};
use crate::rules::ScopeResolver;
use crate::storage::Repository;
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// What one formula produced for one company.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Signal { label: String, value: Option<f64> },
    NoSignal,
    /// A cell the formula needed was absent.
    MissingData,
    SyntaxError(FormulaSyntaxError),
}

/// Map an evaluator result onto a signal. `signal_label` is the formula's
/// configured label, used for boolean and numeric results.
pub fn map_value(value: FormulaValue, signal_label: &str) -> SignalOutcome {
    let labelled = |value: Option<f64>| {
        let label = signal_label.trim();
        if label.is_empty() {
            SignalOutcome::NoSignal
        } else {
            SignalOutcome::Signal { label: label.to_string(), value }
        }
    };

    match value {
        FormulaValue::Text(t) => {
            let t = t.trim();
            if t.is_empty() || t.eq_ignore_ascii_case(NO_SIGNAL) {
                SignalOutcome::NoSignal
            } else {
                SignalOutcome::Signal { label: t.to_string(), value: None }
            }
        }
        FormulaValue::Bool(true) => labelled(None),
        FormulaValue::Bool(false) => SignalOutcome::NoSignal,
        FormulaValue::Number(n) if n.is_nan() || n == 0.0 => SignalOutcome::NoSignal,
        FormulaValue::Number(n) => labelled(n.is_finite().then_some(n)),
        FormulaValue::Missing => SignalOutcome::MissingData,
    }
}

/// Result of processing one company.
#[derive(Debug, Clone, PartialEq)]
pub enum CompanyResult {
    /// Incremental mode and nothing new since the last calculation.
    Skipped,
    /// No enabled formula applies.
    NoFormula,
    Evaluated { formula_id: i64, outcome: SignalOutcome },
}

// ── Options & stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CalcOptions {
    pub incremental: bool,
    pub batch_size: usize,
    pub max_recorded_failures: usize,
}

impl Default for CalcOptions {
    fn default() -> Self {
        Self { incremental: true, batch_size: 100, max_recorded_failures: 50 }
    }
}

impl From<&EngineConfig> for CalcOptions {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            incremental: cfg.incremental,
            batch_size: cfg.batch_size,
            max_recorded_failures: cfg.max_recorded_failures,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunStats {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub missing_data: usize,
    pub no_formula: usize,
    pub signals_generated: usize,
    /// (company, error) for the first failures; capped by `max_recorded_failures`.
    pub failures: Vec<(String, String)>,
    pub cancelled: bool,
}

impl RunStats {
    fn record(&mut self, result: &CompanyResult) {
        match result {
            CompanyResult::Skipped => self.skipped += 1,
            CompanyResult::NoFormula => {
                self.succeeded += 1;
                self.no_formula += 1;
            }
            CompanyResult::Evaluated { outcome, .. } => {
                self.succeeded += 1;
                match outcome {
                    SignalOutcome::Signal { .. } => self.signals_generated += 1,
                    SignalOutcome::MissingData => self.missing_data += 1,
                    SignalOutcome::NoSignal | SignalOutcome::SyntaxError(_) => {}
                }
            }
        }
    }
}

/// Hooks a caller can use to watch or stop a run.
pub trait RunObserver {
    /// Called after every company with the running totals.
    fn progress(&self, _stats: &RunStats) {}

    /// Checked before each company is picked up.
    fn should_stop(&self) -> bool {
        false
    }
}

impl RunObserver for () {}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct SignalCalculator<'a> {
    repo: &'a Repository,
    resolver: ScopeResolver,
    compiled: HashMap<i64, Result<CompiledFormula, FormulaSyntaxError>>,
}

impl<'a> SignalCalculator<'a> {
    /// Snapshot the enabled formulas and compile expression formulas once.
    pub fn new(repo: &'a Repository) -> Result<Self> {
        let resolver = ScopeResolver::load(repo).context("Failed to load formulas")?;
        Ok(Self::with_resolver(repo, resolver))
    }

    pub fn with_resolver(repo: &'a Repository, resolver: ScopeResolver) -> Self {
        let compiled = resolver
            .formulas()
            .filter(|f| f.kind == FormulaKind::Expression)
            .map(|f| {
                let compiled = formula::compile(&f.condition);
                if let Err(e) = &compiled {
                    warn!("Formula {} ({}) does not compile: {}", f.id, f.name, e);
                }
                (f.id, compiled)
            })
            .collect();
        if resolver.is_empty() {
            warn!("No enabled formulas; every company will resolve to no formula");
        } else {
            info!("Loaded {} enabled formulas", resolver.len());
        }
        Self { repo, resolver, compiled }
    }

    /// Calculate signals for `targets`, or for every company when `None`.
    pub fn run(
        &self,
        targets: Option<&[String]>,
        options: &CalcOptions,
        observer: &dyn RunObserver,
    ) -> Result<RunStats> {
        let batch_size = options.batch_size.max(1);
        let mut stats = RunStats::default();

        match targets {
            Some(ids) => {
                let unique: Vec<String> = ids
                    .iter()
                    .map(|id| normalise_company_id(id))
                    .filter(|id| !id.is_empty())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                stats.total = unique.len();
                for batch in unique.chunks(batch_size) {
                    if !self.process_batch(batch, options, observer, &mut stats) {
                        break;
                    }
                }
            }
            None => {
                stats.total = self.repo.company_count()? as usize;
                let mut after: Option<String> = None;
                loop {
                    let page = self.repo.company_ids_page(after.as_deref(), batch_size)?;
                    let Some(last) = page.last().cloned() else {
                        break;
                    };
                    if !self.process_batch(&page, options, observer, &mut stats) {
                        break;
                    }
                    after = Some(last);
                }
            }
        }

        info!(
            "Run done: {}/{} processed | {} signals | {} skipped | {} missing data | {} failed{}",
            stats.processed,
            stats.total,
            stats.signals_generated,
            stats.skipped,
            stats.missing_data,
            stats.failed,
            if stats.cancelled { " | cancelled" } else { "" },
        );
        Ok(stats)
    }

    /// Returns `false` when the observer asked to stop.
    fn process_batch(
        &self,
        ids: &[String],
        options: &CalcOptions,
        observer: &dyn RunObserver,
        stats: &mut RunStats,
    ) -> bool {
        debug!("Batch of {} companies starting at {:?}", ids.len(), ids.first());
        for id in ids {
            if observer.should_stop() {
                info!("Stop requested after {} companies", stats.processed);
                stats.cancelled = true;
                return false;
            }

            stats.processed += 1;
            match self.calculate_company(id, options.incremental) {
                Ok(result) => stats.record(&result),
                Err(e) => {
                    warn!("{}: {:#}", id, e);
                    stats.failed += 1;
                    if stats.failures.len() < options.max_recorded_failures {
                        stats.failures.push((id.clone(), format!("{:#}", e)));
                    }
                }
            }
            observer.progress(stats);
        }
        true
    }

    /// Resolve, evaluate and persist for one company.
    pub fn calculate_company(&self, company_id: &str, incremental: bool) -> Result<CompanyResult> {
        let company = self
            .repo
            .get_company(company_id)?
            .ok_or_else(|| anyhow!("company {} not found", company_id))?;

        if incremental {
            if let Some(calculated_at) = company.signals_calculated_at {
                let latest = self.repo.latest_metric_write(company_id)?;
                if latest.is_none_or(|written| written <= calculated_at) {
                    debug!("{}: unchanged since {}", company_id, calculated_at);
                    return Ok(CompanyResult::Skipped);
                }
            }
        }

        let started = Utc::now().naive_utc();
        let sector = match &company.sector_id {
            Some(sector_id) => self.repo.get_sector(sector_id)?,
            None => None,
        };

        let Some(formula) = self.resolver.resolve_for(&company, sector.as_ref()) else {
            debug!("{}: no applicable formula", company_id);
            self.repo.clear_signals(company_id)?;
            self.repo.mark_calculated(company_id, started)?;
            return Ok(CompanyResult::NoFormula);
        };

        let points = self
            .repo
            .quarterly_points(company_id)
            .with_context(|| format!("quarterly_points({})", company_id))?;
        let extraction = metrics::extract(group_by_quarter(&points));
        let outcome = self.evaluate(formula, &extraction);

        let signal = match &outcome {
            SignalOutcome::Signal { label, value } => Some(NewSignal {
                company_id: company.id.clone(),
                formula_id: formula.id,
                signal: label.clone(),
                value: *value,
                metadata: Some(signal_metadata(formula, &extraction)),
            }),
            SignalOutcome::SyntaxError(e) => {
                warn!(
                    "{}: formula {} syntax error at position {}: {}",
                    company_id, formula.id, e.position, e.message
                );
                None
            }
            SignalOutcome::NoSignal | SignalOutcome::MissingData => None,
        };

        self.repo
            .replace_signal(company_id, formula.id, signal.as_ref())
            .with_context(|| format!("replace_signal({})", company_id))?;
        self.repo.mark_calculated(company_id, started)?;

        debug!("{}: formula {} → {:?}", company_id, formula.id, outcome);
        Ok(CompanyResult::Evaluated { formula_id: formula.id, outcome })
    }

    fn evaluate(&self, formula: &Formula, extraction: &Extraction) -> SignalOutcome {
        match formula.kind {
            FormulaKind::Canonical => match classifier::classify(&extraction.metrics) {
                CanonicalSignal::NoSignal if !extraction.metrics.is_complete() => {
                    SignalOutcome::MissingData
                }
                CanonicalSignal::NoSignal => SignalOutcome::NoSignal,
                signal => SignalOutcome::Signal { label: signal.as_str().to_string(), value: None },
            },
            FormulaKind::Expression => {
                let compiled = match self.compiled.get(&formula.id) {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => return SignalOutcome::SyntaxError(e.clone()),
                    None => {
                        return SignalOutcome::SyntaxError(FormulaSyntaxError::new("formula not compiled", 0));
                    }
                };
                let env = metrics::to_environment(&extraction.metrics);
                map_value(compiled.evaluate(&env), &formula.signal)
            }
        }
    }
}

fn signal_metadata(formula: &Formula, extraction: &Extraction) -> serde_json::Value {
    json!({
        "formula": formula.name,
        "kind": formula.kind.as_str(),
        "current_quarter": extraction.current_quarter,
        "previous_quarter": extraction.previous_quarter,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
