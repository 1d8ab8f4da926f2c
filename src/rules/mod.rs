//! Which formula applies to a company, and the administrative operations that
//! keep formula assignments consistent.
//!
//! Resolution order for one company:
//! 1. the company's explicit `assigned_formula_id`, if that formula is enabled;
//! 2. the sector's explicit `assigned_formula_id`, same condition;
//! 3. scope ranking over enabled formulas: company > sector > global. Inside
//!    a tier the active global wins first, then lower `priority`, then lower id.

use crate::formula::{self, Environment, FormulaSyntaxError, FormulaValue};
use crate::metrics::{self, Extraction};
use crate::models::{Company, Formula, FormulaKind, FormulaScope, NewFormula, Sector, group_by_quarter};
use crate::storage::{OverrideCounts, Repository};
use std::cmp::Reverse;
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("formula {0} not found")]
    FormulaNotFound(i64),

    #[error("company '{0}' not found")]
    CompanyNotFound(String),

    #[error("sector '{0}' not found")]
    SectorNotFound(String),

    #[error("formula {0} is global; deleting it requires a replacement formula")]
    ReplacementRequired(i64),

    #[error("formula {id} cannot be used as a replacement: {reason}")]
    InvalidReplacement { id: i64, reason: String },

    #[error("formula {0} is not global")]
    NotGlobal(i64),

    #[error("formula {0} is disabled")]
    Disabled(i64),

    #[error("{0} formulas need a scope value")]
    MissingScopeValue(FormulaScope),

    #[error("formula syntax error: {0}")]
    Syntax(#[from] FormulaSyntaxError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// Read-once snapshot of the enabled formulas for one calculation run.
#[derive(Debug, Clone, Default)]
pub struct ScopeResolver {
    formulas: Vec<Formula>,
    by_id: HashMap<i64, usize>,
}

impl ScopeResolver {
    pub fn new(formulas: Vec<Formula>) -> Self {
        let formulas: Vec<Formula> = formulas.into_iter().filter(|f| f.enabled).collect();
        let by_id = formulas.iter().enumerate().map(|(i, f)| (f.id, i)).collect();
        Self { formulas, by_id }
    }

    pub fn load(repo: &Repository) -> anyhow::Result<Self> {
        Ok(Self::new(repo.list_enabled_formulas()?))
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    pub fn formulas(&self) -> impl Iterator<Item = &Formula> {
        self.formulas.iter()
    }

    pub fn get(&self, id: i64) -> Option<&Formula> {
        self.by_id.get(&id).map(|&i| &self.formulas[i])
    }

    /// Scope ranking only; explicit overrides are not consulted.
    pub fn resolve(&self, company_id: &str, sector_id: Option<&str>) -> Option<&Formula> {
        self.formulas
            .iter()
            .filter(|f| applies_to(f, company_id, sector_id))
            .min_by_key(|f| {
                (
                    Reverse(f.scope.specificity()),
                    !f.is_active_global,
                    f.priority,
                    f.id,
                )
            })
    }

    /// Full resolution including company and sector overrides.
    pub fn resolve_for(&self, company: &Company, sector: Option<&Sector>) -> Option<&Formula> {
        company
            .assigned_formula_id
            .and_then(|id| self.get(id))
            .or_else(|| sector.and_then(|s| s.assigned_formula_id).and_then(|id| self.get(id)))
            .or_else(|| self.resolve(&company.id, company.sector_id.as_deref()))
    }
}

fn applies_to(f: &Formula, company_id: &str, sector_id: Option<&str>) -> bool {
    match f.scope {
        FormulaScope::Global => true,
        FormulaScope::Company => f.scope_value.as_deref() == Some(company_id),
        FormulaScope::Sector => sector_id.is_some() && f.scope_value.as_deref() == sector_id,
    }
}

// ── Administration ────────────────────────────────────────────────────────────

/// Validating write surface over the formula table.
pub struct FormulaAdmin<'a> {
    repo: &'a Repository,
}

impl<'a> FormulaAdmin<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    pub fn create(&self, new: &NewFormula) -> Result<i64, RuleError> {
        validate(new)?;
        let id = self.repo.insert_formula(new)?;
        info!("Created {} formula {} ({})", new.scope, id, new.name);
        Ok(id)
    }

    pub fn update(&self, id: i64, new: &NewFormula) -> Result<(), RuleError> {
        validate(new)?;
        if !self.repo.update_formula(id, new)? {
            return Err(RuleError::FormulaNotFound(id));
        }
        info!("Updated formula {} ({})", id, new.name);
        Ok(())
    }

    pub fn set_active_global(&self, id: i64) -> Result<(), RuleError> {
        let f = self.existing(id)?;
        if f.scope != FormulaScope::Global {
            return Err(RuleError::NotGlobal(id));
        }
        if !f.enabled {
            return Err(RuleError::Disabled(id));
        }
        self.repo.set_active_global(id)?;
        info!("Formula {} ({}) is now the active global formula", id, f.name);
        Ok(())
    }

    pub fn assign_company(&self, company_id: &str, formula_id: Option<i64>) -> Result<(), RuleError> {
        if let Some(id) = formula_id {
            self.existing(id)?;
        }
        if !self.repo.set_company_formula(company_id, formula_id)? {
            return Err(RuleError::CompanyNotFound(company_id.to_string()));
        }
        Ok(())
    }

    pub fn assign_sector(&self, sector_id: &str, formula_id: Option<i64>) -> Result<(), RuleError> {
        if let Some(id) = formula_id {
            self.existing(id)?;
        }
        if !self.repo.set_sector_formula(sector_id, formula_id)? {
            return Err(RuleError::SectorNotFound(sector_id.to_string()));
        }
        Ok(())
    }

    /// Replace-and-delete. Overrides pointing at `id` move to `replacement`
    /// (or are cleared), an active global hands its flag to the replacement,
    /// and the formula's signals are dropped, all in one transaction.
    pub fn delete(&self, id: i64, replacement: Option<i64>) -> Result<OverrideCounts, RuleError> {
        let old = self.existing(id)?;

        match replacement {
            Some(rid) => {
                let invalid = |reason: &str| RuleError::InvalidReplacement {
                    id: rid,
                    reason: reason.to_string(),
                };
                if rid == id {
                    return Err(invalid("a formula cannot replace itself"));
                }
                let rep = self.repo.get_formula(rid)?.ok_or_else(|| invalid("not found"))?;
                if !rep.enabled {
                    return Err(invalid("disabled"));
                }
                if old.scope == FormulaScope::Global && rep.scope != FormulaScope::Global {
                    return Err(invalid("a global formula must be replaced by a global formula"));
                }
            }
            None if old.scope == FormulaScope::Global => {
                return Err(RuleError::ReplacementRequired(id));
            }
            None => {}
        }

        let counts = self
            .repo
            .replace_and_delete_formula(id, replacement, old.is_active_global)?;
        info!(
            "Deleted formula {} ({}); {} companies and {} sectors reassigned to {:?}",
            id, old.name, counts.companies, counts.sectors, replacement
        );
        Ok(counts)
    }

    /// Clear every explicit override, or point them all at one global formula.
    pub fn reset_all_to_global(&self, target: Option<i64>) -> Result<OverrideCounts, RuleError> {
        if let Some(id) = target {
            let f = self.existing(id)?;
            if f.scope != FormulaScope::Global {
                return Err(RuleError::NotGlobal(id));
            }
            if !f.enabled {
                return Err(RuleError::Disabled(id));
            }
        }
        let counts = self.repo.reset_overrides(target)?;
        info!(
            "Reset overrides to {:?}: {} companies, {} sectors",
            target, counts.companies, counts.sectors
        );
        Ok(counts)
    }

    /// Evaluate `condition` against a stored company's latest two quarters.
    pub fn test_against_company(
        &self,
        condition: &str,
        company_id: &str,
    ) -> Result<(FormulaValue, Extraction), RuleError> {
        let compiled = formula::compile(condition)?;
        if self.repo.get_company(company_id)?.is_none() {
            return Err(RuleError::CompanyNotFound(company_id.to_string()));
        }
        let points = self.repo.quarterly_points(company_id)?;
        let extraction = metrics::extract(group_by_quarter(&points));
        let value = compiled.evaluate(&metrics::to_environment(&extraction.metrics));
        Ok((value, extraction))
    }

    fn existing(&self, id: i64) -> Result<Formula, RuleError> {
        self.repo.get_formula(id)?.ok_or(RuleError::FormulaNotFound(id))
    }
}

/// Evaluate `condition` against an ad-hoc environment.
pub fn test_formula(condition: &str, env: &Environment) -> Result<FormulaValue, RuleError> {
    Ok(formula::evaluate(condition, env)?)
}

/// Checks done before any formula write.
pub fn validate(new: &NewFormula) -> Result<(), RuleError> {
    if new.scope != FormulaScope::Global
        && new.scope_value.as_deref().is_none_or(|v| v.trim().is_empty())
    {
        return Err(RuleError::MissingScopeValue(new.scope));
    }
    if new.kind == FormulaKind::Expression {
        formula::compile(&new.condition)?;
    }
    if new.is_active_global {
        // id is not known yet; 0 marks "the formula being written"
        if new.scope != FormulaScope::Global {
            return Err(RuleError::NotGlobal(0));
        }
        if !new.enabled {
            return Err(RuleError::Disabled(0));
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
