use crate::models::{
    Company, Formula, FormulaKind, FormulaScope, NewFormula, NewSignal, QuarterlyMetricPoint, Sector,
    Signal,
};
use crate::pipeline::job::JobStatus;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::types::Type;
use duckdb::{Connection, OptionalExt, Row, params};
use std::path::Path;
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS formula_id_seq START 1;
CREATE SEQUENCE IF NOT EXISTS signal_id_seq START 1;

CREATE TABLE IF NOT EXISTS sectors (
    id                  VARCHAR PRIMARY KEY,
    name                VARCHAR NOT NULL DEFAULT '',
    assigned_formula_id BIGINT
);

CREATE TABLE IF NOT EXISTS companies (
    id                    VARCHAR PRIMARY KEY,
    name                  VARCHAR NOT NULL DEFAULT '',
    sector_id             VARCHAR,
    assigned_formula_id   BIGINT,
    -- Compared against quarterly_metrics.scraped_at for incremental runs
    signals_calculated_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS quarterly_metrics (
    company_id    VARCHAR   NOT NULL,
    quarter       VARCHAR   NOT NULL,
    metric_name   VARCHAR   NOT NULL,
    -- Raw scraped text, e.g. '12.5%'; NULL when the cell was blank
    metric_value  VARCHAR,
    scraped_at    TIMESTAMP NOT NULL,
    PRIMARY KEY (company_id, quarter, metric_name)
);

CREATE TABLE IF NOT EXISTS formulas (
    id               BIGINT PRIMARY KEY DEFAULT nextval('formula_id_seq'),
    name             VARCHAR NOT NULL,
    kind             VARCHAR NOT NULL DEFAULT 'expression',
    scope            VARCHAR NOT NULL,
    scope_value      VARCHAR,
    condition        VARCHAR NOT NULL DEFAULT '',
    signal           VARCHAR NOT NULL DEFAULT '',
    priority         INTEGER NOT NULL DEFAULT 100,
    enabled          BOOLEAN NOT NULL DEFAULT TRUE,
    is_active_global BOOLEAN NOT NULL DEFAULT FALSE,
    created_at       TIMESTAMP NOT NULL,
    updated_at       TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS signals (
    id            BIGINT PRIMARY KEY DEFAULT nextval('signal_id_seq'),
    company_id    VARCHAR   NOT NULL,
    formula_id    BIGINT    NOT NULL,
    signal        VARCHAR   NOT NULL,
    value         DOUBLE,
    metadata      VARCHAR,
    calculated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS calculation_jobs (
    id                VARCHAR PRIMARY KEY,
    mode              VARCHAR NOT NULL,
    status            VARCHAR NOT NULL DEFAULT 'running',
    started_at        TIMESTAMP NOT NULL,
    finished_at       TIMESTAMP,
    total             INTEGER DEFAULT 0,
    processed         INTEGER DEFAULT 0,
    succeeded         INTEGER DEFAULT 0,
    failed            INTEGER DEFAULT 0,
    skipped           INTEGER DEFAULT 0,
    missing_data      INTEGER DEFAULT 0,
    signals_generated INTEGER DEFAULT 0,
    error_msg         VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_metrics_company ON quarterly_metrics (company_id);
CREATE INDEX IF NOT EXISTS idx_signals_company ON signals (company_id);
"#;

const FORMULA_COLUMNS: &str =
    "id, name, kind, scope, scope_value, condition, signal, priority, enabled, is_active_global";

const SIGNAL_COLUMNS: &str = "id, company_id, formula_id, signal, value, metadata, calculated_at";

fn formula_from_row(r: &Row<'_>) -> duckdb::Result<Formula> {
    let kind: String = r.get(2)?;
    let scope: String = r.get(3)?;
    Ok(Formula {
        id: r.get(0)?,
        name: r.get(1)?,
        kind: kind
            .parse::<FormulaKind>()
            .map_err(|e| duckdb::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
        scope: scope
            .parse::<FormulaScope>()
            .map_err(|e| duckdb::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?,
        scope_value: r.get(4)?,
        condition: r.get(5)?,
        signal: r.get(6)?,
        priority: r.get(7)?,
        enabled: r.get(8)?,
        is_active_global: r.get(9)?,
    })
}

fn signal_from_row(r: &Row<'_>) -> duckdb::Result<Signal> {
    let metadata: Option<String> = r.get(5)?;
    Ok(Signal {
        id: r.get(0)?,
        company_id: r.get(1)?,
        formula_id: r.get(2)?,
        signal: r.get(3)?,
        value: r.get(4)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        calculated_at: r.get(6)?,
    })
}

fn company_from_row(r: &Row<'_>) -> duckdb::Result<Company> {
    Ok(Company {
        id: r.get(0)?,
        name: r.get(1)?,
        sector_id: r.get(2)?,
        assigned_formula_id: r.get(3)?,
        signals_calculated_at: r.get(4)?,
    })
}

/// Counts of entities touched by an override rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverrideCounts {
    pub companies: usize,
    pub sectors: usize,
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    /// Second connection to the same database, for use on another thread.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self { conn: self.conn.try_clone()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Sectors & companies ───────────────────────────────────────────────────

    /// Upsert names; explicit formula overrides survive re-imports.
    pub fn upsert_sectors(&self, sectors: &[Sector]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for s in sectors {
            tx.execute(
                r#"INSERT INTO sectors (id, name, assigned_formula_id) VALUES (?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       name = CASE WHEN excluded.name = '' THEN name ELSE excluded.name END"#,
                params![s.id, s.name, s.assigned_formula_id],
            )
            .with_context(|| format!("upsert sector {}", s.id))?;
        }
        tx.commit()?;
        Ok(sectors.len())
    }

    pub fn upsert_companies(&self, companies: &[Company]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for c in companies {
            tx.execute(
                r#"INSERT INTO companies (id, name, sector_id, assigned_formula_id)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       name      = CASE WHEN excluded.name = '' THEN name ELSE excluded.name END,
                       sector_id = COALESCE(excluded.sector_id, sector_id)"#,
                params![c.id, c.name, c.sector_id, c.assigned_formula_id],
            )
            .with_context(|| format!("upsert company {}", c.id))?;
        }
        tx.commit()?;
        Ok(companies.len())
    }

    pub fn get_company(&self, id: &str) -> Result<Option<Company>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, sector_id, assigned_formula_id, signals_calculated_at
             FROM companies WHERE id = ?",
        )?;
        Ok(stmt.query_row(params![id], company_from_row).optional()?)
    }

    pub fn get_sector(&self, id: &str) -> Result<Option<Sector>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, assigned_formula_id FROM sectors WHERE id = ?")?;
        let sector = stmt
            .query_row(params![id], |r| {
                Ok(Sector { id: r.get(0)?, name: r.get(1)?, assigned_formula_id: r.get(2)? })
            })
            .optional()?;
        Ok(sector)
    }

    /// Keyset page of company ids strictly after `after`, in id order.
    pub fn company_ids_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM companies WHERE id > ? ORDER BY id LIMIT ?")?;
        let ids = stmt
            .query_map(params![after.unwrap_or(""), limit as i64], |r| r.get(0))?
            .collect::<duckdb::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn company_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM companies")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn set_company_formula(&self, company_id: &str, formula_id: Option<i64>) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE companies SET assigned_formula_id = ? WHERE id = ?",
            params![formula_id, company_id],
        )?;
        Ok(n > 0)
    }

    pub fn set_sector_formula(&self, sector_id: &str, formula_id: Option<i64>) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE sectors SET assigned_formula_id = ? WHERE id = ?",
            params![formula_id, sector_id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_calculated(&self, company_id: &str, at: NaiveDateTime) -> Result<()> {
        self.conn.execute(
            "UPDATE companies SET signals_calculated_at = ? WHERE id = ?",
            params![at, company_id],
        )?;
        Ok(())
    }

    // ── Quarterly metrics ─────────────────────────────────────────────────────

    /// Upsert points; re-scraping a cell overwrites it and bumps `scraped_at`.
    pub fn upsert_quarterly_metrics(&self, points: &[QuarterlyMetricPoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO quarterly_metrics (company_id, quarter, metric_name, metric_value, scraped_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (company_id, quarter, metric_name) DO UPDATE SET
                metric_value = excluded.metric_value,
                scraped_at   = excluded.scraped_at
        "#;

        for p in points {
            tx.execute(
                sql,
                params![p.company_id, p.quarter, p.metric_name, p.metric_value, p.scraped_at],
            )
            .with_context(|| format!("insert metric {} {} {}", p.company_id, p.quarter, p.metric_name))?;
        }

        tx.commit()?;
        Ok(points.len())
    }

    pub fn quarterly_points(&self, company_id: &str) -> Result<Vec<QuarterlyMetricPoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT company_id, quarter, metric_name, metric_value, scraped_at
             FROM quarterly_metrics WHERE company_id = ? ORDER BY quarter, metric_name",
        )?;
        let points = stmt
            .query_map(params![company_id], |r| {
                Ok(QuarterlyMetricPoint {
                    company_id: r.get(0)?,
                    quarter: r.get(1)?,
                    metric_name: r.get(2)?,
                    metric_value: r.get(3)?,
                    scraped_at: r.get(4)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(points)
    }

    /// Most recent write of any quarterly cell for a company.
    pub fn latest_metric_write(&self, company_id: &str) -> Result<Option<NaiveDateTime>> {
        let mut stmt = self
            .conn
            .prepare("SELECT MAX(scraped_at) FROM quarterly_metrics WHERE company_id = ?")?;
        Ok(stmt.query_row(params![company_id], |r| r.get(0))?)
    }

    pub fn metric_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM quarterly_metrics")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Formulas ──────────────────────────────────────────────────────────────

    /// Insert a formula. Setting `is_active_global` clears the flag everywhere
    /// else in the same transaction.
    pub fn insert_formula(&self, f: &NewFormula) -> Result<i64> {
        let now = Utc::now().naive_utc();
        let tx = self.conn.unchecked_transaction()?;
        if f.is_active_global {
            tx.execute("UPDATE formulas SET is_active_global = FALSE WHERE is_active_global", [])?;
        }
        let id: i64 = tx
            .query_row(
                r#"INSERT INTO formulas
                       (name, kind, scope, scope_value, condition, signal, priority,
                        enabled, is_active_global, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   RETURNING id"#,
                params![
                    f.name,
                    f.kind.as_str(),
                    f.scope.as_str(),
                    f.scope_value,
                    f.condition,
                    f.signal,
                    f.priority,
                    f.enabled,
                    f.is_active_global,
                    now,
                    now,
                ],
                |r| r.get(0),
            )
            .with_context(|| format!("insert formula {}", f.name))?;
        tx.commit()?;
        debug!("Inserted formula {} ({})", id, f.name);
        Ok(id)
    }

    pub fn update_formula(&self, id: i64, f: &NewFormula) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        if f.is_active_global {
            tx.execute(
                "UPDATE formulas SET is_active_global = FALSE WHERE is_active_global AND id <> ?",
                params![id],
            )?;
        }
        let n = tx
            .execute(
                r#"UPDATE formulas SET
                       name = ?, kind = ?, scope = ?, scope_value = ?, condition = ?, signal = ?,
                       priority = ?, enabled = ?, is_active_global = ?, updated_at = ?
                   WHERE id = ?"#,
                params![
                    f.name,
                    f.kind.as_str(),
                    f.scope.as_str(),
                    f.scope_value,
                    f.condition,
                    f.signal,
                    f.priority,
                    f.enabled,
                    f.is_active_global,
                    Utc::now().naive_utc(),
                    id,
                ],
            )
            .with_context(|| format!("update formula {}", id))?;
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn get_formula(&self, id: i64) -> Result<Option<Formula>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM formulas WHERE id = ?", FORMULA_COLUMNS))?;
        Ok(stmt.query_row(params![id], formula_from_row).optional()?)
    }

    pub fn list_formulas(&self) -> Result<Vec<Formula>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM formulas ORDER BY id", FORMULA_COLUMNS))?;
        let formulas = stmt
            .query_map([], formula_from_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(formulas)
    }

    pub fn list_enabled_formulas(&self) -> Result<Vec<Formula>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM formulas WHERE enabled ORDER BY id",
            FORMULA_COLUMNS
        ))?;
        let formulas = stmt
            .query_map([], formula_from_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(formulas)
    }

    pub fn set_active_global(&self, id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("UPDATE formulas SET is_active_global = FALSE WHERE is_active_global AND id <> ?", params![id])?;
        tx.execute(
            "UPDATE formulas SET is_active_global = TRUE, updated_at = ? WHERE id = ?",
            params![Utc::now().naive_utc(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Repoint every override of `old_id` at `replacement` (or clear it), move
    /// the active-global flag if asked, and delete `old_id` with its signals.
    /// One transaction: readers see either the old or the new assignment.
    pub fn replace_and_delete_formula(
        &self,
        old_id: i64,
        replacement: Option<i64>,
        transfer_active: bool,
    ) -> Result<OverrideCounts> {
        let tx = self.conn.unchecked_transaction()?;
        let companies = tx.execute(
            "UPDATE companies SET assigned_formula_id = ? WHERE assigned_formula_id = ?",
            params![replacement, old_id],
        )?;
        let sectors = tx.execute(
            "UPDATE sectors SET assigned_formula_id = ? WHERE assigned_formula_id = ?",
            params![replacement, old_id],
        )?;
        if let (true, Some(new_id)) = (transfer_active, replacement) {
            tx.execute(
                "UPDATE formulas SET is_active_global = (id = ?) WHERE is_active_global OR id = ?",
                params![new_id, new_id],
            )?;
        }
        tx.execute("DELETE FROM signals WHERE formula_id = ?", params![old_id])?;
        tx.execute("DELETE FROM formulas WHERE id = ?", params![old_id])
            .with_context(|| format!("delete formula {}", old_id))?;
        tx.commit()?;
        Ok(OverrideCounts { companies, sectors })
    }

    /// Set every company and sector override to `target` (NULL clears them).
    pub fn reset_overrides(&self, target: Option<i64>) -> Result<OverrideCounts> {
        let tx = self.conn.unchecked_transaction()?;
        let (companies, sectors) = match target {
            Some(id) => (
                tx.execute(
                    "UPDATE companies SET assigned_formula_id = ?
                     WHERE assigned_formula_id IS NULL OR assigned_formula_id <> ?",
                    params![id, id],
                )?,
                tx.execute(
                    "UPDATE sectors SET assigned_formula_id = ?
                     WHERE assigned_formula_id IS NULL OR assigned_formula_id <> ?",
                    params![id, id],
                )?,
            ),
            None => (
                tx.execute(
                    "UPDATE companies SET assigned_formula_id = NULL WHERE assigned_formula_id IS NOT NULL",
                    [],
                )?,
                tx.execute(
                    "UPDATE sectors SET assigned_formula_id = NULL WHERE assigned_formula_id IS NOT NULL",
                    [],
                )?,
            ),
        };
        tx.commit()?;
        Ok(OverrideCounts { companies, sectors })
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    /// Replace every live signal of the company with `signal`, if any.
    /// Rows left by a formula that no longer applies go in the same transaction.
    pub fn replace_signal(
        &self,
        company_id: &str,
        formula_id: i64,
        signal: Option<&NewSignal>,
    ) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM signals WHERE company_id = ?", params![company_id])?;
        if let Some(s) = signal {
            let metadata = s.metadata.as_ref().map(|m| m.to_string());
            tx.execute(
                r#"INSERT INTO signals (company_id, formula_id, signal, value, metadata, calculated_at)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
                params![s.company_id, s.formula_id, s.signal, s.value, metadata, Utc::now().naive_utc()],
            )
            .with_context(|| format!("insert signal {} / {}", company_id, formula_id))?;
        }
        tx.commit()?;
        Ok(signal.is_some())
    }

    pub fn clear_signals(&self, company_id: &str) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM signals WHERE company_id = ?", params![company_id])?;
        Ok(n)
    }

    pub fn list_signals(&self, company_id: Option<&str>) -> Result<Vec<Signal>> {
        let signals = match company_id {
            Some(id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM signals WHERE company_id = ? ORDER BY formula_id",
                    SIGNAL_COLUMNS
                ))?;
                stmt.query_map(params![id], signal_from_row)?
                    .collect::<duckdb::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM signals ORDER BY company_id, formula_id",
                    SIGNAL_COLUMNS
                ))?;
                stmt.query_map([], signal_from_row)?
                    .collect::<duckdb::Result<Vec<_>>>()?
            }
        };
        Ok(signals)
    }

    pub fn signal_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM signals")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Calculation job log ───────────────────────────────────────────────────

    pub fn begin_job(&self, status: &JobStatus) -> Result<()> {
        self.conn.execute(
            "INSERT INTO calculation_jobs (id, mode, status, started_at, total) VALUES (?, ?, ?, ?, ?)",
            params![
                status.id.to_string(),
                status.mode.as_str(),
                status.state.as_str(),
                status.started_at.naive_utc(),
                status.total as i64,
            ],
        )?;
        Ok(())
    }

    pub fn finish_job(&self, status: &JobStatus, error: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"UPDATE calculation_jobs SET
               status = ?, finished_at = ?, total = ?, processed = ?, succeeded = ?, failed = ?,
               skipped = ?, missing_data = ?, signals_generated = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                status.state.as_str(),
                Utc::now().naive_utc(),
                status.total as i64,
                status.processed as i64,
                status.succeeded as i64,
                status.failed as i64,
                status.skipped as i64,
                status.missing_data as i64,
                status.signals_generated as i64,
                error,
                status.id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Most recent job rows first.
    pub fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, mode, status, started_at, finished_at, processed, failed, signals_generated
               FROM calculation_jobs ORDER BY started_at DESC LIMIT ?"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(JobRow {
                    id: r.get(0)?,
                    mode: r.get(1)?,
                    status: r.get(2)?,
                    started_at: r.get(3)?,
                    finished_at: r.get(4)?,
                    processed: r.get(5)?,
                    failed: r.get(6)?,
                    signals_generated: r.get(7)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Persisted summary of one calculation job.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub mode: String,
    pub status: String,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub processed: i64,
    pub failed: i64,
    pub signals_generated: i64,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn formula(name: &str, scope: FormulaScope, active: bool) -> NewFormula {
        NewFormula {
            name: name.into(),
            kind: FormulaKind::Expression,
            scope,
            scope_value: None,
            condition: "TRUE".into(),
            signal: "BUY".into(),
            priority: 10,
            enabled: true,
            is_active_global: active,
        }
    }

    fn company(id: &str, sector: Option<&str>) -> Company {
        Company {
            id: id.into(),
            name: String::new(),
            sector_id: sector.map(String::from),
            assigned_formula_id: None,
            signals_calculated_at: None,
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let r = repo();
        r.run_migrations().unwrap();
        assert_eq!(r.company_count().unwrap(), 0);
    }

    #[test]
    fn formula_round_trip_and_active_flag_is_exclusive() {
        let r = repo();
        let a = r.insert_formula(&formula("a", FormulaScope::Global, true)).unwrap();
        let b = r.insert_formula(&formula("b", FormulaScope::Global, true)).unwrap();
        assert_ne!(a, b);
        assert!(!r.get_formula(a).unwrap().unwrap().is_active_global);
        assert!(r.get_formula(b).unwrap().unwrap().is_active_global);

        r.set_active_global(a).unwrap();
        let active: Vec<i64> = r
            .list_formulas()
            .unwrap()
            .into_iter()
            .filter(|f| f.is_active_global)
            .map(|f| f.id)
            .collect();
        assert_eq!(active, vec![a]);
    }

    #[test]
    fn upsert_company_keeps_override() {
        let r = repo();
        r.upsert_companies(&[company("ACME", Some("TECH"))]).unwrap();
        r.set_company_formula("ACME", Some(7)).unwrap();
        r.upsert_companies(&[company("ACME", None)]).unwrap();
        let c = r.get_company("ACME").unwrap().unwrap();
        assert_eq!(c.assigned_formula_id, Some(7));
        assert_eq!(c.sector_id.as_deref(), Some("TECH"));
    }

    #[test]
    fn company_pages_walk_all_ids() {
        let r = repo();
        let companies: Vec<Company> = ["A", "B", "C", "D", "E"].iter().map(|id| company(id, None)).collect();
        r.upsert_companies(&companies).unwrap();
        let first = r.company_ids_page(None, 2).unwrap();
        assert_eq!(first, vec!["A", "B"]);
        let second = r.company_ids_page(Some("B"), 2).unwrap();
        assert_eq!(second, vec!["C", "D"]);
        let last = r.company_ids_page(Some("D"), 2).unwrap();
        assert_eq!(last, vec!["E"]);
        assert!(r.company_ids_page(Some("E"), 2).unwrap().is_empty());
    }

    #[test]
    fn replace_signal_keeps_one_row() {
        let r = repo();
        let s = NewSignal {
            company_id: "ACME".into(),
            formula_id: 1,
            signal: "BUY".into(),
            value: Some(1.5),
            metadata: Some(serde_json::json!({"formula": "f"})),
        };
        assert!(r.replace_signal("ACME", 1, Some(&s)).unwrap());
        assert!(r.replace_signal("ACME", 1, Some(&s)).unwrap());
        let rows = r.list_signals(Some("ACME")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Some(1.5));
        assert_eq!(rows[0].metadata, Some(serde_json::json!({"formula": "f"})));

        assert!(!r.replace_signal("ACME", 1, None).unwrap());
        assert_eq!(r.signal_count().unwrap(), 0);
    }

    #[test]
    fn replace_signal_drops_rows_of_other_formulas() {
        let r = repo();
        let signal = |company: &str, formula_id, label: &str| NewSignal {
            company_id: company.into(),
            formula_id,
            signal: label.into(),
            value: None,
            metadata: None,
        };
        r.replace_signal("ACME", 1, Some(&signal("ACME", 1, "BUY"))).unwrap();
        r.replace_signal("BETA", 1, Some(&signal("BETA", 1, "BUY"))).unwrap();
        r.replace_signal("ACME", 2, Some(&signal("ACME", 2, "SELL"))).unwrap();

        let acme = r.list_signals(Some("ACME")).unwrap();
        assert_eq!(acme.len(), 1);
        assert_eq!((acme[0].formula_id, acme[0].signal.as_str()), (2, "SELL"));
        assert_eq!(r.signal_count().unwrap(), 2);

        assert_eq!(r.clear_signals("ACME").unwrap(), 1);
        assert_eq!(r.clear_signals("ACME").unwrap(), 0);
        assert_eq!(r.signal_count().unwrap(), 1);
    }

    #[test]
    fn metric_upsert_overwrites_and_tracks_latest_write() {
        let r = repo();
        let t0 = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::days(1);
        let point = |v: &str, at| QuarterlyMetricPoint {
            company_id: "ACME".into(),
            quarter: "2024-Q1".into(),
            metric_name: "OPM %".into(),
            metric_value: Some(v.into()),
            scraped_at: at,
        };
        r.upsert_quarterly_metrics(&[point("10", t0)]).unwrap();
        r.upsert_quarterly_metrics(&[point("12", t1)]).unwrap();
        let points = r.quarterly_points("ACME").unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].metric_value.as_deref(), Some("12"));
        assert_eq!(r.latest_metric_write("ACME").unwrap(), Some(t1));
        assert_eq!(r.latest_metric_write("NONE").unwrap(), None);
    }
}
