mod classifier;
mod config;
mod formula;
mod loader;
mod metrics;
mod models;
mod pipeline;
mod rules;
mod storage;
mod utils;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::formula::{Environment, FormulaValue};
use crate::loader::{discover_csv_files, load_companies_csv, load_quarterly_csv};
use crate::models::{FormulaKind, FormulaScope, NewFormula, group_by_quarter};
use crate::pipeline::CalcOptions;
use crate::pipeline::job::{JobManager, JobRequest};
use crate::rules::FormulaAdmin;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "screener-signals", about = "Formula evaluation & signal generation engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Apply schema migrations without loading data
    Migrate,

    /// Import company metadata (company,name,sector CSV)
    LoadCompanies {
        /// Defaults to loader.companies_file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Import wide quarterly metric CSVs, one file per company
    LoadMetrics {
        /// Defaults to loader.data_dir
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Manage formulas
    #[command(subcommand)]
    Formula(FormulaCommand),

    /// Run the canonical classifier for one company and show its cells
    Classify { company: String },

    /// Calculate signals as a background job and wait for it
    Calculate {
        /// Restrict to these companies (repeatable)
        #[arg(short, long = "company")]
        companies: Vec<String>,

        /// Recalculate even when quarterly data is unchanged
        #[arg(long)]
        full: bool,

        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// List stored signals
    Signals {
        #[arg(short, long)]
        company: Option<String>,
    },

    /// Show recent calculation jobs
    Jobs {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show database statistics
    Stats,
}

#[derive(Subcommand)]
enum FormulaCommand {
    /// Create a formula
    Add(FormulaFields),

    /// Edit a formula; omitted fields keep their value
    Update {
        id: i64,
        #[command(flatten)]
        fields: FormulaFields,
    },

    /// List all formulas
    List,

    /// Evaluate a condition against a company or ad-hoc cells
    Test {
        condition: String,
        #[arg(short, long)]
        company: Option<String>,
        /// Cell binding such as Q12=15 (repeatable)
        #[arg(short = 's', long = "set")]
        cells: Vec<String>,
    },

    /// Check that a condition compiles
    Validate { condition: String },

    /// Make a global formula the active default
    Activate { id: i64 },

    /// Delete a formula, moving its assignments to a replacement
    Delete {
        id: i64,
        #[arg(short, long)]
        replacement: Option<i64>,
    },

    /// Clear every company/sector override, or point them all at one global formula
    Reset {
        #[arg(short, long)]
        target: Option<i64>,
    },

    /// Set or clear an explicit override
    Assign {
        #[arg(long, conflicts_with = "sector", required_unless_present = "sector")]
        company: Option<String>,
        #[arg(long)]
        sector: Option<String>,
        /// Omit to clear the override
        #[arg(long)]
        formula: Option<i64>,
    },
}

#[derive(Args, Debug, Default)]
struct FormulaFields {
    #[arg(long)]
    name: Option<String>,
    /// global | sector | company
    #[arg(long)]
    scope: Option<FormulaScope>,
    /// Sector id or company id for scoped formulas
    #[arg(long)]
    scope_value: Option<String>,
    /// expression | canonical
    #[arg(long)]
    kind: Option<FormulaKind>,
    #[arg(long)]
    condition: Option<String>,
    /// Label for TRUE or non-zero results
    #[arg(long)]
    signal: Option<String>,
    #[arg(long)]
    priority: Option<i32>,
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    active: Option<bool>,
}

impl FormulaFields {
    fn apply(self, mut f: NewFormula) -> NewFormula {
        if let Some(v) = self.name {
            f.name = v;
        }
        if let Some(v) = self.scope {
            f.scope = v;
            if v == FormulaScope::Global {
                f.scope_value = None;
            }
        }
        if let Some(v) = self.scope_value {
            f.scope_value = Some(v);
        }
        if let Some(v) = self.kind {
            f.kind = v;
        }
        if let Some(v) = self.condition {
            f.condition = v;
        }
        if let Some(v) = self.signal {
            f.signal = v;
        }
        if let Some(v) = self.priority {
            f.priority = v;
        }
        if let Some(v) = self.enabled {
            f.enabled = v;
        }
        if let Some(v) = self.active {
            f.is_active_global = v;
        }
        f
    }
}

fn blank_formula() -> NewFormula {
    NewFormula {
        name: String::new(),
        kind: FormulaKind::Expression,
        scope: FormulaScope::Global,
        scope_value: None,
        condition: String::new(),
        signal: String::new(),
        priority: 100,
        enabled: true,
        is_active_global: false,
    }
}

/// `Q12=15` → ("Q12", Number(15)); TRUE/FALSE become booleans, anything else text.
fn parse_cell(binding: &str) -> Result<(String, FormulaValue)> {
    let (name, raw) = binding
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got '{}'", binding))?;
    let raw = raw.trim();
    let value = if let Some(n) = metrics::cleaner::parse_metric_value(raw) {
        FormulaValue::Number(n)
    } else if raw.eq_ignore_ascii_case("true") {
        FormulaValue::Bool(true)
    } else if raw.eq_ignore_ascii_case("false") {
        FormulaValue::Bool(false)
    } else {
        FormulaValue::Text(raw.trim_matches('"').to_string())
    };
    Ok((name.trim().to_string(), value))
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "screener_signals=info,warn",
        1 => "screener_signals=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }

        Command::LoadCompanies { file } => {
            let _t = utils::Timer::start("Company import");
            let path = file.unwrap_or_else(|| config.loader.companies_file.clone());
            let repo = open_repo(&config)?;
            let (companies, sectors) = load_companies_csv(&path)?;
            repo.upsert_sectors(&sectors)?;
            repo.upsert_companies(&companies)?;
            info!("Done: {} companies, {} sectors", companies.len(), sectors.len());
        }

        Command::LoadMetrics { dir } => {
            let _t = utils::Timer::start("Quarterly metric import");
            let dir = dir.unwrap_or_else(|| config.loader.data_dir.clone());
            let repo = open_repo(&config)?;

            let files = discover_csv_files(&dir)?;
            info!("Found {} CSV files in {:?}", files.len(), dir);

            let now = Utc::now().naive_utc();
            let mut total = 0usize;
            let mut errors = 0usize;
            for path in &files {
                match load_quarterly_csv(path, now) {
                    Ok((company, points)) => {
                        if repo.get_company(&company)?.is_none() {
                            warn!("{}: not in companies table, adding without metadata", company);
                            repo.upsert_companies(&[models::Company {
                                id: company.clone(),
                                name: String::new(),
                                sector_id: None,
                                assigned_formula_id: None,
                                signals_calculated_at: None,
                            }])?;
                        }
                        total += repo.upsert_quarterly_metrics(&points)?;
                    }
                    Err(e) => {
                        warn!("Error loading {:?}: {:#}", path, e);
                        errors += 1;
                    }
                }
            }
            info!("Done: {} metric cells, {} errors", utils::fmt_number(total as i64), errors);
        }

        Command::Formula(cmd) => run_formula_command(cmd, &config)?,

        Command::Classify { company } => {
            let repo = open_repo(&config)?;
            let company = metrics::cleaner::normalise_company_id(&company);
            let points = repo.quarterly_points(&company)?;
            if points.is_empty() {
                bail!("No quarterly data for {}", company);
            }
            let extraction = metrics::extract(group_by_quarter(&points));
            println!("{}  current: {}  previous: {}",
                company,
                extraction.current_quarter.as_deref().unwrap_or("—"),
                extraction.previous_quarter.as_deref().unwrap_or("—"),
            );
            for (name, value) in extraction.metrics.cells() {
                println!("  {:<4} {:>10}", name, utils::fmt_cell(value));
            }
            println!("Signal: {}", classifier::classify(&extraction.metrics));
        }

        Command::Calculate { companies, full, batch_size } => {
            let _t = utils::Timer::start("Signal calculation");
            let repo = open_repo(&config)?;
            let mut options = CalcOptions::from(&config.engine);
            if full {
                options.incremental = false;
            }
            if let Some(n) = batch_size {
                options.batch_size = n;
            }
            let request = JobRequest {
                companies: (!companies.is_empty()).then_some(companies),
                options,
            };

            let manager = JobManager::new(repo);
            let id = manager.submit(request)?;
            println!("Job {} submitted", id);

            let poll = config.engine.poll_interval();
            let status = tokio::select! {
                status = manager.wait(id, poll) => status?,
                _ = tokio::signal::ctrl_c() => {
                    manager.cancel(id)?;
                    manager.wait(id, poll).await?
                }
            };

            println!("─────────────────────────────────");
            println!("  Job {}", status.id);
            println!("─────────────────────────────────");
            println!("  Status        : {}", status.state.as_str());
            println!("  Mode          : {}", status.mode.as_str());
            println!("  Processed     : {}/{}", status.processed, status.total);
            println!("  Succeeded     : {}", status.succeeded);
            println!("  Skipped       : {}", status.skipped);
            println!("  Missing data  : {}", status.missing_data);
            println!("  Failed        : {}", status.failed);
            println!("  Signals       : {}", status.signals_generated);
            println!("─────────────────────────────────");
            for (company, err) in &status.failures {
                println!("  ✗ {}: {}", company, err);
            }
            if let Some(e) = &status.error {
                bail!("Job failed: {}", e);
            }
        }

        Command::Signals { company } => {
            let repo = open_repo(&config)?;
            let company = company.map(|c| metrics::cleaner::normalise_company_id(&c));
            let signals = repo.list_signals(company.as_deref())?;
            if signals.is_empty() {
                println!("No signals — run `screener-signals calculate` first.");
            }
            for s in &signals {
                println!(
                    "  {:<12} formula {:<4} {:<20} {:>10}  {}",
                    s.company_id,
                    s.formula_id,
                    s.signal,
                    utils::fmt_cell(s.value),
                    s.calculated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        Command::Jobs { limit } => {
            let repo = open_repo(&config)?;
            for j in repo.recent_jobs(limit)? {
                println!(
                    "  {}  {:<11} {:<9} {}  processed {:>6}  failed {:>4}  signals {:>6}",
                    j.id,
                    j.mode,
                    j.status,
                    j.started_at.format("%Y-%m-%d %H:%M:%S"),
                    j.processed,
                    j.failed,
                    j.signals_generated
                );
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let formulas = repo.list_formulas()?;
            let active = formulas.iter().find(|f| f.is_active_global);
            println!("─────────────────────────────────");
            println!("  Screener — Database Stats");
            println!("─────────────────────────────────");
            println!("  Companies     : {}", utils::fmt_number(repo.company_count()?));
            println!("  Metric cells  : {}", utils::fmt_number(repo.metric_count()?));
            println!("  Formulas      : {}", formulas.len());
            println!(
                "  Active global : {}",
                active.map(|f| format!("{} ({})", f.id, f.name)).unwrap_or("—".into())
            );
            println!("  Signals       : {}", utils::fmt_number(repo.signal_count()?));
            println!("─────────────────────────────────");
        }
    }

    Ok(())
}

fn run_formula_command(cmd: FormulaCommand, config: &AppConfig) -> Result<()> {
    let repo = open_repo(config)?;
    let admin = FormulaAdmin::new(&repo);

    match cmd {
        FormulaCommand::Add(fields) => {
            let new = fields.apply(blank_formula());
            if new.name.trim().is_empty() {
                bail!("--name is required");
            }
            let id = admin.create(&new)?;
            println!("Formula {} created.", id);
        }

        FormulaCommand::Update { id, fields } => {
            let current = repo.get_formula(id)?.with_context(|| format!("formula {} not found", id))?;
            let new = fields.apply(NewFormula {
                name: current.name,
                kind: current.kind,
                scope: current.scope,
                scope_value: current.scope_value,
                condition: current.condition,
                signal: current.signal,
                priority: current.priority,
                enabled: current.enabled,
                is_active_global: current.is_active_global,
            });
            admin.update(id, &new)?;
            println!("Formula {} updated.", id);
        }

        FormulaCommand::List => {
            for f in repo.list_formulas()? {
                println!(
                    "{} {:>4}  {:<24} {:<8} {:<12} p{:<4} {:<10} {:<12} {}",
                    if f.is_active_global { "*" } else { " " },
                    f.id,
                    utils::truncate(&f.name, 24),
                    f.scope.as_str(),
                    f.scope_value.as_deref().unwrap_or("—"),
                    f.priority,
                    f.kind.as_str(),
                    if f.enabled { f.signal.as_str() } else { "(disabled)" },
                    utils::truncate(&f.condition, 60),
                );
            }
        }

        FormulaCommand::Test { condition, company, cells } => match company {
            Some(company) => {
                let company = metrics::cleaner::normalise_company_id(&company);
                let (value, extraction) = admin.test_against_company(&condition, &company)?;
                println!(
                    "{} ({} vs {}): {}",
                    company,
                    extraction.current_quarter.as_deref().unwrap_or("—"),
                    extraction.previous_quarter.as_deref().unwrap_or("—"),
                    value
                );
            }
            None => {
                let mut env = Environment::new();
                for binding in &cells {
                    let (name, value) = parse_cell(binding)?;
                    env.set(name, value);
                }
                println!("{}", rules::test_formula(&condition, &env)?);
            }
        },

        FormulaCommand::Validate { condition } => {
            let compiled = formula::compile(&condition)?;
            let cells: Vec<String> = compiled.identifiers().into_iter().collect();
            println!("OK. Reads: {}", if cells.is_empty() { "—".to_string() } else { cells.join(", ") });
        }

        FormulaCommand::Activate { id } => {
            admin.set_active_global(id)?;
            println!("Formula {} is now the active global formula.", id);
        }

        FormulaCommand::Delete { id, replacement } => {
            let counts = admin.delete(id, replacement)?;
            println!(
                "Formula {} deleted; {} companies and {} sectors reassigned.",
                id, counts.companies, counts.sectors
            );
        }

        FormulaCommand::Reset { target } => {
            let counts = admin.reset_all_to_global(target)?;
            println!("Reset {} companies and {} sectors.", counts.companies, counts.sectors);
        }

        FormulaCommand::Assign { company, sector, formula } => {
            match (company, sector) {
                (Some(c), _) => admin.assign_company(&metrics::cleaner::normalise_company_id(&c), formula)?,
                (None, Some(s)) => admin.assign_sector(&s, formula)?,
                (None, None) => bail!("pass --company or --sector"),
            }
            println!("Override updated.");
        }
    }

    Ok(())
}
