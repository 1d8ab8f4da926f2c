//! CSV import of quarterly metric tables and company metadata.
//!
//! Quarterly files are wide: one file per company, first column the metric
//! name, one column per quarter.
//!
//! ```text
//! Metric,2024-Q1,2024-Q2
//! Sales Growth YoY %,15%,25%
//! OPM %,10,-
//! ```

use crate::metrics::cleaner::normalise_company_id;
use crate::models::{Company, QuarterlyMetricPoint, RawCompanyRow, Sector};
use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extract the company id from a CSV filename: `ACME_quarterly.csv` → `ACME`.
pub fn extract_company_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let company = normalise_company_id(stem.split(['_', ' ', '.']).next()?);

    if company.is_empty() { None } else { Some(company) }
}

/// Cell text as stored; blanks and placeholders become NULL.
fn cell_value(raw: &str) -> Option<String> {
    let v = raw.trim();
    match v {
        "" | "-" | "—" | "--" => None,
        _ if v.eq_ignore_ascii_case("n/a") || v.eq_ignore_ascii_case("na") => None,
        _ => Some(v.to_string()),
    }
}

/// Parse a wide quarterly CSV from any reader.
pub fn read_quarterly<R: Read>(
    company_id: &str,
    source: R,
    scraped_at: NaiveDateTime,
) -> Result<Vec<QuarterlyMetricPoint>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let quarters: Vec<String> = reader
        .headers()
        .context("Missing header row")?
        .iter()
        .skip(1)
        .map(str::to_string)
        .collect();
    if quarters.is_empty() {
        bail!("{}: header has no quarter columns", company_id);
    }

    let mut points = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: row {}: {}", company_id, i + 1, e);
                continue;
            }
        };

        let Some(metric) = record.get(0).map(str::trim).filter(|m| !m.is_empty()) else {
            continue;
        };

        for (quarter, raw) in quarters.iter().zip(record.iter().skip(1)) {
            if quarter.is_empty() {
                continue;
            }
            points.push(QuarterlyMetricPoint {
                company_id: company_id.to_string(),
                quarter: quarter.clone(),
                metric_name: metric.to_string(),
                metric_value: cell_value(raw),
                scraped_at,
            });
        }
    }

    Ok(points)
}

/// Load one company's quarterly file. The company id comes from the filename.
pub fn load_quarterly_csv(path: &Path, scraped_at: NaiveDateTime) -> Result<(String, Vec<QuarterlyMetricPoint>)> {
    let company = extract_company_from_filename(path)
        .with_context(|| format!("No company in filename {:?}", path))?;

    debug!("Loading {} from {:?}", company, path);
    let file = std::fs::File::open(path).with_context(|| format!("open {:?}", path))?;
    let points = read_quarterly(&company, file, scraped_at)?;

    info!("{}: {} metric cells loaded", company, points.len());
    Ok((company, points))
}

/// Parse a `company,name,sector` file into companies plus the sectors they name.
pub fn read_companies<R: Read>(source: R) -> Result<(Vec<Company>, Vec<Sector>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let mut companies = Vec::new();
    let mut sectors: BTreeMap<String, Sector> = BTreeMap::new();

    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Company row {}: {}", i + 1, e);
                continue;
            }
        };

        let raw = RawCompanyRow {
            company: record.get(0).map(|s| s.to_string()),
            name: record.get(1).map(|s| s.to_string()),
            sector: record.get(2).map(|s| s.to_string()),
        };

        let Some(id) = raw.company.as_deref().map(normalise_company_id).filter(|c| !c.is_empty()) else {
            warn!("Company row {}: no company id", i + 1);
            continue;
        };

        let sector_name = raw.sector.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let sector_id = sector_name.map(sector_id_for);
        if let (Some(name), Some(sid)) = (sector_name, &sector_id) {
            sectors.entry(sid.clone()).or_insert_with(|| Sector {
                id: sid.clone(),
                name: name.to_string(),
                assigned_formula_id: None,
            });
        }

        companies.push(Company {
            id,
            name: raw.name.unwrap_or_default().trim().to_string(),
            sector_id,
            assigned_formula_id: None,
            signals_calculated_at: None,
        });
    }

    Ok((companies, sectors.into_values().collect()))
}

pub fn load_companies_csv(path: &Path) -> Result<(Vec<Company>, Vec<Sector>)> {
    let file = std::fs::File::open(path).with_context(|| format!("open {:?}", path))?;
    let (companies, sectors) = read_companies(file)?;
    info!("{:?}: {} companies, {} sectors", path, companies.len(), sectors.len());
    Ok((companies, sectors))
}

/// Sector ids are the sector name upper-cased with spaces collapsed to `_`.
pub fn sector_id_for(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

pub fn discover_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
