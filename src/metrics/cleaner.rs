use crate::models::QuarterGroup;
use chrono::{Datelike, NaiveDate};
use std::cmp::Ordering;

// ── Value parsing ─────────────────────────────────────────────────────────────

/// Parse a scraped metric cell.
/// "12.5%" → 12.5 | "1,204" → 1204.0 | "N/A" → None | "" → None
pub fn parse_metric_value(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "N/A" || s == "NA" || s == "-" || s == "—" || s == "--" {
        return None;
    }
    let s = s.strip_suffix('%').unwrap_or(s).trim_end().replace(',', "");
    let v: f64 = s.parse().ok()?;
    // "NaN" and "inf" parse as f64 but are never real scraped numbers
    if v.is_finite() { Some(v) } else { None }
}

pub fn parse_metric_cell(cell: Option<&String>) -> Option<f64> {
    cell.and_then(|s| parse_metric_value(s))
}

/// Lowercase and drop `(`, `)`, `%` and whitespace.
/// "Sales Growth (YoY) %" → "salesgrowthyoy"
pub fn normalise_metric_key(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '%'))
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn normalise_company_id(s: &str) -> String {
    s.trim().to_uppercase()
}

// ── Quarter ordering ──────────────────────────────────────────────────────────

/// Period a quarter label refers to, as (year, month, day).
///
/// Accepts "2024-Q3", "2024 Q3", "Q3 2024", "Q3FY24", "Sep 2024",
/// "September 2024", "2024-09" and "2024-09-30". Day is 0 when the label
/// has no day component.
pub fn parse_quarter_label(label: &str) -> Option<(i32, u32, u32)> {
    let s = label.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some((d.year(), d.month(), d.day()));
    }
    for fmt in ["%d %b %Y", "%d %B %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("01 {}", s.replace('-', " ")), fmt) {
            return Some((d.year(), d.month(), 0));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        return Some((d.year(), d.month(), 0));
    }

    parse_quarter_code(s)
}

fn parse_quarter_code(s: &str) -> Option<(i32, u32, u32)> {
    let upper: String = s
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    // "2024Q3"
    if let Some((year, q)) = upper.split_once('Q') {
        if year.len() == 4 {
            let year: i32 = year.parse().ok()?;
            let q: u32 = q.parse().ok()?;
            return quarter_period(year, q);
        }
        // "Q32024" / "Q3FY24"
        if year.is_empty() && !q.is_empty() {
            let (qn, rest) = q.split_at(1);
            let q: u32 = qn.parse().ok()?;
            let rest = rest.strip_prefix("FY").unwrap_or(rest);
            let year: i32 = match rest.len() {
                2 => 2000 + rest.parse::<i32>().ok()?,
                4 => rest.parse().ok()?,
                _ => return None,
            };
            return quarter_period(year, q);
        }
    }
    None
}

fn quarter_period(year: i32, q: u32) -> Option<(i32, u32, u32)> {
    (1..=4).contains(&q).then_some((year, q * 3, 0))
}

/// Most recent quarter first. Labels that parse as a period rank above
/// labels that don't; unparseable labels order lexicographically.
pub fn compare_quarters_desc(a: &str, b: &str) -> Ordering {
    match (parse_quarter_label(a), parse_quarter_label(b)) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| b.cmp(a)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.cmp(a),
    }
}

pub fn sort_quarters_desc(groups: &mut [QuarterGroup]) {
    groups.sort_by(|a, b| compare_quarters_desc(&a.quarter, &b.quarter));
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metric_value() {
        assert_eq!(parse_metric_value("12.5%"), Some(12.5));
        assert_eq!(parse_metric_value(" -3 % "), Some(-3.0));
        assert_eq!(parse_metric_value("1,204"), Some(1204.0));
        assert_eq!(parse_metric_value("0"), Some(0.0));
        assert_eq!(parse_metric_value("N/A"), None);
        assert_eq!(parse_metric_value(""), None);
        assert_eq!(parse_metric_value("abc%"), None);
        assert_eq!(parse_metric_value("NaN"), None);
    }

    #[test]
    fn percent_suffix_round_trips() {
        for v in [0.0, 12.345, -7.5, 150.0, 0.001] {
            let text = format!("{}%", v);
            let parsed = parse_metric_value(&text).unwrap();
            assert!((parsed - v).abs() < 1e-9, "{} → {}", text, parsed);
        }
    }

    #[test]
    fn test_normalise_metric_key() {
        assert_eq!(normalise_metric_key("Sales Growth (YoY) %"), "salesgrowthyoy");
        assert_eq!(normalise_metric_key("  OPM % "), "opm");
    }

    #[test]
    fn test_parse_quarter_label() {
        assert_eq!(parse_quarter_label("2024-Q3"), Some((2024, 9, 0)));
        assert_eq!(parse_quarter_label("Q1 2025"), Some((2025, 3, 0)));
        assert_eq!(parse_quarter_label("Q4FY24"), Some((2024, 12, 0)));
        assert_eq!(parse_quarter_label("Sep 2024"), Some((2024, 9, 0)));
        assert_eq!(parse_quarter_label("Dec-2023"), Some((2023, 12, 0)));
        assert_eq!(parse_quarter_label("2024-06"), Some((2024, 6, 0)));
        assert_eq!(parse_quarter_label("2024-06-30"), Some((2024, 6, 30)));
        assert_eq!(parse_quarter_label("2024-Q5"), None);
        assert_eq!(parse_quarter_label("latest"), None);
    }

    #[test]
    fn month_labels_sort_by_period_not_text() {
        let mut groups = vec![
            QuarterGroup::new("Dec 2023"),
            QuarterGroup::new("Mar 2024"),
            QuarterGroup::new("Sep 2023"),
        ];
        sort_quarters_desc(&mut groups);
        let order: Vec<&str> = groups.iter().map(|g| g.quarter.as_str()).collect();
        assert_eq!(order, vec!["Mar 2024", "Dec 2023", "Sep 2023"]);
    }

    #[test]
    fn unparseable_labels_rank_last() {
        let mut groups = vec![QuarterGroup::new("b"), QuarterGroup::new("2020-Q1"), QuarterGroup::new("c")];
        sort_quarters_desc(&mut groups);
        let order: Vec<&str> = groups.iter().map(|g| g.quarter.as_str()).collect();
        assert_eq!(order, vec!["2020-Q1", "c", "b"]);
    }
}
