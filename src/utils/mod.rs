use std::time::{Duration, Instant};
use tracing::info;

/// Logs start and elapsed time of a CLI step.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self { label, start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("⏱  Finished: {} (took {:.2?})", self.label, self.elapsed());
    }
}

/// Format a count with thousands separators.
pub fn fmt_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Metric cell for tables: two decimals, or an em dash when absent.
pub fn fmt_cell(v: Option<f64>) -> String {
    v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "—".to_string())
}

/// Shorten `s` to at most `width` chars, marking the cut with `…`.
pub fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let keep = width.saturating_sub(1);
    let mut out: String = s.chars().take(keep).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_number() {
        assert_eq!(fmt_number(1_234_567), "1,234,567");
        assert_eq!(fmt_number(0), "0");
        assert_eq!(fmt_number(-42_000), "-42,000");
        assert_eq!(fmt_number(999), "999");
        assert_eq!(fmt_number(i64::MIN), "-9,223,372,036,854,775,808");
    }

    #[test]
    fn test_fmt_cell() {
        assert_eq!(fmt_cell(Some(12.5)), "12.50");
        assert_eq!(fmt_cell(None), "—");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("IF(Q12>10)", 20), "IF(Q12>10)");
        assert_eq!(truncate("IF(Q12>10)", 5), "IF(Q…");
        assert_eq!(truncate("abc", 0), "…");
    }
}
