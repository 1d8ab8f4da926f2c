//! Canonical signal rule, compiled rather than parsed.
//!
//! Reads the ten cells of an [`ExtractedMetricSet`]:
//!
//! | cell | current | prior |
//! |------|---------|-------|
//! | Sales YoY %       | Q12 | P12 |
//! | EPS YoY %         | Q13 | P13 |
//! | Operating margin %| Q14 | P14 |
//! | Sales QoQ %       | Q15 | P15 |
//! | EPS QoQ %         | Q16 | P16 |
//!
//! Any missing cell yields `No Signal`; missing is never read as zero.

use crate::models::ExtractedMetricSet;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const BUY: &str = "BUY";
pub const SELL: &str = "Check_OPM (Sell)";
pub const NO_SIGNAL: &str = "No Signal";

/// Drop threshold for the percentage-change test in the sell branch.
const DROP_THRESHOLD: f64 = -0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalSignal {
    Buy,
    Sell,
    NoSignal,
}

impl CanonicalSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalSignal::Buy => BUY,
            CanonicalSignal::Sell => SELL,
            CanonicalSignal::NoSignal => NO_SIGNAL,
        }
    }
}

impl fmt::Display for CanonicalSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All ten cells present.
#[derive(Debug, Clone, Copy)]
struct Cells {
    sales_yoy: f64,
    eps_yoy: f64,
    opm: f64,
    sales_qoq: f64,
    eps_qoq: f64,
    p_sales_yoy: f64,
    p_eps_yoy: f64,
    p_opm: f64,
    p_sales_qoq: f64,
    p_eps_qoq: f64,
}

impl Cells {
    fn from_set(m: &ExtractedMetricSet) -> Option<Self> {
        Some(Self {
            sales_yoy: m.q12?,
            eps_yoy: m.q13?,
            opm: m.q14?,
            sales_qoq: m.q15?,
            eps_qoq: m.q16?,
            p_sales_yoy: m.p12?,
            p_eps_yoy: m.p13?,
            p_opm: m.p14?,
            p_sales_qoq: m.p15?,
            p_eps_qoq: m.p16?,
        })
    }
}

pub fn classify(metrics: &ExtractedMetricSet) -> CanonicalSignal {
    let Some(c) = Cells::from_set(metrics) else {
        return CanonicalSignal::NoSignal;
    };
    if is_buy(&c) {
        CanonicalSignal::Buy
    } else if is_sell(&c) {
        CanonicalSignal::Sell
    } else {
        CanonicalSignal::NoSignal
    }
}

fn is_buy(c: &Cells) -> bool {
    let margins_positive = c.opm > 0.0 && c.p_opm > 0.0;

    let sales_strong = c.sales_yoy >= 20.0 && c.sales_qoq >= 20.0;

    let eps_strong = (c.eps_yoy.min(c.eps_qoq) >= 5.0 && (c.eps_yoy >= 10.0 || c.eps_qoq >= 10.0))
        || (c.eps_qoq >= 5.0 && c.eps_qoq < 10.0 && c.eps_yoy >= 100.0)
        || (c.eps_yoy < 0.0 && c.eps_qoq >= 10.0);

    let prior_sales_growing = c.p_sales_yoy >= 10.0;

    let prior_pair_positive = (c.p_eps_yoy > 0.0 && c.p_sales_qoq > 0.0)
        || (c.p_eps_yoy > 0.0 && c.p_eps_qoq > 0.0)
        || (c.p_sales_qoq > 0.0 && c.p_eps_qoq > 0.0);

    // A negative prior EPS print is excused by a strong current print of the other measure
    let prior_eps_excused =
        (c.p_eps_qoq >= 0.0 || c.eps_yoy >= 10.0) && (c.p_eps_yoy >= 0.0 || c.eps_qoq >= 10.0);

    let prior_sales_qoq_ok =
        c.p_sales_qoq >= 0.0 || (c.p_sales_qoq < 0.0 && c.eps_yoy >= 0.0 && c.eps_qoq >= 0.0);

    margins_positive
        && sales_strong
        && eps_strong
        && prior_sales_growing
        && prior_pair_positive
        && prior_eps_excused
        && prior_sales_qoq_ok
}

fn is_sell(c: &Cells) -> bool {
    let decelerating = c.p_eps_yoy < 10.0
        && c.eps_yoy < 10.0
        && c.sales_qoq < c.p_sales_qoq
        && c.eps_qoq < c.p_eps_qoq;

    let eps_negative = c.eps_yoy < 0.0 && c.eps_qoq < 0.0;

    let contracting = c.eps_qoq < 0.0 && c.sales_qoq < 0.0 && (c.eps_yoy < 0.0 || c.sales_yoy < 10.0);

    let sales_dropping = (c.eps_yoy < 5.0 || c.eps_qoq < 5.0)
        && (dropped(c.p_sales_yoy, c.sales_yoy) || dropped(c.p_sales_qoq, c.sales_qoq));

    let weak_growth = c.sales_yoy < 20.0 && c.eps_yoy < 5.0;

    decelerating || eps_negative || contracting || sales_dropping || weak_growth
}

/// Relative change from `prior` to `current` at or below -15%.
/// With a zero prior, any negative current value counts as a drop.
fn dropped(prior: f64, current: f64) -> bool {
    if prior != 0.0 {
        (current - prior) / prior.abs() <= DROP_THRESHOLD
    } else {
        current < 0.0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Current and prior values in Sales YoY, EPS YoY, OPM, Sales QoQ, EPS QoQ order.
    fn set(cur: [f64; 5], prior: [f64; 5]) -> ExtractedMetricSet {
        ExtractedMetricSet {
            q12: Some(cur[0]),
            q13: Some(cur[1]),
            q14: Some(cur[2]),
            q15: Some(cur[3]),
            q16: Some(cur[4]),
            p12: Some(prior[0]),
            p13: Some(prior[1]),
            p14: Some(prior[2]),
            p15: Some(prior[3]),
            p16: Some(prior[4]),
        }
    }

    const BUY_CUR: [f64; 5] = [25.0, 12.0, 15.0, 22.0, 8.0];
    const BUY_PRIOR: [f64; 5] = [15.0, 5.0, 10.0, 3.0, 1.0];

    fn buy_with(f: impl FnOnce(&mut ExtractedMetricSet)) -> CanonicalSignal {
        let mut m = set(BUY_CUR, BUY_PRIOR);
        f(&mut m);
        classify(&m)
    }

    /// Not BUY (negative current margin) and no sell clause firing.
    fn neutral_with(f: impl FnOnce(&mut ExtractedMetricSet)) -> CanonicalSignal {
        let mut m = set([25.0, 12.0, -2.0, 22.0, 8.0], BUY_PRIOR);
        f(&mut m);
        classify(&m)
    }

    #[test]
    fn base_case_is_buy() {
        assert_eq!(classify(&set(BUY_CUR, BUY_PRIOR)), CanonicalSignal::Buy);
    }

    #[test]
    fn scenario_growth_with_negative_prior_eps_qoq_is_buy() {
        let m = set([25.0, 12.0, 15.0, 22.0, 8.0], [15.0, 5.0, 10.0, 3.0, -1.0]);
        assert_eq!(classify(&m), CanonicalSignal::Buy);
    }

    #[test]
    fn negative_current_margin_falls_through() {
        let m = set([25.0, 12.0, -2.0, 22.0, 8.0], [15.0, 5.0, 10.0, 3.0, -1.0]);
        assert_ne!(classify(&m), CanonicalSignal::Buy);
        assert_eq!(classify(&m), CanonicalSignal::NoSignal);
    }

    #[test]
    fn any_missing_slot_is_no_signal() {
        for i in 0..10 {
            let mut m = set(BUY_CUR, BUY_PRIOR);
            let slot = match i {
                0 => &mut m.q12,
                1 => &mut m.q13,
                2 => &mut m.q14,
                3 => &mut m.q15,
                4 => &mut m.q16,
                5 => &mut m.p12,
                6 => &mut m.p13,
                7 => &mut m.p14,
                8 => &mut m.p15,
                _ => &mut m.p16,
            };
            *slot = None;
            assert_eq!(classify(&m), CanonicalSignal::NoSignal, "slot {}", i);
        }
        assert_eq!(classify(&ExtractedMetricSet::default()), CanonicalSignal::NoSignal);
    }

    #[test]
    fn margins_must_be_strictly_positive() {
        assert_ne!(buy_with(|m| m.q14 = Some(0.0)), CanonicalSignal::Buy);
        assert_ne!(buy_with(|m| m.p14 = Some(0.0)), CanonicalSignal::Buy);
        assert_eq!(buy_with(|m| m.q14 = Some(0.01)), CanonicalSignal::Buy);
        assert_eq!(buy_with(|m| m.p14 = Some(0.01)), CanonicalSignal::Buy);
    }

    #[test]
    fn current_sales_thresholds_are_inclusive() {
        assert_eq!(buy_with(|m| m.q12 = Some(20.0)), CanonicalSignal::Buy);
        assert_ne!(buy_with(|m| m.q12 = Some(19.99)), CanonicalSignal::Buy);
        assert_eq!(buy_with(|m| m.q15 = Some(20.0)), CanonicalSignal::Buy);
        assert_ne!(buy_with(|m| m.q15 = Some(19.99)), CanonicalSignal::Buy);
    }

    #[test]
    fn prior_sales_yoy_threshold_is_inclusive() {
        assert_eq!(buy_with(|m| m.p12 = Some(10.0)), CanonicalSignal::Buy);
        assert_ne!(buy_with(|m| m.p12 = Some(9.99)), CanonicalSignal::Buy);
    }

    #[test]
    fn eps_strength_first_disjunct() {
        let at = |yoy: f64, qoq: f64| {
            buy_with(|m| {
                m.q13 = Some(yoy);
                m.q16 = Some(qoq);
            })
        };
        assert_eq!(at(10.0, 5.0), CanonicalSignal::Buy);
        assert_ne!(at(10.0, 4.99), CanonicalSignal::Buy);
        assert_eq!(at(5.0, 10.0), CanonicalSignal::Buy);
        assert_ne!(at(9.99, 9.99), CanonicalSignal::Buy);
    }

    #[test]
    fn eps_strength_turnaround_disjunct() {
        let at = |yoy: f64, qoq: f64| {
            buy_with(|m| {
                m.q13 = Some(yoy);
                m.q16 = Some(qoq);
            })
        };
        assert_eq!(at(-0.01, 10.0), CanonicalSignal::Buy);
        assert_ne!(at(-0.01, 9.99), CanonicalSignal::Buy);
        // exactly zero is neither negative nor at least 5
        assert_ne!(at(0.0, 10.0), CanonicalSignal::Buy);
    }

    #[test]
    fn eps_strength_hypergrowth_disjunct() {
        let at = |yoy: f64, qoq: f64| {
            buy_with(|m| {
                m.q13 = Some(yoy);
                m.q16 = Some(qoq);
            })
        };
        assert_eq!(at(100.0, 5.0), CanonicalSignal::Buy);
        assert_ne!(at(100.0, 4.99), CanonicalSignal::Buy);
    }

    #[test]
    fn prior_pairing_needs_two_positive() {
        assert_eq!(buy_with(|m| m.p13 = Some(0.0)), CanonicalSignal::Buy);
        assert_ne!(
            buy_with(|m| {
                m.p13 = Some(0.0);
                m.p15 = Some(0.0);
            }),
            CanonicalSignal::Buy
        );
    }

    #[test]
    fn negative_prior_eps_needs_strong_current_print() {
        let qoq = |p16: f64, q13: f64| {
            buy_with(|m| {
                m.p16 = Some(p16);
                m.q13 = Some(q13);
                m.q16 = Some(10.0);
            })
        };
        assert_eq!(qoq(0.0, 9.99), CanonicalSignal::Buy);
        assert_ne!(qoq(-0.01, 9.99), CanonicalSignal::Buy);
        assert_eq!(qoq(-0.01, 10.0), CanonicalSignal::Buy);

        let yoy = |p13: f64, q16: f64| {
            buy_with(|m| {
                m.p13 = Some(p13);
                m.q16 = Some(q16);
            })
        };
        assert_eq!(yoy(0.0, 9.99), CanonicalSignal::Buy);
        assert_ne!(yoy(-0.01, 9.99), CanonicalSignal::Buy);
        assert_eq!(yoy(-0.01, 10.0), CanonicalSignal::Buy);
    }

    #[test]
    fn negative_prior_sales_qoq_needs_non_negative_current_eps() {
        let at = |p15: f64, q13: f64| {
            buy_with(|m| {
                m.p15 = Some(p15);
                m.q13 = Some(q13);
                m.q16 = Some(10.0);
            })
        };
        assert_eq!(at(0.0, -0.01), CanonicalSignal::Buy);
        assert_ne!(at(-1.0, -0.01), CanonicalSignal::Buy);
        assert_eq!(at(-1.0, 12.0), CanonicalSignal::Buy);
    }

    #[test]
    fn neutral_base_has_no_signal() {
        assert_eq!(neutral_with(|_| {}), CanonicalSignal::NoSignal);
    }

    #[test]
    fn weak_growth_sells() {
        let at = |q12: f64, q13: f64| {
            neutral_with(|m| {
                m.q12 = Some(q12);
                m.q13 = Some(q13);
            })
        };
        assert_eq!(at(19.99, 4.99), CanonicalSignal::Sell);
        assert_eq!(at(20.0, 4.99), CanonicalSignal::NoSignal);
        assert_eq!(at(19.99, 5.0), CanonicalSignal::NoSignal);
    }

    #[test]
    fn negative_eps_sells() {
        let m = set([25.0, -1.0, 15.0, 22.0, -1.0], BUY_PRIOR);
        assert_eq!(classify(&m), CanonicalSignal::Sell);
    }

    #[test]
    fn sales_drop_of_fifteen_percent_sells() {
        let at = |q15: f64| {
            neutral_with(|m| {
                m.q13 = Some(4.99);
                m.p15 = Some(20.0);
                m.q15 = Some(q15);
            })
        };
        assert_eq!(at(17.0), CanonicalSignal::Sell);
        assert_eq!(at(17.01), CanonicalSignal::NoSignal);
    }

    #[test]
    fn sales_drop_with_zero_prior_uses_sign() {
        let at = |q15: f64| {
            neutral_with(|m| {
                m.q13 = Some(4.99);
                m.p15 = Some(0.0);
                m.q15 = Some(q15);
            })
        };
        assert_eq!(at(-0.01), CanonicalSignal::Sell);
        assert_eq!(at(0.0), CanonicalSignal::NoSignal);
    }

    #[test]
    fn deceleration_sells() {
        let m = set([25.0, 9.0, -2.0, 2.0, 6.0], [15.0, 9.0, 10.0, 3.0, 7.0]);
        assert_eq!(classify(&m), CanonicalSignal::Sell);
        // same picture with current EPS YoY at 10 no longer decelerates
        let m = set([25.0, 10.0, -2.0, 2.0, 6.0], [15.0, 9.0, 10.0, 3.0, 7.0]);
        assert_eq!(classify(&m), CanonicalSignal::NoSignal);
    }

    #[test]
    fn contraction_sells() {
        let m = set([9.0, 12.0, 15.0, -1.0, -1.0], [9.0, 5.0, 10.0, -1.0, -1.0]);
        assert_eq!(classify(&m), CanonicalSignal::Sell);
    }

    #[test]
    fn labels() {
        assert_eq!(CanonicalSignal::Buy.as_str(), "BUY");
        assert_eq!(CanonicalSignal::Sell.to_string(), "Check_OPM (Sell)");
        assert_eq!(CanonicalSignal::NoSignal.as_str(), "No Signal");
    }
}
