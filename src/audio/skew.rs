//! Skew detection, the statistics half of the `SoundIoManager` lifecycle
//! (component G), §4.8.
//!
//! Grounded in the same `libhfp` sources as the pump: the original
//! reports clock skew between its two endpoints by comparing sample
//! counts over a rolling window and classifying the dominant drift.
//! This keeps a 5-period rolling window and reports at most one
//! classification per period, with a 2-consecutive-period strike
//! filter on everything except overruns (`XRun`), which are always
//! worth surfacing immediately.

use crate::audio::pump::CycleStats;

const WINDOW_PERIODS: usize = 5;
const PRIMARY_DUPLEX_THRESHOLD_PCT: f64 = 0.01;
const SECONDARY_DUPLEX_THRESHOLD_PCT: f64 = 2.0;
const ENDPOINT_THRESHOLD_PCT: f64 = 2.0;
const STRIKE_THRESHOLD: u32 = 2;

/// One period's classification. At most one is produced per period;
/// `XRun` bypasses the strike filter, the other three require two
/// consecutive periods of agreement before being surfaced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkewClass {
    /// Samples were dropped or padded due to overrun/underrun this
    /// period; `n` is the total sample count involved.
    XRun(usize),
    /// The bottom (sound card) endpoint's own input and output rates
    /// have drifted apart by at least 0.01%.
    PrimaryDuplex(f64),
    /// The top (SCO) endpoint's input and output rates have drifted
    /// apart by at least 2%.
    SecondaryDuplex(f64),
    /// The bottom and top endpoints have drifted relative to each
    /// other by at least 2%.
    Endpoint(f64),
}

impl SkewClass {
    fn kind_tag(self) -> u8 {
        match self {
            SkewClass::XRun(_) => 0,
            SkewClass::PrimaryDuplex(_) => 1,
            SkewClass::SecondaryDuplex(_) => 2,
            SkewClass::Endpoint(_) => 3,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PeriodTotals {
    bottom_in: usize,
    bottom_out: usize,
    top_in: usize,
    top_out: usize,
    drops: usize,
}

fn skew_pct(a: usize, b: usize) -> f64 {
    let hi = a.max(b) as f64;
    if hi == 0.0 {
        return 0.0;
    }
    (a as f64 - b as f64).abs() / hi * 100.0
}

/// Accumulates cycle statistics and emits at most one [`SkewClass`] per
/// reporting period.
#[derive(Debug, Default)]
pub struct SkewDetector {
    current: PeriodTotals,
    history: std::collections::VecDeque<PeriodTotals>,
    pending_kind: Option<u8>,
    pending_strikes: u32,
}

impl SkewDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one pump cycle's statistics into the in-progress period.
    pub fn accumulate(&mut self, stats: &CycleStats) {
        self.current.bottom_in += stats.bottom_in.process;
        self.current.bottom_out += stats.bottom_out.process;
        self.current.top_in += stats.top_in.process;
        self.current.top_out += stats.top_out.process;
        self.current.drops += stats.bottom_in.drop
            + stats.bottom_out.drop
            + stats.top_in.drop
            + stats.top_out.drop;
    }

    /// Closes the current period (called once per reporting interval,
    /// e.g. every second) and returns a classification if one clears
    /// both its threshold and the strike filter.
    pub fn end_period(&mut self) -> Option<SkewClass> {
        let totals = self.current;
        self.current = PeriodTotals::default();

        self.history.push_back(totals);
        while self.history.len() > WINDOW_PERIODS {
            self.history.pop_front();
        }

        if totals.drops > 0 {
            self.pending_kind = None;
            self.pending_strikes = 0;
            return Some(SkewClass::XRun(totals.drops));
        }

        let windowed = self.windowed_totals();
        let candidate = Self::classify(windowed)?;

        let tag = candidate.kind_tag();
        if self.pending_kind == Some(tag) {
            self.pending_strikes += 1;
        } else {
            self.pending_kind = Some(tag);
            self.pending_strikes = 1;
        }

        if self.pending_strikes >= STRIKE_THRESHOLD {
            Some(candidate)
        } else {
            None
        }
    }

    fn windowed_totals(&self) -> PeriodTotals {
        let mut totals = PeriodTotals::default();
        for p in &self.history {
            totals.bottom_in += p.bottom_in;
            totals.bottom_out += p.bottom_out;
            totals.top_in += p.top_in;
            totals.top_out += p.top_out;
            totals.drops += p.drops;
        }
        totals
    }

    fn classify(totals: PeriodTotals) -> Option<SkewClass> {
        let primary = skew_pct(totals.bottom_in, totals.bottom_out);
        let secondary = skew_pct(totals.top_in, totals.top_out);
        let endpoint = skew_pct(totals.bottom_in + totals.bottom_out, totals.top_in + totals.top_out);

        let mut candidates = Vec::new();
        if primary >= PRIMARY_DUPLEX_THRESHOLD_PCT {
            candidates.push(SkewClass::PrimaryDuplex(primary));
        }
        if secondary >= SECONDARY_DUPLEX_THRESHOLD_PCT {
            candidates.push(SkewClass::SecondaryDuplex(secondary));
        }
        if endpoint >= ENDPOINT_THRESHOLD_PCT {
            candidates.push(SkewClass::Endpoint(endpoint));
        }

        candidates.into_iter().max_by(|a, b| {
            let pct = |c: &SkewClass| match c {
                SkewClass::PrimaryDuplex(p) | SkewClass::SecondaryDuplex(p) | SkewClass::Endpoint(p) => *p,
                SkewClass::XRun(_) => 0.0,
            };
            pct(a).total_cmp(&pct(b))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pump::DirectionStats;

    fn stats_with(bottom_in: usize, bottom_out: usize, top_in: usize, top_out: usize, drop: usize) -> CycleStats {
        CycleStats {
            bottom_in: DirectionStats {
                process: bottom_in,
                ..Default::default()
            },
            bottom_out: DirectionStats {
                process: bottom_out,
                drop,
                ..Default::default()
            },
            top_in: DirectionStats {
                process: top_in,
                ..Default::default()
            },
            top_out: DirectionStats {
                process: top_out,
                ..Default::default()
            },
            ncopy: 0,
        }
    }

    #[test]
    fn xrun_reports_immediately_without_a_strike() {
        let mut detector = SkewDetector::new();
        detector.accumulate(&stats_with(100, 100, 100, 100, 5));
        assert_eq!(detector.end_period(), Some(SkewClass::XRun(5)));
    }

    #[test]
    fn small_primary_skew_needs_two_consecutive_periods() {
        let mut detector = SkewDetector::new();
        detector.accumulate(&stats_with(1000, 990, 500, 500, 0));
        assert_eq!(detector.end_period(), None);
        detector.accumulate(&stats_with(1000, 990, 500, 500, 0));
        assert!(matches!(detector.end_period(), Some(SkewClass::PrimaryDuplex(_))));
    }

    #[test]
    fn balanced_streams_report_nothing() {
        let mut detector = SkewDetector::new();
        for _ in 0..6 {
            detector.accumulate(&stats_with(1000, 1000, 500, 500, 0));
            assert_eq!(detector.end_period(), None);
        }
    }
}
