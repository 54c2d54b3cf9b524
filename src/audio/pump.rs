//! Streaming audio pump (component F), §4.7.
//!
//! Grounded in `libhfp/soundio-pump.cpp`'s `SoundIoPump`: a bidirectional
//! sample transport between a *bottom* (sound card) and *top* (SCO)
//! endpoint through a filter stack, with fill-level/jitter policy, loss
//! accounting and a watchdog. The original drives this from its own
//! event loop's `AsyncProcess`/`Watchdog` callbacks; here the same two
//! triggers become `tokio::select!` arms in [`Pump::run`], and the
//! per-cycle body ([`Pump::cycle`]) is exposed standalone so tests can
//! drive it deterministically without a runtime (§10.6, and §8 scenario
//! 5's constraint-solver test).

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::audio::filter::FilterStack;
use crate::audio::format::{Endpoint, EndpointProps, PcmFormat, QueueState, SilenceMask};
use crate::errors::{Error, Result, StreamError};

/// Optional tuning hints forwarded into configuration derivation,
/// §4.7 "Configuration derivation".
#[derive(Debug, Clone, Copy, Default)]
pub struct PumpHints {
    pub packet_interval_ms: Option<u32>,
    pub min_buffer_fill_ms: Option<u32>,
    pub jitter_window_ms: Option<u32>,
}

/// Per-endpoint derived bounds plus the shared filter packet size,
/// mirroring `SoundIoPump::SoundIoPumpConfig`.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub fmt: PcmFormat,
    pub filter_packet_samps: usize,
    pub bottom_out_min: usize,
    pub bottom_out_max: usize,
    pub bottom_in_max: usize,
    pub top_out_min: usize,
    pub top_out_max: usize,
    pub top_in_max: usize,
    pub watchdog_timeout: Duration,
    pub watchdog_strikes: u32,
    pub watchdog_min_progress: usize,
    pub watchdog_max_progress: usize,
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Derives a [`PumpConfig`] from both endpoints' properties/formats and
/// caller hints. See §4.7 for the derivation rules; per design note (c),
/// `filter_packet_samps`'s exact selection is left to the implementation
/// as long as it divides both endpoint packet sizes and stays within
/// half of the fill/jitter/out-buf bounds.
pub fn derive_config(
    bottom_props: EndpointProps,
    bottom_fmt: PcmFormat,
    top_props: EndpointProps,
    top_fmt: PcmFormat,
    hints: PumpHints,
) -> Result<PumpConfig> {
    if bottom_fmt.sample_rate != top_fmt.sample_rate {
        return Err(Error::Stream(StreamError::FormatMismatch));
    }
    if !bottom_props.has_clock && !top_props.has_clock {
        return Err(Error::Stream(StreamError::NoClock));
    }

    let clocked_packet_samps: Vec<usize> = [
        (bottom_props.has_clock, bottom_fmt.packet_samps),
        (top_props.has_clock, top_fmt.packet_samps),
    ]
    .into_iter()
    .filter(|(clocked, _)| *clocked)
    .map(|(_, samps)| samps)
    .collect();
    let fmt_packet_samps = clocked_packet_samps.into_iter().min().unwrap_or(1).max(1);

    let min_fill_samps = hints
        .min_buffer_fill_ms
        .map(|ms| bottom_fmt.ms_to_samples(ms))
        .unwrap_or(fmt_packet_samps * 2)
        .max(fmt_packet_samps);
    let jitter_samps = hints
        .jitter_window_ms
        .map(|ms| bottom_fmt.ms_to_samples(ms))
        .unwrap_or(fmt_packet_samps * 3)
        .max(fmt_packet_samps);

    let bound = (min_fill_samps / 2)
        .max(1)
        .min((jitter_samps / 2).max(1))
        .min(
            (bottom_fmt.packet_samps.max(1) / 2)
                .max(1)
                .min((top_fmt.packet_samps.max(1) / 2).max(1)),
        );

    let mut filter_packet_samps = gcd(bottom_fmt.packet_samps.max(1), top_fmt.packet_samps.max(1));
    while filter_packet_samps > 1 && filter_packet_samps > bound {
        if filter_packet_samps % 2 == 0 {
            filter_packet_samps /= 2;
        } else {
            break;
        }
    }
    filter_packet_samps = filter_packet_samps.max(1);

    let (bottom_out_min, bottom_out_max) =
        out_bounds(bottom_fmt.packet_samps, bottom_props.outbuf_size, hints);
    let (top_out_min, top_out_max) = out_bounds(top_fmt.packet_samps, top_props.outbuf_size, hints);
    let bottom_in_max = bottom_out_max.saturating_sub(bottom_out_min);
    let top_in_max = top_out_max.saturating_sub(top_out_min);

    let packet_ms = |samps: usize, rate: u32| -> u32 {
        ((samps as u64 * 1000) / rate.max(1) as u64) as u32
    };
    let mut watchdog_ms = 500u32;
    if bottom_props.has_clock {
        watchdog_ms = watchdog_ms.max(15 * packet_ms(bottom_fmt.packet_samps, bottom_fmt.sample_rate));
    }
    if top_props.has_clock {
        watchdog_ms = watchdog_ms.max(15 * packet_ms(top_fmt.packet_samps, top_fmt.sample_rate));
    }

    let nominal_samps = fmt_packet_samps;
    let watchdog_min_progress = nominal_samps / 4;
    let watchdog_max_progress = nominal_samps * 2;

    Ok(PumpConfig {
        fmt: PcmFormat {
            sample_rate: bottom_fmt.sample_rate,
            packet_samps: fmt_packet_samps,
            channels: bottom_fmt.channels,
            bytes_per_record: bottom_fmt.bytes_per_record,
        },
        filter_packet_samps,
        bottom_out_min,
        bottom_out_max,
        bottom_in_max,
        top_out_min,
        top_out_max,
        top_in_max,
        watchdog_timeout: Duration::from_millis(watchdog_ms as u64),
        watchdog_strikes: 2,
        watchdog_min_progress,
        watchdog_max_progress,
    })
}

fn out_bounds(packet_samps: usize, outbuf_size: usize, hints: PumpHints) -> (usize, usize) {
    let hinted_min = hints
        .min_buffer_fill_ms
        .map(|ms| (PcmFormat::SAMPLE_RATE_HZ as u64 * ms as u64 / 1000) as usize)
        .unwrap_or(0);
    let mut out_min = hinted_min.max(packet_samps);
    if outbuf_size > 0 {
        out_min = out_min.min(outbuf_size.saturating_sub(packet_samps));
    }

    let hinted_window = hints
        .jitter_window_ms
        .map(|ms| (PcmFormat::SAMPLE_RATE_HZ as u64 * ms as u64 / 1000) as usize)
        .unwrap_or(0);
    let mut out_max = out_min + hinted_window.max(3 * packet_samps);
    if outbuf_size > 0 {
        out_max = out_max.min(outbuf_size);
    }
    (out_min, out_max)
}

/// A pair of sample counters tracked per endpoint per cycle, used for
/// the §8 invariant `Σ in.process + in.pad + in.drop = Σ out.process +
/// out.pad + out.drop` and fed into the skew detector (component G).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub process: usize,
    pub pad: usize,
    pub drop: usize,
}

/// Everything the skew detector and watchdog need from one pump cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub bottom_in: DirectionStats,
    pub bottom_out: DirectionStats,
    pub top_in: DirectionStats,
    pub top_out: DirectionStats,
    pub ncopy: usize,
}

/// Outcome of one pump cycle.
#[derive(Debug, Clone, Copy)]
pub enum CycleOutcome {
    Ran(CycleStats),
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DataExhausted,
    WatchdogTimeout,
    EndpointRejectedSwap,
}

impl From<StopReason> for Error {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::DataExhausted => Error::Stream(StreamError::DataExhausted),
            StopReason::WatchdogTimeout => Error::Stream(StreamError::WatchdogTimeout),
            StopReason::EndpointRejectedSwap => Error::Stream(StreamError::BadPumpConfig(
                "endpoint rejected hot-swap configuration".to_string(),
            )),
        }
    }
}

struct EndpointState {
    endpoint: Box<dyn Endpoint>,
    props: EndpointProps,
    silence_in: SilenceMask,
    silence_out: SilenceMask,
    watchdog_in: usize,
    watchdog_out: usize,
    strikes: i32,
}

impl EndpointState {
    fn new(endpoint: Box<dyn Endpoint>) -> Self {
        let props = endpoint.props();
        Self {
            endpoint,
            props,
            silence_in: SilenceMask::default(),
            silence_out: SilenceMask::default(),
            watchdog_in: 0,
            watchdog_out: 0,
            strikes: 0,
        }
    }
}

/// One of the pump's two endpoint slots, paired with the notification
/// channel that drives it if it's clocked (asynchronous). Unclocked
/// (synchronous) endpoints pass `notify: None`; at least one side must
/// be clocked or [`derive_config`] rejects the pair with `NoClock`.
pub struct PumpEndpoint {
    pub endpoint: Box<dyn Endpoint>,
    pub notify: Option<mpsc::Receiver<()>>,
}

/// The streaming audio pump itself. Construct with [`Pump::new`], then
/// either call [`Pump::cycle`] directly (tests, §10.6) or spawn
/// [`Pump::run`] to drive it from endpoint notifications and the
/// watchdog timer.
pub struct Pump {
    bottom: EndpointState,
    top: EndpointState,
    bottom_notify: Option<mpsc::Receiver<()>>,
    top_notify: Option<mpsc::Receiver<()>>,
    filters: FilterStack,
    config: PumpConfig,
    entered: bool,
}

impl Pump {
    pub fn new(
        bottom: PumpEndpoint,
        top: PumpEndpoint,
        filters: FilterStack,
        hints: PumpHints,
    ) -> Result<Self> {
        let bottom_props = bottom.endpoint.props();
        let bottom_fmt = bottom.endpoint.format();
        let top_props = top.endpoint.props();
        let top_fmt = top.endpoint.format();

        let config = derive_config(bottom_props, bottom_fmt, top_props, top_fmt, hints)?;

        let mut filters = filters;
        if !filters.prepare(&config.fmt) {
            return Err(Error::Stream(StreamError::BadPumpConfig(
                "a filter stage rejected the negotiated packet format".to_string(),
            )));
        }

        Ok(Self {
            bottom: EndpointState::new(bottom.endpoint),
            top: EndpointState::new(top.endpoint),
            bottom_notify: bottom.notify,
            top_notify: top.notify,
            filters,
            config,
            entered: false,
        })
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// Replaces the bottom endpoint while running, preserving both
    /// silence-mask buffers across the swap to avoid an audible click
    /// (§4.7 "Endpoint hot-swap").
    pub fn swap_bottom(&mut self, replacement: Box<dyn Endpoint>) -> Result<()> {
        if !replacement.accepts_format(&self.config.fmt) {
            return Err(StopReason::EndpointRejectedSwap.into());
        }
        self.bottom.props = replacement.props();
        self.bottom.endpoint = replacement;
        Ok(())
    }

    pub fn swap_top(&mut self, replacement: Box<dyn Endpoint>) -> Result<()> {
        if !replacement.accepts_format(&self.config.fmt) {
            return Err(StopReason::EndpointRejectedSwap.into());
        }
        self.top.props = replacement.props();
        self.top.endpoint = replacement;
        Ok(())
    }

    /// Runs the pump until it stops, driven by whichever endpoint
    /// notifications arrive and the watchdog timer. Per §5, the pump
    /// does not reenter itself even if both endpoints signal at once —
    /// `tokio::select!`'s single-poll-at-a-time semantics combined with
    /// the `entered` guard in [`Pump::cycle`] enforce this.
    pub async fn run(self) -> StopReason {
        self.run_with(|_| {}).await
    }

    /// Like [`Pump::run`] but invokes `on_stats` with every completed
    /// cycle's [`CycleStats`], for callers (the `SoundIoManager`
    /// lifecycle, component G) that feed them into a [`crate::audio::skew::SkewDetector`].
    pub async fn run_with(mut self, mut on_stats: impl FnMut(CycleStats) + Send) -> StopReason {
        let mut watchdog = interval(self.config.watchdog_timeout);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let bottom_fired = wait_optional(&mut self.bottom_notify);
            let top_fired = wait_optional(&mut self.top_notify);

            tokio::select! {
                _ = bottom_fired => {}
                _ = top_fired => {}
                _ = watchdog.tick() => {
                    if let Some(reason) = self.check_watchdog() {
                        return reason;
                    }
                    continue;
                }
            }

            match self.cycle() {
                CycleOutcome::Stopped(reason) => return reason,
                CycleOutcome::Ran(stats) => on_stats(stats),
            }
        }
    }

    fn check_watchdog(&mut self) -> Option<StopReason> {
        let mut tripped = false;
        for (side, state) in [("bottom", &mut self.bottom), ("top", &mut self.top)] {
            if !state.props.has_clock {
                continue;
            }
            let bad = state.watchdog_in < self.config.watchdog_min_progress
                || state.watchdog_in > self.config.watchdog_max_progress
                || state.watchdog_out < self.config.watchdog_min_progress
                || state.watchdog_out > self.config.watchdog_max_progress;
            if bad {
                state.strikes += 1;
                warn!(
                    "{side} endpoint made {}in/{}out samples of progress this period (strike {})",
                    state.watchdog_in, state.watchdog_out, state.strikes
                );
                if state.strikes as u32 > self.config.watchdog_strikes {
                    tripped = true;
                }
            } else {
                state.strikes = 0;
            }
            state.watchdog_in = 0;
            state.watchdog_out = 0;
        }
        tripped.then_some(StopReason::WatchdogTimeout)
    }

    /// Runs one full pump cycle (§4.7 steps 1-6): sample queue states,
    /// solve for `ncopy`, pre-transfer trim, transfer through the filter
    /// chain, pad underfull sinks, then check for one-shot exhaustion.
    pub fn cycle(&mut self) -> CycleOutcome {
        debug_assert!(!self.entered, "pump reentered its own per-event routine");
        self.entered = true;
        let outcome = self.cycle_inner();
        self.entered = false;
        outcome
    }

    fn cycle_inner(&mut self) -> CycleOutcome {
        let fps = self.config.filter_packet_samps;
        let mut bottom_qs = self.bottom.endpoint.queue_state();
        let mut top_qs = self.top.endpoint.queue_state();

        let mut stats = CycleStats::default();

        // Step 3a: pre-transfer input trim (clocked sources only).
        if self.bottom.props.has_clock && bottom_qs.in_queued > self.config.bottom_in_max {
            let excess = bottom_qs.in_queued - self.config.bottom_in_max;
            let dropped = self.bottom.endpoint.drop_input(excess);
            stats.bottom_in.drop += dropped;
            bottom_qs.in_queued -= dropped;
        }
        if self.top.props.has_clock && top_qs.in_queued > self.config.top_in_max {
            let excess = top_qs.in_queued - self.config.top_in_max;
            let dropped = self.top.endpoint.drop_input(excess);
            stats.top_in.drop += dropped;
            top_qs.in_queued -= dropped;
        }

        // Step 2: solve for ncopy.
        let ncopy = solve_ncopy(&self.config, bottom_qs, top_qs, self.bottom.props, self.top.props);
        stats.ncopy = ncopy;

        // Step 3b: sink-side overrun trim of the transfer itself.
        let mut ncopy = ncopy;
        if self.top.props.does_sink && top_qs.out_queued + ncopy > self.config.top_out_max {
            let shortfall = (top_qs.out_queued + ncopy).saturating_sub(self.config.top_out_max);
            stats.top_out.drop += shortfall.min(ncopy);
            ncopy = ncopy.saturating_sub(shortfall);
        }
        if self.bottom.props.does_sink && bottom_qs.out_queued + ncopy > self.config.bottom_out_max {
            let shortfall = (bottom_qs.out_queued + ncopy).saturating_sub(self.config.bottom_out_max);
            stats.bottom_out.drop += shortfall.min(ncopy);
            ncopy = ncopy.saturating_sub(shortfall);
        }

        // Step 4: transfer, one filter packet at a time.
        let npackets = ncopy / fps.max(1);
        let mut src = vec![0i16; fps];
        let mut scratch = vec![0i16; fps];

        for _ in 0..npackets {
            if self.top.props.does_sink && self.bottom.props.does_source {
                let got = self.bottom.endpoint.read_input(&mut src[..fps]);
                if got < fps {
                    stats.bottom_in.pad += fps - got;
                    self.bottom.silence_in.fill(&mut src[got..fps]);
                } else {
                    self.bottom.silence_in.observe(&src[..fps]);
                }
                stats.bottom_in.process += got;

                self.filters.process_down(&mut src[..fps], &mut scratch[..fps]);

                let accepted = self.top.endpoint.write_output(&src[..fps]);
                stats.top_out.process += accepted;
                if accepted < fps {
                    stats.top_out.drop += fps - accepted;
                }
                self.top.silence_out.observe(&src[..fps]);
            }

            if self.bottom.props.does_sink && self.top.props.does_source {
                let got = self.top.endpoint.read_input(&mut src[..fps]);
                if got < fps {
                    stats.top_in.pad += fps - got;
                    self.top.silence_in.fill(&mut src[got..fps]);
                } else {
                    self.top.silence_in.observe(&src[..fps]);
                }
                stats.top_in.process += got;

                self.filters.process_up(&mut src[..fps], &mut scratch[..fps]);

                let accepted = self.bottom.endpoint.write_output(&src[..fps]);
                stats.bottom_out.process += accepted;
                if accepted < fps {
                    stats.bottom_out.drop += fps - accepted;
                }
                self.bottom.silence_out.observe(&src[..fps]);
            }
        }

        // Step 5: silence padding for sinks left below out_min.
        let bottom_qs_after = self.bottom.endpoint.queue_state();
        let top_qs_after = self.top.endpoint.queue_state();

        if self.top.props.does_sink
            && top_qs_after.out_queued < self.config.top_out_min
            && !self.bottom.props.remove_on_exhaust
        {
            let need = self.config.top_out_min - top_qs_after.out_queued;
            let mut pad = vec![0i16; need];
            self.top.silence_out.fill(&mut pad);
            let accepted = self.top.endpoint.write_output(&pad);
            stats.top_out.pad += accepted;
        }
        if self.bottom.props.does_sink
            && bottom_qs_after.out_queued < self.config.bottom_out_min
            && !self.top.props.remove_on_exhaust
        {
            let need = self.config.bottom_out_min - bottom_qs_after.out_queued;
            let mut pad = vec![0i16; need];
            self.bottom.silence_out.fill(&mut pad);
            let accepted = self.bottom.endpoint.write_output(&pad);
            stats.bottom_out.pad += accepted;
        }

        // Watchdog accounting.
        self.bottom.watchdog_in += stats.bottom_in.process;
        self.bottom.watchdog_out += stats.bottom_out.process;
        self.top.watchdog_in += stats.top_in.process;
        self.top.watchdog_out += stats.top_out.process;

        // Step 6: remove-on-exhaust termination.
        if self.exhausted(&self.bottom, bottom_qs_after) || self.exhausted(&self.top, top_qs_after) {
            debug!("pump stopping: one-shot endpoint exhausted");
            return CycleOutcome::Stopped(StopReason::DataExhausted);
        }

        CycleOutcome::Ran(stats)
    }

    fn exhausted(&self, state: &EndpointState, qs: QueueState) -> bool {
        state.props.remove_on_exhaust && qs.in_queued == 0 && qs.out_queued == 0
    }
}

async fn wait_optional(rx: &mut Option<mpsc::Receiver<()>>) {
    match rx {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Constraint used by [`solve_ncopy`]; `tier` 1 is higher priority than
/// tier 2 (flipped by loss tolerance, §4.7 step 2).
struct Constraint {
    target: usize,
    tier: u8,
    order: u8,
    under_cost: i64,
    over_cost: i64,
}

fn cost(ncopy: usize, c: &Constraint) -> i64 {
    if ncopy < c.target {
        (c.target - ncopy) as i64 * c.under_cost
    } else {
        (ncopy - c.target) as i64 * c.over_cost
    }
}

fn round_down(n: usize, fps: usize) -> usize {
    (n / fps.max(1)) * fps.max(1)
}

fn round_up(n: usize, fps: usize) -> usize {
    let fps = fps.max(1);
    n.div_ceil(fps) * fps
}

/// Solves for `ncopy`, the number of samples to exchange this cycle, by
/// minimizing a lexicographically tiered piecewise-linear cost across
/// the four constraints of §4.7 step 2. Per design note (c) the exact
/// selection isn't unique; this implementation satisfies the ordering
/// and tie-breaking the spec states.
fn solve_ncopy(
    config: &PumpConfig,
    bottom_qs: QueueState,
    top_qs: QueueState,
    bottom_props: EndpointProps,
    top_props: EndpointProps,
) -> usize {
    let fps = config.filter_packet_samps.max(1);

    let tier_of = |loss_tolerant: bool| if loss_tolerant { 2 } else { 1 };

    let bottom_drain_target = if bottom_props.has_clock && bottom_props.does_source {
        round_down(bottom_qs.in_queued, fps)
    } else {
        0
    };
    let top_fill_target = if top_props.does_sink {
        round_up(
            config.top_out_min.saturating_sub(top_qs.out_queued),
            fps,
        )
    } else {
        0
    };
    let top_drain_target = if top_props.has_clock && top_props.does_source {
        round_down(top_qs.in_queued, fps)
    } else {
        0
    };
    let bottom_fill_target = if bottom_props.does_sink {
        round_up(
            config.bottom_out_min.saturating_sub(bottom_qs.out_queued),
            fps,
        )
    } else {
        0
    };

    let constraints = [
        Constraint {
            target: bottom_drain_target,
            tier: tier_of(bottom_props.remove_on_exhaust),
            order: 0,
            under_cost: 100,
            over_cost: 1,
        },
        Constraint {
            target: top_fill_target,
            tier: tier_of(top_props.remove_on_exhaust),
            order: 1,
            under_cost: 100,
            over_cost: 1,
        },
        Constraint {
            target: top_drain_target,
            tier: tier_of(top_props.remove_on_exhaust),
            order: 2,
            under_cost: 100,
            over_cost: 1,
        },
        Constraint {
            target: bottom_fill_target,
            tier: tier_of(bottom_props.remove_on_exhaust),
            order: 3,
            under_cost: 100,
            over_cost: 1,
        },
    ];

    let mut order: Vec<usize> = (0..constraints.len()).collect();
    order.sort_by_key(|&i| (constraints[i].tier, constraints[i].order));

    let max_target = constraints.iter().map(|c| c.target).max().unwrap_or(0);
    let candidate_max = round_up(max_target, fps) + fps;
    let candidate_cap = candidate_max.min(fps * 256).max(fps);

    let mut best_ncopy = 0usize;
    let mut best_key: Option<Vec<i64>> = None;

    let mut candidate = 0usize;
    while candidate <= candidate_cap {
        let key: Vec<i64> = order.iter().map(|&i| cost(candidate, &constraints[i])).collect();
        if best_key.as_ref().is_none_or(|best| key < *best) {
            best_key = Some(key);
            best_ncopy = candidate;
        }
        candidate += fps;
    }

    best_ncopy
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct TestEndpoint {
        props: EndpointProps,
        fmt: PcmFormat,
        input: VecDeque<i16>,
        output: VecDeque<i16>,
    }

    impl TestEndpoint {
        fn clocked_duplex(packet_samps: usize) -> Self {
            Self {
                props: EndpointProps {
                    has_clock: true,
                    does_source: true,
                    does_sink: true,
                    does_loop: false,
                    remove_on_exhaust: false,
                    outbuf_size: packet_samps * 8,
                },
                fmt: PcmFormat::mono_s16le(packet_samps),
                input: VecDeque::new(),
                output: VecDeque::new(),
            }
        }

        fn push_input(&mut self, n: usize) {
            for i in 0..n {
                self.input.push_back(i as i16);
            }
        }
    }

    impl Endpoint for TestEndpoint {
        fn props(&self) -> EndpointProps {
            self.props
        }
        fn format(&self) -> PcmFormat {
            self.fmt
        }
        fn queue_state(&self) -> QueueState {
            QueueState {
                in_queued: self.input.len(),
                out_queued: self.output.len(),
            }
        }
        fn read_input(&mut self, out: &mut [i16]) -> usize {
            let mut n = 0;
            while n < out.len() {
                match self.input.pop_front() {
                    Some(s) => {
                        out[n] = s;
                        n += 1;
                    }
                    None => break,
                }
            }
            n
        }
        fn drop_input(&mut self, n: usize) -> usize {
            let drop = n.min(self.input.len());
            for _ in 0..drop {
                self.input.pop_front();
            }
            drop
        }
        fn write_output(&mut self, data: &[i16]) -> usize {
            self.output.extend(data.iter().copied());
            data.len()
        }
        fn trim_output(&mut self, n: usize) -> usize {
            let drop = n.min(self.output.len());
            for _ in 0..drop {
                self.output.pop_back();
            }
            drop
        }
    }

    #[test]
    fn derives_config_with_fps_dividing_both_packet_sizes() {
        let bottom_props = EndpointProps {
            has_clock: true,
            does_source: true,
            does_sink: true,
            does_loop: false,
            remove_on_exhaust: false,
            outbuf_size: 1024,
        };
        let bottom_fmt = PcmFormat::mono_s16le(128);
        let top_props = bottom_props;
        let top_fmt = PcmFormat::mono_s16le(48);

        let config = derive_config(bottom_props, bottom_fmt, top_props, top_fmt, PumpHints::default())
            .unwrap();
        assert_eq!(128 % config.filter_packet_samps, 0);
        assert_eq!(48 % config.filter_packet_samps, 0);
    }

    #[test]
    fn rejects_two_unclocked_endpoints() {
        let props = EndpointProps {
            has_clock: false,
            does_source: true,
            does_sink: true,
            does_loop: false,
            remove_on_exhaust: false,
            outbuf_size: 0,
        };
        let fmt = PcmFormat::mono_s16le(64);
        let err = derive_config(props, fmt, props, fmt, PumpHints::default()).unwrap_err();
        assert!(matches!(err, Error::Stream(StreamError::NoClock)));
    }

    #[test]
    fn loss_mode_constraint_solver_picks_nearest_multiple_draining_bottom() {
        // §8 scenario 5: bottom packet=128, top packet=48, filter
        // packet=16, bottom in_queued=130, top out_queued=out_min-32.
        let config = PumpConfig {
            fmt: PcmFormat::mono_s16le(16),
            filter_packet_samps: 16,
            bottom_out_min: 256,
            bottom_out_max: 512,
            bottom_in_max: 256,
            top_out_min: 96,
            top_out_max: 192,
            top_in_max: 96,
            watchdog_timeout: Duration::from_millis(500),
            watchdog_strikes: 2,
            watchdog_min_progress: 4,
            watchdog_max_progress: 64,
        };
        let bottom_qs = QueueState {
            in_queued: 130,
            out_queued: 300,
        };
        let top_qs = QueueState {
            in_queued: 0,
            out_queued: config.top_out_min - 32,
        };
        let props = EndpointProps {
            has_clock: true,
            does_source: true,
            does_sink: true,
            does_loop: false,
            remove_on_exhaust: false,
            outbuf_size: 512,
        };

        let ncopy = solve_ncopy(&config, bottom_qs, top_qs, props, props);
        assert_eq!(ncopy, 128);
    }

    #[test]
    fn cycle_drains_bottom_input_through_pass_through_filter_into_top_output() {
        let mut bottom = TestEndpoint::clocked_duplex(16);
        bottom.push_input(64);
        let top = TestEndpoint::clocked_duplex(16);

        let mut pump = Pump::new(
            PumpEndpoint {
                endpoint: Box::new(bottom),
                notify: None,
            },
            PumpEndpoint {
                endpoint: Box::new(top),
                notify: None,
            },
            FilterStack::new(),
            PumpHints::default(),
        )
        .unwrap();

        match pump.cycle() {
            CycleOutcome::Ran(stats) => {
                assert!(stats.bottom_in.process > 0);
                assert!(stats.top_out.process > 0);
            }
            CycleOutcome::Stopped(reason) => panic!("unexpected stop: {reason:?}"),
        }
    }

    #[test]
    fn one_shot_endpoint_exhaustion_stops_the_pump() {
        let bottom = TestEndpoint {
            props: EndpointProps {
                has_clock: true,
                does_source: true,
                does_sink: false,
                does_loop: false,
                remove_on_exhaust: true,
                outbuf_size: 0,
            },
            fmt: PcmFormat::mono_s16le(16),
            input: VecDeque::new(),
            output: VecDeque::new(),
        };
        let top = TestEndpoint::clocked_duplex(16);

        let mut pump = Pump::new(
            PumpEndpoint {
                endpoint: Box::new(bottom),
                notify: None,
            },
            PumpEndpoint {
                endpoint: Box::new(top),
                notify: None,
            },
            FilterStack::new(),
            PumpHints::default(),
        )
        .unwrap();

        match pump.cycle() {
            CycleOutcome::Stopped(StopReason::DataExhausted) => {}
            other => panic!("expected DataExhausted, got {other:?}"),
        }
    }
}
