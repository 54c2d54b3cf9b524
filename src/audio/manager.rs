//! `SoundIoManager` lifecycle glue (component G): driver selection,
//! hard/soft mute, DSP filter placement and skew reporting, §4.8.
//!
//! Grounded in `include/libhfp/soundio.h`'s driver factory functions
//! (`SoundIoFsSource`/`SoundIoFsSink`/`SoundIoLoop`/`SoundIoNull`/
//! `SoundIoMembuf`/ALSA and OSS sound-card constructors) collapsed, per
//! §9's design notes, into the tagged [`SoundDriver`] variant rather
//! than a virtual base class, since the set of concrete drivers is
//! closed.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::task::JoinHandle;

use crate::audio::filter::{Filter, FilterDirections, FilterStack};
use crate::audio::format::PcmFormat;
use crate::audio::pump::{Pump, PumpEndpoint, PumpHints, StopReason};
use crate::audio::skew::{SkewClass, SkewDetector};

/// Which concrete backend is driving the bottom (non-SCO) side of the
/// pump. The SCO side is always [`crate::bt::sco::ScoEndpoint`]; this
/// enum covers what `SoundIoManager` can plug in opposite it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoundDriver {
    /// The live SCO link itself, for loopback/test configurations that
    /// pump SCO against SCO.
    Sco,
    /// Reads a raw PCM file and feeds it in as a one-shot source.
    FileSource(String),
    /// Writes received PCM out to a raw file sink.
    FileSink(String),
    /// Feeds whatever it receives straight back out (local loopback).
    Loop,
    /// Discards everything; useful for a session with no local audio.
    Null,
    /// An in-memory ring buffer, for tests and demos (`MemBuf`).
    MemBuf,
    /// A real ALSA sound card device, named by its ALSA PCM device
    /// string (e.g. `"default"`, `"hw:0,0"`).
    SoundCardAlsa(String),
    /// A real OSS sound card device, named by its device node
    /// (e.g. `"/dev/dsp"`).
    SoundCardOss(String),
}

/// Shared numerator (denominator fixed at 256) for a soft-mute gain
/// stage, so the filter can be adjusted live without tearing down the
/// pump's filter chain.
#[derive(Debug, Clone)]
pub struct MuteControl {
    numerator: Arc<AtomicI32>,
}

const MUTE_DENOMINATOR: i32 = 256;

impl MuteControl {
    fn new() -> Self {
        Self {
            numerator: Arc::new(AtomicI32::new(MUTE_DENOMINATOR)),
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.numerator
            .store(if muted { 0 } else { MUTE_DENOMINATOR }, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.numerator.load(Ordering::Relaxed) == 0
    }
}

struct SharedGainFilter {
    numerator: Arc<AtomicI32>,
}

impl Filter for SharedGainFilter {
    fn directions(&self) -> FilterDirections {
        FilterDirections::BOTH
    }

    fn prepare(&mut self, _fmt: &PcmFormat) -> bool {
        true
    }

    fn process(&mut self, _up: bool, src: &mut [i16], _scratch: &mut [i16]) -> bool {
        let numerator = self.numerator.load(Ordering::Relaxed);
        if numerator != MUTE_DENOMINATOR {
            for sample in src.iter_mut() {
                *sample = ((*sample as i32 * numerator) / MUTE_DENOMINATOR) as i16;
            }
        }
        false
    }
}

/// Builds a soft-mute filter stage plus the handle used to drive it
/// live, for placement at the bottom of the pump's [`FilterStack`].
pub fn soft_mute_filter() -> (Box<dyn Filter>, MuteControl) {
    let control = MuteControl::new();
    (
        Box::new(SharedGainFilter {
            numerator: control.numerator.clone(),
        }),
        control,
    )
}

/// Owns one session's local-audio pump: driver selection, hard/soft
/// mute and skew reporting. Hard mute tears the pump down entirely
/// (what the original calls "unplugging" the endpoint); soft mute
/// leaves it running with a zero-gain filter stage so fill levels and
/// watchdog accounting stay warm across a brief mute.
pub struct SoundIoManager {
    driver: SoundDriver,
    mute: MuteControl,
    hard_muted: bool,
    pump: Option<JoinHandle<StopReason>>,
}

impl SoundIoManager {
    pub fn new(driver: SoundDriver) -> Self {
        let (_, mute) = soft_mute_filter();
        Self {
            driver,
            mute,
            hard_muted: false,
            pump: None,
        }
    }

    pub fn driver(&self) -> &SoundDriver {
        &self.driver
    }

    pub fn set_soft_mute(&self, muted: bool) {
        self.mute.set_muted(muted);
    }

    pub fn is_soft_muted(&self) -> bool {
        self.mute.is_muted()
    }

    pub fn is_hard_muted(&self) -> bool {
        self.hard_muted
    }

    /// Tears the running pump down (if any) and marks the local audio
    /// path hard-muted until [`SoundIoManager::start`] is called again.
    pub fn hard_mute(&mut self) {
        self.hard_muted = true;
        self.stop();
    }

    pub fn hard_unmute(&mut self) {
        self.hard_muted = false;
    }

    /// Starts the pump between `bottom` and the SCO `top` endpoint,
    /// with the manager's soft-mute filter installed at the bottom of
    /// the chain and `extra_filters` above it. Returns the mute handle
    /// so callers can place it before other DSP stages (the manager
    /// keeps its own copy too). Skew classifications are logged as they
    /// clear the detector's strike filter; component G only specifies
    /// that they be surfaced, not to whom.
    pub fn start(
        &mut self,
        bottom: PumpEndpoint,
        top: PumpEndpoint,
        extra_filters: Vec<Box<dyn Filter>>,
        hints: PumpHints,
    ) -> Result<(), crate::errors::Error> {
        if self.hard_muted {
            warn!("refusing to start pump while hard-muted");
            return Ok(());
        }
        self.stop();

        let (mute_filter, control) = soft_mute_filter();
        control.set_muted(self.mute.is_muted());
        self.mute = control;

        let mut stack = FilterStack::new();
        stack.push_bottom(mute_filter);
        for filter in extra_filters {
            stack.push_top(filter);
        }

        let pump = Pump::new(bottom, top, stack, hints)?;
        let (stats_tx, mut stats_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut pump_task = tokio::spawn(pump.run_with(move |stats| {
            let _ = stats_tx.send(stats);
        }));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            let mut skew = SkewDetector::new();
            loop {
                tokio::select! {
                    stats = stats_rx.recv() => {
                        if let Some(stats) = stats {
                            skew.accumulate(&stats);
                        }
                    }
                    _ = ticker.tick() => {
                        match skew.end_period() {
                            Some(SkewClass::XRun(n)) => warn!("audio xrun: {n} samples"),
                            Some(class) => info!("audio skew detected: {class:?}"),
                            None => {}
                        }
                    }
                    result = &mut pump_task => {
                        return result.unwrap_or(StopReason::DataExhausted);
                    }
                }
            }
        });
        self.pump = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.pump.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SoundIoManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_control_toggles_gain() {
        let (_, control) = soft_mute_filter();
        assert!(!control.is_muted());
        control.set_muted(true);
        assert!(control.is_muted());
    }

    #[test]
    fn hard_mute_clears_any_running_pump_handle() {
        let mut manager = SoundIoManager::new(SoundDriver::Null);
        assert!(!manager.is_hard_muted());
        manager.hard_mute();
        assert!(manager.is_hard_muted());
        assert!(!manager.is_running());
    }
}
