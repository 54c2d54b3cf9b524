//! PCM endpoint interface shared by the pump (component F) and both of
//! its endpoints, §3 "SCO Endpoint"/"Pump Working State" and §4.7.
//!
//! Grounded in `include/libhfp/soundio.h`'s `SoundIo`/`SoundIoFormat`/
//! `SoundIoProps`/`SoundIoQueueState` quartet: the original is a single
//! abstract base class with `SndGetIBuf`/`SndDequeueIBuf`/`SndGetOBuf`/
//! `SndQueueOBuf`-style buffer-lease methods. §9's design notes collapse
//! virtual-method polymorphism into "a small tagged variant" for the
//! concrete drivers, but the interface itself survives as a trait since
//! its implementers (the SCO socket, a sound card, a test double) are
//! genuinely open-ended.

/// Fixed PCM format for this crate: 8 kHz, mono, S16LE (§1 Non-goals
/// excludes other codecs/resampling). `packet_samps` and
/// `bytes_per_record` still vary per endpoint (SCO's depends on the
/// negotiated MTU, §4.6), so the struct carries them rather than hiding
/// them behind a global constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub packet_samps: usize,
    pub channels: u8,
    pub bytes_per_record: u8,
}

impl PcmFormat {
    pub const SAMPLE_RATE_HZ: u32 = 8_000;

    pub fn mono_s16le(packet_samps: usize) -> Self {
        Self {
            sample_rate: Self::SAMPLE_RATE_HZ,
            packet_samps,
            channels: 1,
            bytes_per_record: 2,
        }
    }

    /// Converts a millisecond duration to a sample count at this format's
    /// rate, rounding down.
    pub fn ms_to_samples(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize
    }
}

/// Basic properties of an endpoint, mirroring `SoundIoProps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointProps {
    /// Capable of generating packet notifications (asynchronous/clocked).
    pub has_clock: bool,
    /// Can provide sample data (acts as a source).
    pub does_source: bool,
    /// Can consume sample data (acts as a sink).
    pub does_sink: bool,
    /// Output is directly tied to input (a loopback endpoint).
    pub does_loop: bool,
    /// Should be removed from the pump once transfers start failing,
    /// i.e. a one-shot endpoint (§4.7 step 6, `DataExhausted`).
    pub remove_on_exhaust: bool,
    /// Output buffer capacity in samples; 0 means unbounded.
    pub outbuf_size: usize,
}

/// Collective queue depth of one endpoint, mirroring `SoundIoQueueState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueState {
    pub in_queued: usize,
    pub out_queued: usize,
}

/// A PCM source/sink the pump can move samples through.
///
/// Implemented by [`crate::bt::sco::ScoEndpoint`] for the voice channel
/// and by whichever local sound-card/test driver the `SoundIoManager`
/// (component G) selects for the other side. All methods are
/// synchronous; the *notification* that a new packet is ready lives
/// outside this trait (see [`crate::audio::pump::PumpEndpoint`]) so the
/// trait itself stays object-safe and test doubles don't need an async
/// runtime to implement it.
pub trait Endpoint: Send {
    fn props(&self) -> EndpointProps;
    fn format(&self) -> PcmFormat;
    fn queue_state(&self) -> QueueState;

    /// Pulls up to `out.len()` samples from the input queue into `out`,
    /// returning the number actually written. Returning fewer than
    /// requested is not an error; the pump accounts the shortfall as
    /// `in.pad` (§4.7 step 5).
    fn read_input(&mut self, out: &mut [i16]) -> usize;

    /// Drops up to `n` queued input samples without delivering them
    /// (the overrun trim of §4.7 step 3); returns the number actually
    /// dropped.
    fn drop_input(&mut self, n: usize) -> usize;

    /// Accepts up to `data.len()` samples into the output queue,
    /// returning the number actually accepted.
    fn write_output(&mut self, data: &[i16]) -> usize;

    /// Removes up to `n` already-queued output samples (the overrun
    /// trim on the sink side of §4.7 step 3); returns the number
    /// actually removed.
    fn trim_output(&mut self, n: usize) -> usize;

    /// Accepts a hot-swap into the given running configuration; `false`
    /// means the pump must stop (§4.7 "Endpoint hot-swap").
    fn accepts_format(&self, fmt: &PcmFormat) -> bool {
        self.format() == *fmt
    }
}

/// One-sample silence pattern used to mask underrun, replicating the
/// last observed sample of the stream rather than hard zero (§3 "Pump
/// Working State").
#[derive(Debug, Clone, Copy, Default)]
pub struct SilenceMask {
    last: i16,
}

impl SilenceMask {
    pub fn observe(&mut self, samples: &[i16]) {
        if let Some(&last) = samples.last() {
            self.last = last;
        }
    }

    pub fn fill(&self, buf: &mut [i16]) {
        buf.fill(self.last);
    }

    pub fn sample(&self) -> i16 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_mask_replicates_last_observed_sample() {
        let mut mask = SilenceMask::default();
        mask.observe(&[1, 2, 3]);
        let mut buf = [0i16; 4];
        mask.fill(&mut buf);
        assert_eq!(buf, [3, 3, 3, 3]);
    }

    #[test]
    fn ms_to_samples_at_8khz() {
        let fmt = PcmFormat::mono_s16le(48);
        assert_eq!(fmt.ms_to_samples(20), 160);
        assert_eq!(fmt.ms_to_samples(1), 8);
    }
}
