//! Filter stack, §3 "Filter Stack"/§4.7 step 4.
//!
//! Grounded in `SoundIoFilter`/`SoundIoPump::AddTop`/`AddBottom` (a
//! doubly-linked chain with an explicit top and bottom, each filter
//! advertising up-flow/down-flow interest and being prepared with the
//! negotiated PCM format before streaming starts). The Speex DSP binding
//! itself (echo cancellation/noise reduction/AGC) is an explicit
//! out-of-scope external collaborator per §1; what's in scope is the
//! chain abstraction filters plug into. Per §9's design notes, "Filters
//! follow the same [tagged-variant] pattern with a trait/interface
//! because their composition is user-supplied" — so this stays a
//! `Box<dyn Filter>` chain rather than a fixed enum.

use crate::audio::format::PcmFormat;

/// Which directions a filter wants to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDirections {
    pub down: bool,
    pub up: bool,
}

impl FilterDirections {
    pub const BOTH: Self = Self {
        down: true,
        up: true,
    };
    pub const DOWN_ONLY: Self = Self {
        down: true,
        up: false,
    };
    pub const UP_ONLY: Self = Self {
        down: false,
        up: true,
    };
}

/// A single stage in the filter chain. `process` receives the packet in
/// `src` and a `scratch` buffer of equal size to write into if it needs
/// to transform rather than mutate in place; it returns which of the two
/// it wrote the result to, mirroring `SoundIoFilter::FltProcess`'s
/// "filters receive two borrowed buffers... and return whichever they
/// wrote to" (§4.7 step 4).
pub trait Filter: Send {
    fn directions(&self) -> FilterDirections;

    /// Called once before streaming starts with the negotiated
    /// `filter_packet_samps` format; filters that can't operate at this
    /// packet size should return `false` to fail pump configuration
    /// (`BadPumpConfig`).
    fn prepare(&mut self, fmt: &PcmFormat) -> bool;

    /// Processes one packet flowing down (top toward bottom) or up
    /// (bottom toward top) per `up`. Returns `true` if the result ended
    /// up in `scratch` instead of `src` (mutated in place).
    fn process(&mut self, up: bool, src: &mut [i16], scratch: &mut [i16]) -> bool;
}

/// Identity filter; used as the default bottom-of-stack stage and in
/// tests. Stands in for the out-of-scope Speex binding's position in
/// the chain.
#[derive(Debug, Default)]
pub struct PassThrough;

impl Filter for PassThrough {
    fn directions(&self) -> FilterDirections {
        FilterDirections::BOTH
    }

    fn prepare(&mut self, _fmt: &PcmFormat) -> bool {
        true
    }

    fn process(&mut self, _up: bool, _src: &mut [i16], _scratch: &mut [i16]) -> bool {
        false
    }
}

/// Simple fixed-point gain filter, useful for the mute (soft) feature of
/// the `SoundIoManager` (component G) and as a non-trivial test filter.
#[derive(Debug, Clone, Copy)]
pub struct Gain {
    pub numerator: i32,
    pub denominator: i32,
}

impl Gain {
    pub fn unity() -> Self {
        Self {
            numerator: 1,
            denominator: 1,
        }
    }

    pub fn muted() -> Self {
        Self {
            numerator: 0,
            denominator: 1,
        }
    }
}

impl Filter for Gain {
    fn directions(&self) -> FilterDirections {
        FilterDirections::BOTH
    }

    fn prepare(&mut self, _fmt: &PcmFormat) -> bool {
        true
    }

    fn process(&mut self, _up: bool, src: &mut [i16], _scratch: &mut [i16]) -> bool {
        if self.numerator != self.denominator {
            for sample in src.iter_mut() {
                *sample = ((*sample as i32 * self.numerator) / self.denominator) as i16;
            }
        }
        false
    }
}

/// The chain between bottom and top, ordered bottom-to-top in storage
/// (index 0 is nearest the bottom endpoint) so `process_down` and
/// `process_up` simply walk it in opposite directions.
#[derive(Default)]
pub struct FilterStack {
    stages: Vec<Box<dyn Filter>>,
}

impl FilterStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bottom(&mut self, filter: Box<dyn Filter>) {
        self.stages.insert(0, filter);
    }

    pub fn push_top(&mut self, filter: Box<dyn Filter>) {
        self.stages.push(filter);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Prepares every stage with the negotiated filter-packet format;
    /// `false` if any stage rejects it.
    pub fn prepare(&mut self, fmt: &PcmFormat) -> bool {
        self.stages.iter_mut().all(|stage| stage.prepare(fmt))
    }

    /// Runs one packet top-to-bottom (pumping down) through every stage
    /// interested in the down direction, in bottom-up storage order
    /// reversed (i.e. from the top stage down to the bottom stage).
    pub fn process_down(&mut self, src: &mut [i16], scratch: &mut [i16]) {
        self.process(false, src, scratch);
    }

    /// Runs one packet bottom-to-top (pumping up).
    pub fn process_up(&mut self, src: &mut [i16], scratch: &mut [i16]) {
        self.process(true, src, scratch);
    }

    fn process(&mut self, up: bool, src: &mut [i16], scratch: &mut [i16]) {
        let indices: Box<dyn Iterator<Item = usize>> = if up {
            Box::new(0..self.stages.len())
        } else {
            Box::new((0..self.stages.len()).rev())
        };

        let mut in_scratch = false;
        for i in indices {
            let stage = &mut self.stages[i];
            if !stage.directions().up && up {
                continue;
            }
            if !stage.directions().down && !up {
                continue;
            }
            let wrote_scratch = if in_scratch {
                stage.process(up, scratch, src)
            } else {
                stage.process(up, src, scratch)
            };
            in_scratch ^= wrote_scratch;
        }

        if in_scratch {
            src.copy_from_slice(scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_leaves_samples_untouched() {
        let mut stack = FilterStack::new();
        stack.push_bottom(Box::new(PassThrough));
        stack.push_top(Box::new(PassThrough));
        assert!(stack.prepare(&PcmFormat::mono_s16le(16)));

        let mut src = [1i16, 2, 3, 4];
        let mut scratch = [0i16; 4];
        stack.process_down(&mut src, &mut scratch);
        assert_eq!(src, [1, 2, 3, 4]);
    }

    #[test]
    fn mute_gain_zeroes_samples_in_both_directions() {
        let mut stack = FilterStack::new();
        stack.push_bottom(Box::new(Gain::muted()));
        assert!(stack.prepare(&PcmFormat::mono_s16le(16)));

        let mut src = [10i16, -10, 20, -20];
        let mut scratch = [0i16; 4];
        stack.process_down(&mut src, &mut scratch);
        assert_eq!(src, [0, 0, 0, 0]);

        let mut src = [10i16, -10, 20, -20];
        stack.process_up(&mut src, &mut scratch);
        assert_eq!(src, [0, 0, 0, 0]);
    }

    #[test]
    fn half_gain_scales_samples() {
        let mut stack = FilterStack::new();
        stack.push_bottom(Box::new(Gain {
            numerator: 1,
            denominator: 2,
        }));
        stack.prepare(&PcmFormat::mono_s16le(16));

        let mut src = [100i16, -100, 4, -4];
        let mut scratch = [0i16; 4];
        stack.process_down(&mut src, &mut scratch);
        assert_eq!(src, [50, -50, 2, -2]);
    }
}
