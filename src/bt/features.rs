//! Feature bitmaps, §6.3.
//!
//! Grounded in the teacher's `enumset`-based option sets (`bt/spp.rs`,
//! `bt/gap.rs` both represent small fixed option collections this way)
//! generalized from ESP32 driver flags to the HFP 1.5 §4.34 bit
//! assignments.

use enumset::{EnumSet, EnumSetType};

/// Local (Hands-Free) feature bits advertised in `AT+BRSF` and the SDP
/// record's `SupportedFeatures` attribute.
#[derive(Debug, EnumSetType)]
pub enum HfFeature {
    EchoCancellationNoiseReduction,
    CallWaitingOrThreeWay,
    CliPresentation,
    VoiceRecognition,
    RemoteVolumeControl,
}

impl HfFeature {
    fn bit(self) -> u32 {
        match self {
            HfFeature::EchoCancellationNoiseReduction => 1,
            HfFeature::CallWaitingOrThreeWay => 2,
            HfFeature::CliPresentation => 4,
            HfFeature::VoiceRecognition => 8,
            HfFeature::RemoteVolumeControl => 16,
        }
    }
}

/// Encodes a set of [`HfFeature`]s into the bitmap sent in `AT+BRSF=<n>`.
pub fn encode_hf_features(set: EnumSet<HfFeature>) -> u32 {
    set.iter().fold(0, |acc, f| acc | f.bit())
}

/// AG feature bits received in `+BRSF: <n>`.
#[derive(Debug, EnumSetType)]
pub enum AgFeature {
    ThreeWayCalling,
    EcNr,
    VoiceRecognition,
    InBandRingTone,
    AttachVoiceTag,
    RejectCall,
    EnhancedCallStatus,
    EnhancedCallControl,
    ExtendedErrorResult,
}

impl AgFeature {
    fn bit(self) -> u32 {
        match self {
            AgFeature::ThreeWayCalling => 1,
            AgFeature::EcNr => 2,
            AgFeature::VoiceRecognition => 4,
            AgFeature::InBandRingTone => 8,
            AgFeature::AttachVoiceTag => 16,
            AgFeature::RejectCall => 32,
            AgFeature::EnhancedCallStatus => 64,
            AgFeature::EnhancedCallControl => 128,
            AgFeature::ExtendedErrorResult => 256,
        }
    }
}

/// Decodes `+BRSF: <n>` into the set of [`AgFeature`]s it advertises.
pub fn decode_ag_features(bits: u32) -> EnumSet<AgFeature> {
    let mut set = EnumSet::new();
    for feature in EnumSet::<AgFeature>::all().iter() {
        if bits & feature.bit() != 0 {
            set.insert(feature);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_local_features_are_fifteen() {
        let set = HfFeature::EchoCancellationNoiseReduction
            | HfFeature::CallWaitingOrThreeWay
            | HfFeature::CliPresentation
            | HfFeature::VoiceRecognition;
        assert_eq!(encode_hf_features(set), 15);
    }

    #[test]
    fn decodes_three_way_and_in_band_ring() {
        let set = decode_ag_features(1 | 8);
        assert!(set.contains(AgFeature::ThreeWayCalling));
        assert!(set.contains(AgFeature::InBandRingTone));
        assert!(!set.contains(AgFeature::EcNr));
    }
}
