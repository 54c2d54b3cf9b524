//! SDP record shape for the Hands-Free role, §6.2.
//!
//! Only the attribute set is specified; record registration and lookup
//! are external collaborators (the D-Bus/BlueZ SDP daemon in a real
//! deployment). This module gives the attribute set a typed shape so the
//! RFCOMM substrate can construct and, on the client side, interpret it.

/// The two well-known service class UUIDs carried in
/// `ServiceClassIDList`.
pub const HANDSFREE_SERVICE_CLASS: u16 = 0x111e;
pub const GENERIC_AUDIO_SERVICE_CLASS: u16 = 0x1203;

/// `BluetoothProfileDescriptorList` version for HFP 1.5.
pub const HFP_PROFILE_VERSION: (u8, u8) = (1, 5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandsFreeSdpRecord {
    pub service_class_ids: Vec<u16>,
    pub rfcomm_channel: u8,
    pub profile_version: (u8, u8),
    pub supported_features: u32,
}

impl HandsFreeSdpRecord {
    pub fn new(rfcomm_channel: u8, supported_features: u32) -> Self {
        Self {
            service_class_ids: vec![HANDSFREE_SERVICE_CLASS, GENERIC_AUDIO_SERVICE_CLASS],
            rfcomm_channel,
            profile_version: HFP_PROFILE_VERSION,
            supported_features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_both_service_classes() {
        let record = HandsFreeSdpRecord::new(3, 15);
        assert_eq!(
            record.service_class_ids,
            vec![HANDSFREE_SERVICE_CLASS, GENERIC_AUDIO_SERVICE_CLASS]
        );
        assert_eq!(record.profile_version, (1, 5));
    }
}
