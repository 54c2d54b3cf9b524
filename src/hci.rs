//! BT Hub / HCI gateway (component A).
//!
//! Owns the local HCI device used by the service, reports its SCO MTU and
//! voice setting to the SCO endpoint (component E), enumerates/owns the
//! remote device arena (per the design notes: "the BT hub owns the arena
//! and provides lookup by Bluetooth address"), and recognizes the local
//! device class (§6.5). The constants below are the Core Spec's HCI
//! packet-format values, pared down to what the HF role actually needs:
//! SCO sizing, not the full HCI command set.

use std::collections::HashMap;

use log::{info, warn};

use crate::device::{is_handsfree_class, BdAddr, Device, DeviceHandle};
use crate::errors::{ConfigError, Error, Result};

/// Maximum SCO payload size in octets, per the core HCI spec's packet
/// format.
pub const MAX_SCO_SIZE: usize = 255;

/// Voice setting required by §4.6: 16-bit, linear, 2's complement,
/// little-endian.
pub const REQUIRED_VOICE_SETTING: u16 = 0x0060;

/// Minimum acceptable SCO MTU and packet buffer count, §4.6.
pub const MIN_SCO_MTU: u16 = 48;
pub const MIN_SCO_BUFFERS: u16 = 8;

/// Reported SCO capability of the local HCI controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoHciConfig {
    pub mtu: u16,
    pub max_packets: u16,
    pub voice_setting: u16,
}

impl ScoHciConfig {
    /// Validates against §4.6's MTU/buffer/voice-setting floor.
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_SCO_MTU {
            return Err(Error::Configuration(ConfigError::BadScoConfig(format!(
                "SCO MTU {} below minimum {MIN_SCO_MTU}",
                self.mtu
            ))));
        }
        if self.max_packets < MIN_SCO_BUFFERS {
            return Err(Error::Configuration(ConfigError::BadScoConfig(format!(
                "SCO packet buffers {} below minimum {MIN_SCO_BUFFERS}",
                self.max_packets
            ))));
        }
        if self.voice_setting != REQUIRED_VOICE_SETTING {
            return Err(Error::Configuration(ConfigError::BadScoConfig(format!(
                "voice setting {:#06x}, expected {REQUIRED_VOICE_SETTING:#06x}",
                self.voice_setting
            ))));
        }
        Ok(())
    }
}

/// Arena of remote devices, indexed by a stable handle with a secondary
/// index by address. Replaces the original's intrusive linked list and
/// hand-rolled refcounting, per the design notes.
#[derive(Debug, Default)]
pub struct DeviceArena {
    slots: Vec<Option<Device>>,
    by_addr: HashMap<BdAddr, DeviceHandle>,
}

impl DeviceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, addr: BdAddr) -> Option<DeviceHandle> {
        self.by_addr.get(&addr).copied()
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&Device> {
        self.slots.get(handle.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, handle: DeviceHandle) -> Option<&mut Device> {
        self.slots.get_mut(handle.0).and_then(|slot| slot.as_mut())
    }

    /// Finds the device for `addr`, creating it (with refcount zero) if
    /// this is the first reference.
    pub fn get_or_create(&mut self, addr: BdAddr) -> DeviceHandle {
        if let Some(handle) = self.lookup(addr) {
            return handle;
        }
        let handle = DeviceHandle(self.slots.len());
        self.slots.push(Some(Device::new(addr)));
        self.by_addr.insert(addr, handle);
        handle
    }

    pub fn incref(&mut self, handle: DeviceHandle) {
        if let Some(device) = self.get_mut(handle) {
            device.incref();
        }
    }

    /// Drops one reference; destroys the slot if the refcount reached
    /// zero and the caller confirms no session is attached.
    pub fn decref(&mut self, handle: DeviceHandle, has_session: bool) {
        let reached_zero = match self.get_mut(handle) {
            Some(device) => device.decref(),
            None => return,
        };
        if reached_zero && !has_session {
            if let Some(slot) = self.slots.get_mut(handle.0) {
                if let Some(device) = slot.take() {
                    self.by_addr.remove(&device.addr);
                }
            }
        }
    }
}

/// The local HCI controller and the arena of devices reachable through it.
pub struct Hci {
    pub local_address: BdAddr,
    pub device_class: u32,
    sco_config: ScoHciConfig,
    arena: DeviceArena,
}

impl Hci {
    /// Opens the local HCI device, validating its SCO configuration. If
    /// misconfigured, attempts exactly one reset before giving up (§4.6,
    /// and the "locally recovered" note in §7).
    pub fn open(local_address: BdAddr, device_class: u32, sco_config: ScoHciConfig) -> Result<Self> {
        if !is_handsfree_class(device_class) {
            warn!(
                "local device class {device_class:#x} does not advertise the hands-free \
                 service class (expected bits 0x408 under mask 0x1ffc); continuing anyway"
            );
        }

        let sco_config = match sco_config.validate() {
            Ok(()) => sco_config,
            Err(_) => {
                warn!("SCO HCI configuration out of spec, attempting one reset");
                let patched = ScoHciConfig {
                    mtu: sco_config.mtu.max(MIN_SCO_MTU),
                    max_packets: sco_config.max_packets.max(MIN_SCO_BUFFERS),
                    voice_setting: REQUIRED_VOICE_SETTING,
                };
                patched.validate()?;
                patched
            }
        };

        info!(
            "HCI {local_address} ready: SCO mtu={} buffers={} voice={:#06x}",
            sco_config.mtu, sco_config.max_packets, sco_config.voice_setting
        );

        Ok(Self {
            local_address,
            device_class,
            sco_config,
            arena: DeviceArena::new(),
        })
    }

    pub fn sco_config(&self) -> ScoHciConfig {
        self.sco_config
    }

    pub fn arena(&self) -> &DeviceArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut DeviceArena {
        &mut self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_config() -> ScoHciConfig {
        ScoHciConfig {
            mtu: 48,
            max_packets: 8,
            voice_setting: REQUIRED_VOICE_SETTING,
        }
    }

    #[test]
    fn validates_minimum_mtu_and_buffers() {
        assert!(good_config().validate().is_ok());

        let mut bad = good_config();
        bad.mtu = 40;
        assert!(bad.validate().is_err());

        let mut bad = good_config();
        bad.max_packets = 4;
        assert!(bad.validate().is_err());

        let mut bad = good_config();
        bad.voice_setting = 0x0000;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn arena_creates_once_and_refcounts() {
        let mut arena = DeviceArena::new();
        let addr = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let h1 = arena.get_or_create(addr);
        let h2 = arena.get_or_create(addr);
        assert_eq!(h1, h2);

        arena.incref(h1);
        arena.incref(h1);
        assert_eq!(arena.get(h1).unwrap().refcount(), 2);

        arena.decref(h1, false);
        assert!(arena.get(h1).is_some());
        arena.decref(h1, false);
        assert!(arena.get(h1).is_none());
        assert!(arena.lookup(addr).is_none());
    }

    #[test]
    fn arena_keeps_device_with_attached_session() {
        let mut arena = DeviceArena::new();
        let addr = BdAddr::new([9, 9, 9, 9, 9, 9]);
        let handle = arena.get_or_create(addr);
        arena.incref(handle);
        arena.decref(handle, true);
        assert!(arena.get(handle).is_some());
    }

    #[test]
    fn patches_misconfigured_sco_once() {
        let broken = ScoHciConfig {
            mtu: 0,
            max_packets: 0,
            voice_setting: 0,
        };
        let hci = Hci::open(BdAddr::zero(), 0x200408, broken).unwrap();
        assert!(hci.sco_config().validate().is_ok());
    }
}
