//! Bluetooth Hands-Free Profile 1.5 core: RFCOMM/AT session engine, SCO
//! endpoint and streaming audio pump.
//!
//! This crate implements the Hands-Free (HF) role only; pairing with an
//! Audio Gateway (AG, the phone) and bridging its voice channel to a local
//! sound card is the whole of the job. D-Bus, INI config persistence, the
//! ALSA/OSS backends and the Speex DSP binding are external collaborators
//! and are not implemented here.

pub mod audio;
pub mod bt;
pub mod config;
pub mod device;
pub mod errors;
pub mod hci;
pub mod log;

pub use errors::{ConfigError, Error, ProtocolError, Result, StreamError, TransportError};
