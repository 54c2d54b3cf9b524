//! Hands-Free protocol engine.
//!
//! Layout mirrors the teacher's `bt/{gap,spp,hfp,a2dp,avrc}.rs` split: one
//! file per concern, `mod.rs` only re-exporting. `rfcomm` is the session
//! substrate (component B), `at` the command queue (component C),
//! `indicators`/`chld`/`telephony` the handshake/status/command surface
//! of the protocol state machine, `session` the state machine itself
//! (component D), `sco` the voice channel endpoint (component E), `sdp`
//! the service record shape (§6.2), and `features` the feature bitmaps
//! (§6.3).

pub mod at;
pub mod chld;
pub mod features;
pub mod indicators;
pub mod rfcomm;
pub mod sco;
pub mod sdp;
pub mod session;
pub mod telephony;

pub use session::{Session, SessionState};
