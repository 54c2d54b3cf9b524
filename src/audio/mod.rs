//! Audio subsystem: PCM endpoints, the filter chain, the streaming pump
//! (component F) and the skew-reporting manager lifecycle (component
//! G), §3-§4.8.

pub mod filter;
pub mod format;
pub mod manager;
pub mod pump;
pub mod skew;

pub use filter::{Filter, FilterDirections, FilterStack, Gain, PassThrough};
pub use format::{Endpoint, EndpointProps, PcmFormat, QueueState, SilenceMask};
pub use manager::{SoundDriver, SoundIoManager};
pub use pump::{Pump, PumpConfig, PumpEndpoint, PumpHints, StopReason};
pub use skew::{SkewClass, SkewDetector};
