//! Logging facade glue.
//!
//! The teacher's `EspLogger` is a `log::Log` impl that bridges ESP-IDF's
//! native logging into the `log` facade and is installed once at startup
//! via `EspLogger::initialize_default()`. This crate keeps the same
//! contract — every subsystem logs exclusively through `log`'s macros —
//! but leaves the sink to the binary: the library never calls
//! `log::set_logger` itself, since a library initializing global logging
//! state out from under its caller is the kind of surprise the facade
//! exists to avoid. `init()` is provided for binaries and test harnesses
//! that want the same default-verbosity behavior the teacher's
//! `initialize_default()` gave ESP-IDF firmware.

pub use log::LevelFilter;

/// Installs `env_logger` as the process-wide logging sink, honoring
/// `RUST_LOG` and falling back to `default_level` when unset. Call once
/// from `main`; a second call is a no-op (mirrors `set_logger`'s
/// idempotency under repeated init, which the teacher's code treats as a
/// non-fatal `unwrap()` in practice, but here we just ignore the error).
pub fn init(default_level: LevelFilter) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level.to_string()),
    )
    .try_init();
}
