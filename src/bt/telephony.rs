//! Telephony command API, §4.5.
//!
//! Pure command-text builders plus capability advisories; the actual
//! queueing and future wiring lives on [`crate::bt::session::Session`],
//! which is the only thing that owns a live [`crate::bt::at::AtQueue`].
//! Keeping these as free functions makes the AT-text/validation rules
//! independently testable without a socket or event loop, the same
//! separation the teacher draws between `bt/hfp.rs`'s enum/parsing code
//! and its `EspHfpc` connection object.

use std::collections::HashSet;

use log::warn;

use crate::bt::at::validate_phone_number;
use crate::bt::chld::ChldCap;
use crate::errors::{Error, ProtocolError, Result};

pub fn dial_command(number: &str) -> Result<String> {
    validate_phone_number(number)?;
    Ok(format!("ATD{number};"))
}

pub fn redial_command() -> String {
    "AT+BLDN".to_string()
}

pub fn answer_command() -> String {
    "ATA".to_string()
}

pub fn hang_up_command() -> String {
    "AT+CHUP".to_string()
}

pub fn dtmf_command(digit: char) -> Result<String> {
    if !(digit.is_ascii_digit() || matches!(digit, '#' | '*' | 'A'..='D')) {
        return Err(Error::Protocol(ProtocolError::BadParameter(
            digit.to_string(),
        )));
    }
    Ok(format!("AT+VTS={digit}"))
}

/// Logs a warning (but never refuses) when the requested operation's
/// capability wasn't advertised by `AT+CHLD=?`, per §4.5: "the module
/// logs a warning but does not refuse locally."
fn advise_cap(caps: &HashSet<ChldCap>, required: ChldCap, op: &str) {
    if !caps.contains(&required) {
        warn!("AG did not advertise {required:?} capability for {op}; sending anyway");
    }
}

pub fn drop_held_udub_command(caps: &HashSet<ChldCap>) -> String {
    advise_cap(caps, ChldCap::Zero, "drop_held_udub");
    "AT+CHLD=0".to_string()
}

pub fn swap_drop_active_command(caps: &HashSet<ChldCap>) -> String {
    advise_cap(caps, ChldCap::One, "swap_drop_active");
    "AT+CHLD=1".to_string()
}

pub fn drop_active_command(caps: &HashSet<ChldCap>, index: u32) -> String {
    advise_cap(caps, ChldCap::OneX, "drop_active");
    format!("AT+CHLD=1{index}")
}

pub fn swap_hold_active_command(caps: &HashSet<ChldCap>) -> String {
    advise_cap(caps, ChldCap::Two, "swap_hold_active");
    "AT+CHLD=2".to_string()
}

pub fn private_consult_command(caps: &HashSet<ChldCap>, index: u32) -> String {
    advise_cap(caps, ChldCap::TwoX, "private_consult");
    format!("AT+CHLD=2{index}")
}

pub fn link_calls_command(caps: &HashSet<ChldCap>) -> String {
    advise_cap(caps, ChldCap::Three, "link_calls");
    "AT+CHLD=3".to_string()
}

pub fn transfer_command(caps: &HashSet<ChldCap>) -> String {
    advise_cap(caps, ChldCap::Four, "transfer");
    "AT+CHLD=4".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_wraps_number_with_atd_and_semicolon() {
        assert_eq!(dial_command("15551212").unwrap(), "ATD15551212;");
        assert!(dial_command("not-a-number").is_err());
    }

    #[test]
    fn dtmf_accepts_digits_and_star_pound() {
        assert_eq!(dtmf_command('5').unwrap(), "AT+VTS=5");
        assert_eq!(dtmf_command('#').unwrap(), "AT+VTS=#");
        assert!(dtmf_command('z').is_err());
    }

    #[test]
    fn chld_commands_do_not_refuse_on_missing_capability() {
        let caps = HashSet::new();
        assert_eq!(drop_active_command(&caps, 2), "AT+CHLD=12");
        assert_eq!(private_consult_command(&caps, 3), "AT+CHLD=23");
    }
}
