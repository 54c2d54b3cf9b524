//! Indicator parsing and callsetup emulation, §4.4.
//!
//! `+CIND=?`/`+CIND?`/`+CIEV:` maintain a slot-indexed table of named
//! indicator values; `+CLIP:`/`+CCWA:` attach calling-line identity to an
//! in-progress callsetup; `RING`, `ATD`/`AT+BLDN` success and `+CCWA:`
//! emulate the `callsetup` indicator on AGs that don't report one. Per
//! §10.7, the index table is retained for the life of the session, not
//! discarded after the handshake, so a later `+CIEV:` can always resolve
//! back to a name.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep_until, Instant, Sleep};

use crate::errors::{Error, ProtocolError, Result};

/// Canonicalizes a `+CIND=?` name (`call_setup` is accepted as a synonym
/// for `callsetup`, §4.3). Unknown names are kept verbatim and retained
/// by position only.
fn canonical_name(name: &str) -> String {
    if name == "call_setup" {
        "callsetup".to_string()
    } else {
        name.to_string()
    }
}

/// Maps indicator slot number (1-based, per `AT+CIND=?` order) to name.
#[derive(Debug, Clone, Default)]
pub struct IndicatorTable {
    names: Vec<String>,
}

impl IndicatorTable {
    /// Parses the name portion of a `+CIND: ("name",(range)),...` test
    /// response into an ordered index table.
    pub fn parse(line: &str) -> Result<Self> {
        let body = line
            .strip_prefix("+CIND:")
            .ok_or_else(|| bad(line))?
            .trim();

        let mut names = Vec::new();
        let mut rest = body;
        while let Some(start) = rest.find('"') {
            let after = &rest[start + 1..];
            let end = after.find('"').ok_or_else(|| bad(line))?;
            names.push(canonical_name(&after[..end]));
            rest = &after[end + 1..];
        }
        if names.is_empty() {
            return Err(bad(line));
        }
        Ok(Self { names })
    }

    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name).map(|i| i + 1)
    }

    pub fn name_at(&self, slot: usize) -> Option<&str> {
        self.names.get(slot.checked_sub(1)?).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.slot_of(name).is_some()
    }
}

fn bad(line: &str) -> Error {
    Error::Protocol(ProtocolError::BadParameter(line.to_string()))
}

/// Current value of every indicator, by canonical name.
#[derive(Debug, Clone, Default)]
pub struct IndicatorValues {
    values: HashMap<String, i32>,
}

impl IndicatorValues {
    pub fn get(&self, name: &str) -> Option<i32> {
        self.values.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: i32) {
        self.values.insert(name.to_string(), value);
    }

    /// Applies a `+CIND: v1,v2,...` read response against `table`.
    pub fn apply_read(&mut self, line: &str, table: &IndicatorTable) -> Result<()> {
        let body = line.strip_prefix("+CIND:").ok_or_else(|| bad(line))?.trim();
        for (i, raw) in body.split(',').enumerate() {
            let value: i32 = raw.trim().parse().map_err(|_| bad(line))?;
            if let Some(name) = table.name_at(i + 1) {
                self.set(name, value);
            }
        }
        Ok(())
    }

    /// Applies one `+CIEV: <index>,<value>` event; returns the resolved
    /// name and new value for the caller to act on.
    pub fn apply_ciev<'a>(
        &mut self,
        line: &str,
        table: &'a IndicatorTable,
    ) -> Result<(&'a str, i32)> {
        let body = line.strip_prefix("+CIEV:").ok_or_else(|| bad(line))?.trim();
        let (slot_raw, value_raw) = body.split_once(',').ok_or_else(|| bad(line))?;
        let slot: usize = slot_raw.trim().parse().map_err(|_| bad(line))?;
        let value: i32 = value_raw.trim().parse().map_err(|_| bad(line))?;
        let name = table.name_at(slot).ok_or_else(|| bad(line))?;
        self.set(name, value);
        Ok((name, value))
    }
}

/// Derived call/callsetup presentation, §4.4's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    ConnectingOutbound,
    Established,
    WaitingInbound,
    EstablishedWaiting,
}

/// `has_established = call != 0`; `has_connecting = callsetup in {2,3}`;
/// `has_waiting = callsetup == 1`.
pub fn derive_call_state(call: i32, callsetup: i32) -> CallState {
    let has_established = call != 0;
    let has_connecting = matches!(callsetup, 2 | 3);
    let has_waiting = callsetup == 1;

    match (has_established, has_connecting, has_waiting) {
        (false, false, false) => CallState::Idle,
        (false, true, false) => CallState::ConnectingOutbound,
        (true, false, false) => CallState::Established,
        (false, false, true) => CallState::WaitingInbound,
        (true, false, true) => CallState::EstablishedWaiting,
        // Not named by the table; treat connecting-with-established as
        // established (the AG is expected to clear callsetup first).
        _ => CallState::Established,
    }
}

/// Calling line identity parsed from `+CLIP:`/`+CCWA:`, §3.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallingLineIdentity {
    pub number: Option<String>,
    pub type_of_number: Option<u8>,
    pub subaddress: Option<String>,
    pub subaddress_type: Option<u8>,
    pub alpha: Option<String>,
    pub validity: Option<u8>,
}

fn unquote(field: &str) -> Option<String> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    Some(field.trim_matches('"').to_string())
}

fn split_fields(body: &str) -> Vec<&str> {
    body.split(',').map(str::trim).collect()
}

impl CallingLineIdentity {
    /// `+CLIP: <number>[,<type>[,<subaddr>[,<satype>[,<alpha>[,<validity>]]]]]`
    pub fn parse_clip(line: &str) -> Result<Self> {
        let body = line.strip_prefix("+CLIP:").ok_or_else(|| bad(line))?;
        let fields = split_fields(body);
        Ok(Self {
            number: fields.first().and_then(|f| unquote(f)),
            type_of_number: fields.get(1).and_then(|f| f.parse().ok()),
            subaddress: fields.get(2).and_then(|f| unquote(f)),
            subaddress_type: fields.get(3).and_then(|f| f.parse().ok()),
            alpha: fields.get(4).and_then(|f| unquote(f)),
            validity: fields.get(5).and_then(|f| f.parse().ok()),
        })
    }

    /// `+CCWA: <number>,<type>,<class>,<alpha>,<validity>`. The `class`
    /// field has no counterpart in §3's data model; it is dropped.
    pub fn parse_ccwa(line: &str) -> Result<Self> {
        let body = line.strip_prefix("+CCWA:").ok_or_else(|| bad(line))?;
        let fields = split_fields(body);
        Ok(Self {
            number: fields.first().and_then(|f| unquote(f)),
            type_of_number: fields.get(1).and_then(|f| f.parse().ok()),
            subaddress: None,
            subaddress_type: None,
            alpha: fields.get(3).and_then(|f| unquote(f)),
            validity: fields.get(4).and_then(|f| f.parse().ok()),
        })
    }

    /// Renders back into `+CLIP: ...` wire text, the inverse of
    /// [`Self::parse_clip`] and §8's round-trip law
    /// (`GsmClipPhoneNumber::parse(format(x)) = x`). Only as many
    /// comma-separated fields as carry a `Some` value are emitted;
    /// trailing absent fields are omitted rather than padded, since an
    /// absent trailing field and an empty one parse back identically.
    pub fn format_clip(&self) -> String {
        let rendered: [Option<String>; 6] = [
            self.number.as_ref().map(|n| format!("\"{n}\"")),
            self.type_of_number.map(|v| v.to_string()),
            self.subaddress.as_ref().map(|s| format!("\"{s}\"")),
            self.subaddress_type.map(|v| v.to_string()),
            self.alpha.as_ref().map(|a| format!("\"{a}\"")),
            self.validity.map(|v| v.to_string()),
        ];
        let Some(last) = rendered.iter().rposition(Option::is_some) else {
            return "+CLIP:".to_string();
        };
        let body = rendered[..=last]
            .iter()
            .map(|f| f.clone().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        format!("+CLIP: {body}")
    }
}

/// Which emulation timer is currently armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationTimer {
    Ring,
    DialOrWaiting,
}

/// Callsetup emulation for AGs whose `+CIND=?` test response omits
/// `callsetup`. Re-armable single-shot timer; `wait()` never resolves
/// while disarmed so it composes directly into a `tokio::select!` arm.
pub struct CallsetupEmulation {
    deadline: Option<Pin<Box<Sleep>>>,
    kind: Option<EmulationTimer>,
}

impl Default for CallsetupEmulation {
    fn default() -> Self {
        Self {
            deadline: None,
            kind: None,
        }
    }
}

impl CallsetupEmulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, kind: EmulationTimer, timeout: Duration) {
        self.deadline = Some(Box::pin(sleep_until(Instant::now() + timeout)));
        self.kind = Some(kind);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.kind = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves to the armed timer's kind when it expires; pends forever
    /// if disarmed.
    pub async fn wait(&mut self) -> EmulationTimer {
        match self.deadline.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                let kind = self.kind.take().expect("kind set alongside deadline");
                self.deadline = None;
                kind
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_table() -> IndicatorTable {
        IndicatorTable::parse(
            "+CIND: (\"service\",(0,1)),(\"call\",(0,1)),(\"callsetup\",(0-3)),\
             (\"signal\",(0-5)),(\"roam\",(0,1)),(\"battchg\",(0-5))",
        )
        .unwrap()
    }

    #[test]
    fn parses_cind_test_and_read() {
        let table = handshake_table();
        assert_eq!(table.slot_of("callsetup"), Some(3));

        let mut values = IndicatorValues::default();
        values.apply_read("+CIND: 1,0,0,4,0,3", &table).unwrap();
        assert_eq!(values.get("signal"), Some(4));
        assert_eq!(values.get("battchg"), Some(3));
    }

    #[test]
    fn applies_ciev_by_resolved_name() {
        let table = handshake_table();
        let mut values = IndicatorValues::default();
        let (name, value) = values.apply_ciev("+CIEV: 3,1", &table).unwrap();
        assert_eq!(name, "callsetup");
        assert_eq!(value, 1);
        assert_eq!(values.get("callsetup"), Some(1));
    }

    #[test]
    fn call_setup_table_matches_spec() {
        assert_eq!(derive_call_state(0, 0), CallState::Idle);
        assert_eq!(derive_call_state(0, 2), CallState::ConnectingOutbound);
        assert_eq!(derive_call_state(0, 3), CallState::ConnectingOutbound);
        assert_eq!(derive_call_state(1, 0), CallState::Established);
        assert_eq!(derive_call_state(0, 1), CallState::WaitingInbound);
        assert_eq!(derive_call_state(1, 1), CallState::EstablishedWaiting);
    }

    #[test]
    fn parses_clip_with_number_and_type() {
        let clip = CallingLineIdentity::parse_clip("+CLIP: \"5551212\",129").unwrap();
        assert_eq!(clip.number.as_deref(), Some("5551212"));
        assert_eq!(clip.type_of_number, Some(129));
    }

    #[test]
    fn clip_round_trips_through_format_and_parse() {
        let clip = CallingLineIdentity {
            number: Some("5551212".to_string()),
            type_of_number: Some(129),
            subaddress: None,
            subaddress_type: None,
            alpha: Some("Jane".to_string()),
            validity: Some(0),
        };
        let line = clip.format_clip();
        let reparsed = CallingLineIdentity::parse_clip(&line).unwrap();
        assert_eq!(reparsed, clip);
    }

    #[test]
    fn empty_clip_round_trips() {
        let clip = CallingLineIdentity::default();
        let line = clip.format_clip();
        let reparsed = CallingLineIdentity::parse_clip(&line).unwrap();
        assert_eq!(reparsed, clip);
    }

    #[tokio::test]
    async fn ring_timer_fires_once_when_armed() {
        let mut timer = CallsetupEmulation::new();
        assert!(!timer.is_armed());
        timer.arm(EmulationTimer::Ring, Duration::from_millis(1));
        assert_eq!(timer.wait().await, EmulationTimer::Ring);
        assert!(!timer.is_armed());
    }
}
