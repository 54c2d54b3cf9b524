//! `AT+CHLD=?` capability parsing, §4.3/§8.
//!
//! The AG's three-way-calling capability list is a parenthesized,
//! comma-separated set of tokens drawn from `{0,1,1x,2,2x,3,4}`, where a
//! plain-digit range (`2-3`) expands to the individual integers it
//! spans; the `x`-suffixed tokens (`1x`, `2x`) are never part of a range.

use std::collections::HashSet;

use num_enum::TryFromPrimitive;

use crate::errors::{Error, ProtocolError, Result};

/// The five plain-digit capabilities; `1x`/`2x` have no numeric-range
/// counterpart (§4.3: "a plain-digit range... the `x`-suffixed tokens
/// are never part of a range") so they're grafted on as non-`repr`
/// variants of the public [`ChldCap`] below rather than folded into
/// this decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
enum PlainChldCap {
    Zero = 0,
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChldCap {
    Zero,
    One,
    OneX,
    Two,
    TwoX,
    Three,
    Four,
}

impl From<PlainChldCap> for ChldCap {
    fn from(plain: PlainChldCap) -> Self {
        match plain {
            PlainChldCap::Zero => ChldCap::Zero,
            PlainChldCap::One => ChldCap::One,
            PlainChldCap::Two => ChldCap::Two,
            PlainChldCap::Three => ChldCap::Three,
            PlainChldCap::Four => ChldCap::Four,
        }
    }
}

impl ChldCap {
    fn from_plain(n: u32) -> Option<Self> {
        PlainChldCap::try_from(n).ok().map(ChldCap::from)
    }

    fn from_token(tok: &str) -> Option<Self> {
        match tok {
            "0" => Some(ChldCap::Zero),
            "1" => Some(ChldCap::One),
            "1x" | "1X" => Some(ChldCap::OneX),
            "2" => Some(ChldCap::Two),
            "2x" | "2X" => Some(ChldCap::TwoX),
            "3" => Some(ChldCap::Three),
            "4" => Some(ChldCap::Four),
            _ => None,
        }
    }
}

/// Parses a `+CHLD: (0,1,1x,2-3)` style response into the set of caps it
/// grants.
pub fn parse_chld_test(line: &str) -> Result<HashSet<ChldCap>> {
    let body = line
        .strip_prefix("+CHLD:")
        .ok_or_else(|| bad(line))?
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')');

    let mut caps = HashSet::new();
    for token in body.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some((lo, hi)) = token.split_once('-') {
            let lo: u32 = lo.trim().parse().map_err(|_| bad(line))?;
            let hi: u32 = hi.trim().parse().map_err(|_| bad(line))?;
            for n in lo..=hi {
                caps.insert(ChldCap::from_plain(n).ok_or_else(|| bad(line))?);
            }
        } else {
            caps.insert(ChldCap::from_token(token).ok_or_else(|| bad(line))?);
        }
    }
    Ok(caps)
}

fn bad(line: &str) -> Error {
    Error::Protocol(ProtocolError::BadParameter(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_plain_digit_range() {
        let caps = parse_chld_test("+CHLD: (0,1,1x,2-3)").unwrap();
        assert!(caps.contains(&ChldCap::Zero));
        assert!(caps.contains(&ChldCap::One));
        assert!(caps.contains(&ChldCap::OneX));
        assert!(caps.contains(&ChldCap::Two));
        assert!(caps.contains(&ChldCap::Three));
        assert_eq!(caps.len(), 5);
    }

    #[test]
    fn rejects_malformed_capability() {
        assert!(parse_chld_test("+CHLD: (0,9)").is_err());
    }
}
