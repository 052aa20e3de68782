//! Naming and timestamp codec for datasets.
//!
//! Every dataset name embeds its creation time. The name format uses dots in
//! place of colons so the names stay filesystem safe:
//!
//! - base:  `zdap-<resource>-base-<ts>`
//! - snap:  `zdap-<resource>-base-<ts>@snap`
//! - clone: `zdap-<resource>-base-<ts>-clone-<ts>.<3 letters>`
//!
//! The HTTP surface uses the RFC-style `YYYY-MM-DDTHH:MM:SSZ` form instead.

use chrono::NaiveDateTime;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

use crate::{Error, Result};

/// Timestamp layout embedded in dataset names and user property values.
pub const TS_NAME_FORMAT: &str = "%Y-%m-%dT%H.%M.%S";

/// Timestamp layout used on the HTTP surface.
pub const TS_WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const TS_PATTERN: &str = "[0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}.[0-9]{2}.[0-9]{2}";

fn ts_reg() -> &'static Regex {
    static REG: OnceLock<Regex> = OnceLock::new();
    REG.get_or_init(|| Regex::new(TS_PATTERN).unwrap())
}

fn base_reg() -> &'static Regex {
    static REG: OnceLock<Regex> = OnceLock::new();
    REG.get_or_init(|| Regex::new(&format!("^zdap-.*-base-{TS_PATTERN}$")).unwrap())
}

fn snap_reg() -> &'static Regex {
    static REG: OnceLock<Regex> = OnceLock::new();
    REG.get_or_init(|| Regex::new(&format!("^zdap-.*-base-{TS_PATTERN}@snap$")).unwrap())
}

fn clone_reg() -> &'static Regex {
    static REG: OnceLock<Regex> = OnceLock::new();
    REG.get_or_init(|| {
        Regex::new(&format!(
            "^zdap-.*-base-{TS_PATTERN}-clone-{TS_PATTERN}\\.[a-zA-Z]{{3}}$"
        ))
        .unwrap()
    })
}

pub fn is_base(name: &str) -> bool {
    base_reg().is_match(name)
}

pub fn is_snap(name: &str) -> bool {
    snap_reg().is_match(name)
}

pub fn is_clone(name: &str) -> bool {
    clone_reg().is_match(name)
}

/// `zdap-<resource>-base-<ts>`
pub fn base_name(resource: &str, at: NaiveDateTime) -> String {
    format!("zdap-{}-base-{}", resource, format_name_ts(at))
}

/// `zdap-<resource>-base-<ts>@snap`
pub fn snap_name(resource: &str, at: NaiveDateTime) -> String {
    format!("{}@snap", base_name(resource, at))
}

/// Three random ASCII letters, making clone names created within the same
/// second distinct.
pub fn clone_suffix() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..3)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

pub fn format_name_ts(at: NaiveDateTime) -> String {
    at.format(TS_NAME_FORMAT).to_string()
}

pub fn parse_name_ts(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TS_NAME_FORMAT)
        .map_err(|e| Error::InvalidArgument(format!("bad timestamp '{s}': {e}")))
}

pub fn format_wire_ts(at: NaiveDateTime) -> String {
    at.format(TS_WIRE_FORMAT).to_string()
}

pub fn parse_wire_ts(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TS_WIRE_FORMAT)
        .map_err(|e| Error::InvalidArgument(format!("bad timestamp '{s}': {e}")))
}

/// All name-format timestamps appearing in `name`, in order.
pub fn timestamps_in(name: &str) -> Vec<&str> {
    ts_reg().find_iter(name).map(|m| m.as_str()).collect()
}

/// The `(snapped_at, created_at)` pair encoded in a clone name.
///
/// A clone name carries exactly two timestamps; anything else is malformed.
pub fn clone_timestamps(name: &str) -> Result<(NaiveDateTime, NaiveDateTime)> {
    let ts = timestamps_in(name);
    if ts.len() != 2 {
        return Err(Error::InvalidArgument(format!(
            "clone name '{}' did not contain 2 timestamps, got {}",
            name,
            ts.len()
        )));
    }
    Ok((parse_name_ts(ts[0])?, parse_name_ts(ts[1])?))
}

/// Serde adapters for wire-format timestamps.
pub mod wire_ts {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::{format_wire_ts, TS_WIRE_FORMAT};

    pub fn serialize<S: Serializer>(at: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_wire_ts(*at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&s, TS_WIRE_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Serde adapters for optional wire-format timestamps.
pub mod wire_ts_opt {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::{format_wire_ts, TS_WIRE_FORMAT};

    pub fn serialize<S: Serializer>(at: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match at {
            Some(at) => s.serialize_some(&format_wire_ts(*at)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => NaiveDateTime::parse_from_str(&s, TS_WIRE_FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
