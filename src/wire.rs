//! Shared request/response schemas exchanged between the forwarder and the indexer.
//!
//! These types are serialized to JSON for the upload header and for search
//! results; both binaries in this workspace depend on this module so that a
//! wire-format change only needs to be made in one place.

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque, sortable, process-unique identifier for a [`Coredump`].
///
/// Encoded as 8 bytes of big-endian millisecond timestamp followed by 12
/// random bytes, so lexicographic byte order tracks creation order closely
/// enough to satisfy sort-by-recency without a shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid([u8; 20]);

impl Uid {
    /// Mints a new id from the current wall-clock time.
    pub fn new() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&millis.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[8..]);
        Uid(bytes)
    }

    /// Renders as lowercase hex, for use in index fields and URL paths.
    pub fn to_hex(self) -> String {
        base16::encode_lower(&self.0)
    }

    /// Parses back a hex-encoded uid, e.g. from a URL path segment.
    pub fn from_hex(s: &str) -> Result<Self, UidParseError> {
        if s.len() != 40 {
            return Err(UidParseError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 20];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = s.as_bytes()[i * 2];
            let lo = s.as_bytes()[i * 2 + 1];
            *byte = (hex_nibble(hi)? << 4) | hex_nibble(lo)?;
        }
        Ok(Uid(bytes))
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a string failed to parse as a [`Uid`].
#[derive(Debug, thiserror::Error)]
pub enum UidParseError {
    #[error("expected 40 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex digit {0:?}")]
    BadDigit(char),
}

fn hex_nibble(b: u8) -> Result<u8, UidParseError> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(UidParseError::BadDigit(b as char)),
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Uid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A shared library the forwarder attempted to resolve for an executable.
///
/// The upload body contains the file itself only when `found && error.is_empty()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub resolved_path: String,
    pub found: bool,
    #[serde(default)]
    pub error: String,
}

/// The first segment of every upload: everything the indexer needs to know
/// about a crash before it starts reading file bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadHeader {
    pub dumped_at: chrono_compat::Timestamp,
    pub hostname: String,
    pub executable_path: String,
    pub executable_hash: String,
    pub include_executable: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub forwarder_version: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// One crash received and persisted by the indexer.
///
/// Created when an upload completes; mutated only by the analyzer (to fill
/// `lang`/`trace`/`analyzed`/`analyzed_at`); destroyed by cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coredump {
    pub uid: Uid,
    pub dumped_at: chrono_compat::Timestamp,
    pub hostname: String,
    pub executable: String,
    pub executable_path: String,
    pub executable_hash: String,
    pub executable_size: u64,
    pub core_size: u64,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default)]
    pub analyzed_at: Option<chrono_compat::Timestamp>,
    #[serde(default)]
    pub analyzed: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub forwarder_version: String,
    pub indexer_version: String,
}

impl Coredump {
    /// Builds the persisted document from an upload header, before the
    /// executable/core sizes are known.
    pub fn from_header(uid: Uid, header: &UploadHeader, indexer_version: &str) -> Self {
        let executable = std::path::Path::new(&header.executable_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| header.executable_path.clone());
        Coredump {
            uid,
            dumped_at: header.dumped_at,
            hostname: header.hostname.clone(),
            executable,
            executable_path: header.executable_path.clone(),
            executable_hash: header.executable_hash.clone(),
            executable_size: 0,
            core_size: 0,
            lang: None,
            trace: None,
            analyzed_at: None,
            analyzed: false,
            metadata: header.metadata.clone(),
            forwarder_version: header.forwarder_version.clone(),
            indexer_version: indexer_version.to_string(),
        }
    }
}

/// A minimal UTC timestamp, independent of any particular datetime crate.
///
/// Timestamps are kept as seconds since the Unix epoch plus an RFC3339
/// codec, which is all the query language's range clauses on ISO-ish
/// strings and the wire JSON need.
pub mod chrono_compat {
    use serde::{Deserialize, Serialize};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Timestamp(i64);

    impl Timestamp {
        pub fn from_unix_seconds(secs: i64) -> Self {
            Timestamp(secs)
        }

        pub fn now() -> Self {
            let d = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Timestamp(d.as_secs() as i64)
        }

        pub fn unix_seconds(self) -> i64 {
            self.0
        }

        pub fn to_system_time(self) -> SystemTime {
            UNIX_EPOCH + Duration::from_secs(self.0.max(0) as u64)
        }

        /// Formats as `YYYY-MM-DDTHH:MM:SSZ`, computed from first principles
        /// (civil-from-days) to avoid pulling in a heavier datetime crate
        /// for a single format.
        pub fn to_rfc3339(self) -> String {
            let (y, m, d, hh, mm, ss) = civil_from_unix(self.0);
            format!(
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
                y, m, d, hh, mm, ss
            )
        }

        /// Formats as an RFC 7231 HTTP-date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`,
        /// for the `Last-Modified` header on streamed files.
        pub fn to_http_date(self) -> String {
            const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
            const MONTHS: [&str; 12] = [
                "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
            ];
            let (y, m, d, hh, mm, ss) = civil_from_unix(self.0);
            let days = self.0.div_euclid(86400);
            // 1970-01-01 (day 0) was a Thursday (index 4).
            let weekday = WEEKDAYS[((days.rem_euclid(7)) + 4).rem_euclid(7) as usize];
            format!(
                "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
                weekday,
                d,
                MONTHS[(m - 1) as usize],
                y,
                hh,
                mm,
                ss
            )
        }

        /// Parses `YYYY-MM-DDTHH:MM:SSZ` (and the bare `YYYY-MM-DD` prefix).
        pub fn parse_rfc3339(s: &str) -> Option<Self> {
            let bytes = s.as_bytes();
            if bytes.len() < 10 {
                return None;
            }
            let y: i64 = s.get(0..4)?.parse().ok()?;
            let mo: i64 = s.get(5..7)?.parse().ok()?;
            let d: i64 = s.get(8..10)?.parse().ok()?;
            let (hh, mm, ss) = if s.len() >= 19 {
                (
                    s.get(11..13)?.parse().ok()?,
                    s.get(14..16)?.parse().ok()?,
                    s.get(17..19)?.parse().ok()?,
                )
            } else {
                (0i64, 0i64, 0i64)
            };
            Some(Timestamp(unix_from_civil(y, mo, d, hh, mm, ss)))
        }
    }

    /// Howard Hinnant's days_from_civil/civil_from_days algorithm, the
    /// standard branch-free calendar conversion.
    fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
        let y = if m <= 2 { y - 1 } else { y };
        let era = if y >= 0 { y } else { y - 399 } / 400;
        let yoe = (y - era * 400) as i64;
        let mp = (m + 9) % 12;
        let doy = (153 * mp + 2) / 5 + d - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        era * 146097 + doe - 719468
    }

    fn civil_from_days(z: i64) -> (i64, i64, i64) {
        let z = z + 719468;
        let era = if z >= 0 { z } else { z - 146096 } / 146097;
        let doe = z - era * 146097;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let d = doy - (153 * mp + 2) / 5 + 1;
        let m = if mp < 10 { mp + 3 } else { mp - 9 };
        (if m <= 2 { y + 1 } else { y }, m, d)
    }

    fn unix_from_civil(y: i64, mo: i64, d: i64, hh: i64, mm: i64, ss: i64) -> i64 {
        days_from_civil(y, mo, d) * 86400 + hh * 3600 + mm * 60 + ss
    }

    fn civil_from_unix(secs: i64) -> (i64, i64, i64, i64, i64, i64) {
        let days = secs.div_euclid(86400);
        let of_day = secs.rem_euclid(86400);
        let (y, m, d) = civil_from_days(days);
        (y, m, d, of_day / 3600, (of_day / 60) % 60, of_day % 60)
    }

    impl Serialize for Timestamp {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&self.to_rfc3339())
        }
    }

    impl<'de> Deserialize<'de> for Timestamp {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            Timestamp::parse_rfc3339(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {s:?}")))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trips_rfc3339() {
            let t = Timestamp::parse_rfc3339("2020-05-01T10:00:00Z").unwrap();
            assert_eq!(t.to_rfc3339(), "2020-05-01T10:00:00Z");
        }

        #[test]
        fn epoch_is_zero() {
            let t = Timestamp::parse_rfc3339("1970-01-01T00:00:00Z").unwrap();
            assert_eq!(t.unix_seconds(), 0);
        }

        #[test]
        fn epoch_http_date_is_a_thursday() {
            let t = Timestamp::from_unix_seconds(0);
            assert_eq!(t.to_http_date(), "Thu, 01 Jan 1970 00:00:00 GMT");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_round_trips_through_hex() {
        let uid = Uid::new();
        let hex = uid.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(Uid::from_hex(&hex).unwrap(), uid);
    }

    #[test]
    fn uids_are_monotonic_enough() {
        let a = Uid::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Uid::new();
        assert!(a.to_hex() < b.to_hex());
    }
}
