//! Mapping between filesystem attributes and object metadata
//!
//! Objects carry the owner, group, permission bits, modification time and
//! access time of the file they were uploaded from as string user metadata. Objects written
//! by other tools lack these keys; decoding then falls back to
//! caller-supplied defaults and never fails.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entry::{Entry, FileAttributes};

/// String-keyed object metadata
pub type MetadataMap = BTreeMap<String, String>;

/// Owner user ID, decimal
pub const OWNER_KEY: &str = "owner";
/// Owner group ID, decimal
pub const GROUP_KEY: &str = "group";
/// Permission bits, octal with a leading zero
pub const MODE_KEY: &str = "mode";
/// Modification time as `<secs>.<nanos>`
pub const MTIME_KEY: &str = "mtime";
/// Access time as `<secs>.<nanos>`
pub const ATIME_KEY: &str = "atime";

/// A stored metadata value that could not be used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataWarning {
    /// Object key or relative path the metadata belongs to
    pub path: String,
    /// Metadata key
    pub key: String,
    /// Offending value
    pub value: String,
    /// Why it was rejected
    pub reason: String,
}

/// Result of decoding object metadata
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMetadata {
    /// Attributes to apply, with defaults filled in
    pub attributes: FileAttributes,
    /// Stored modification time, if present and valid
    pub mtime: Option<SystemTime>,
    /// Stored access time, if present and valid
    pub atime: Option<SystemTime>,
    /// Anomalies found while decoding
    pub warnings: Vec<MetadataWarning>,
}

/// Encode an entry's attributes as object metadata
pub fn encode(entry: &Entry) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    metadata.insert(OWNER_KEY.to_string(), entry.owner_id.to_string());
    metadata.insert(GROUP_KEY.to_string(), entry.group_id.to_string());
    metadata.insert(MODE_KEY.to_string(), format!("0{:o}", entry.mode_bits));
    metadata.insert(MTIME_KEY.to_string(), format_time(entry.mtime));
    if let Some(atime) = entry.atime {
        metadata.insert(ATIME_KEY.to_string(), format_time(atime));
    }
    metadata
}

/// Decode object metadata, falling back to `fallback` for anything missing
/// or malformed
///
/// `path` only labels the warnings.
pub fn decode(path: &str, metadata: &MetadataMap, fallback: &FileAttributes) -> DecodedMetadata {
    let mut decoded = DecodedMetadata {
        attributes: *fallback,
        mtime: None,
        atime: None,
        warnings: Vec::new(),
    };

    for (key, value) in metadata {
        let parsed = if key.eq_ignore_ascii_case(OWNER_KEY) {
            value.trim().parse::<u32>().map(|v| decoded.attributes.owner_id = v).map_err(|e| e.to_string())
        } else if key.eq_ignore_ascii_case(GROUP_KEY) {
            value.trim().parse::<u32>().map(|v| decoded.attributes.group_id = v).map_err(|e| e.to_string())
        } else if key.eq_ignore_ascii_case(MODE_KEY) {
            parse_mode(value).map(|v| decoded.attributes.mode_bits = v)
        } else if key.eq_ignore_ascii_case(MTIME_KEY) {
            parse_time(value).map(|v| decoded.mtime = Some(v))
        } else if key.eq_ignore_ascii_case(ATIME_KEY) {
            parse_time(value).map(|v| decoded.atime = Some(v))
        } else {
            // Foreign metadata is none of our business
            Ok(())
        };

        if let Err(reason) = parsed {
            warn!(path, key = %key, value = %value, "unrecognized format of stored metadata: {}", reason);
            decoded.warnings.push(MetadataWarning {
                path: path.to_string(),
                key: key.clone(),
                value: value.clone(),
                reason,
            });
        }
    }

    decoded
}

fn format_time(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(since) => format!("{}.{:09}", since.as_secs(), since.subsec_nanos()),
        // Pre-epoch times are clamped, they never come out of a sane filesystem
        Err(_) => "0.000000000".to_string(),
    }
}

fn parse_mode(value: &str) -> std::result::Result<u16, String> {
    let value = value.trim();
    let digits = value.strip_prefix("0o").unwrap_or(value);
    if digits.is_empty() {
        return Err("empty mode".to_string());
    }
    let mode = u32::from_str_radix(digits, 8).map_err(|e| e.to_string())?;
    // Full st_mode values carry file-type bits; keep permission bits only
    Ok((mode & 0o7777) as u16)
}

fn parse_time(value: &str) -> std::result::Result<SystemTime, String> {
    let value = value.trim();
    let (secs, frac) = match value.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (value, ""),
    };

    let secs: u64 = secs.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    let nanos = if frac.is_empty() {
        0
    } else {
        if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid fractional seconds '{}'", frac));
        }
        // Right-pad so "5" means 500ms
        format!("{:0<9}", frac).parse::<u32>().map_err(|e| e.to_string())?
    };

    SystemTime::UNIX_EPOCH
        .checked_add(Duration::new(secs, nanos))
        .ok_or_else(|| "timestamp out of range".to_string())
}
