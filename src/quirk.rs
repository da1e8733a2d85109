//! The quirk database: device-specific behavioural overrides keyed by USB
//! fingerprint, loaded once at startup from JSON (`spec.md` §4.7, §6).

use std::collections::HashSet;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::fingerprint::DeviceFingerprint;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuirkStatus {
    Proposed,
    Verified,
    Promoted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuirkConfidence {
    Low,
    Medium,
    High,
    Community,
    Experimental,
}

/// The booleans a quirk (or the policy merge) can set, per `spec.md` §4.7
/// "Flags".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuirkFlags {
    pub reset_on_open: Option<bool>,
    pub requires_kernel_detach: Option<bool>,
    pub skip_ptp_reset: Option<bool>,
    pub supports_partial_read_64: Option<bool>,
    pub supports_partial_read_32: Option<bool>,
    pub supports_partial_write: Option<bool>,
    pub prefers_prop_list_enumeration: Option<bool>,
    pub supports_get_object_prop_list: Option<bool>,
    pub disable_event_pump: Option<bool>,
    pub require_stabilization: Option<bool>,
    pub write_to_subfolder_only: Option<bool>,
    pub preferred_write_folder: Option<String>,
    pub camera_class: Option<bool>,
    pub no_zero_length_packets: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyBackoff {
    pub retries: u32,
    pub base_ms: u64,
    pub jitter: f64,
}

impl Default for BusyBackoff {
    fn default() -> BusyBackoff {
        BusyBackoff {
            retries: 3,
            base_ms: 200,
            jitter: 0.2,
        }
    }
}

/// A quirk hook phase, per `spec.md` §4.7 "Hooks".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    PostOpenUsb,
    PostClaimInterface,
    PostOpenSession,
    BeforeGetDeviceInfo,
    BeforeGetStorageIDs,
    BeforeGetObjectHandles,
    BeforeTransfer,
    AfterTransfer,
    OnDeviceBusy,
    OnDetach,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub phase: HookPhase,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub busy_backoff: Option<BusyBackoff>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tuning {
    pub max_chunk_bytes: Option<u64>,
    pub io_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub inactivity_timeout_ms: Option<u64>,
    pub overall_deadline_ms: Option<u64>,
    pub stabilize_ms: Option<u64>,
    pub post_claim_stabilize_ms: Option<u64>,
    pub reset_on_open: Option<bool>,
    pub disable_event_pump: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceMatch {
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
}

/// A quirk entry's match pattern. `vid`/`pid` are required hex strings
/// (`^0x[0-9a-fA-F]{4}$`, `spec.md` §6); parsing validates the pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPattern {
    pub vid: String,
    pub pid: String,
    #[serde(default)]
    pub bcd_device: Option<String>,
    #[serde(default)]
    pub iface: Option<InterfaceMatch>,
}

impl MatchPattern {
    fn parse_hex4(s: &str) -> Result<u16, Error> {
        let hex = s
            .strip_prefix("0x")
            .filter(|rest| rest.len() == 4 && rest.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| Error::Malformed(format!("not a 4-hex-digit 0x-prefixed value: {s}")))?;
        u16::from_str_radix(hex, 16).map_err(|e| Error::Malformed(e.to_string()))
    }

    pub fn vid_value(&self) -> Result<u16, Error> {
        Self::parse_hex4(&self.vid)
    }

    pub fn pid_value(&self) -> Result<u16, Error> {
        Self::parse_hex4(&self.pid)
    }

    pub fn bcd_value(&self) -> Result<Option<u16>, Error> {
        self.bcd_device.as_deref().map(Self::parse_hex4).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuirkEntry {
    pub id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    pub category: String,
    #[serde(rename = "match")]
    pub match_pattern: MatchPattern,
    #[serde(default)]
    pub tuning: Tuning,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub flags: QuirkFlags,
    pub status: QuirkStatus,
    pub confidence: QuirkConfidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuirkDatabase {
    pub schema_version: String,
    pub entries: Vec<QuirkEntry>,
}

impl QuirkDatabase {
    /// Parse and validate a quirk database from its JSON text
    /// (`spec.md` §6 "Quirk database file"). Validation failures fall back
    /// to defaults at the call site, per the §7 propagation policy — this
    /// function only does the parsing/validation, the fallback decision is
    /// the resolver's.
    pub fn parse(json: &str) -> Result<QuirkDatabase, Error> {
        let db: QuirkDatabase = serde_json::from_str(json).map_err(|e| Error::Malformed(e.to_string()))?;
        db.validate()?;
        Ok(db)
    }

    /// Read and parse the database once at startup (`spec.md` §9 "Quirk
    /// hot-reload is out of scope"). A missing or malformed file is logged
    /// and treated as "no database" rather than a fatal error, so a
    /// deployment with no quirks file still gets the synthesized PTP/
    /// conservative defaults from `spec.md` §4.7 "No match".
    pub async fn load_file(path: impl AsRef<Path>) -> Option<QuirkDatabase> {
        let path = path.as_ref();
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("quirk database {} could not be read, falling back to defaults: {e}", path.display());
                return None;
            }
        };
        match QuirkDatabase::parse(&contents) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!("quirk database {} failed to parse, falling back to defaults: {e}", path.display());
                None
            }
        }
    }

    fn validate(&self) -> Result<(), Error> {
        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for entry in &self.entries {
            if !ids.insert(&entry.id) {
                return Err(Error::Malformed(format!("duplicate quirk id: {}", entry.id)));
            }
            entry.match_pattern.vid_value()?;
            entry.match_pattern.pid_value()?;
            entry.match_pattern.bcd_value()?;

            let key = (
                entry.match_pattern.vid.clone(),
                entry.match_pattern.pid.clone(),
                entry.match_pattern.bcd_device.clone(),
                entry.match_pattern.iface.as_ref().map(|i| (i.class, i.subclass, i.protocol)),
            );
            if !keys.insert(key) {
                return Err(Error::Malformed(format!(
                    "entry {} duplicates another entry's (vid,pid,bcdDevice,iface) tuple",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    /// Score and select the best-matching entry for a fingerprint, per
    /// `spec.md` §4.7 "Matching". Returns `None` when no entry's required
    /// vid/pid pair matches.
    pub fn best_match(&self, fp: &DeviceFingerprint) -> Option<&QuirkEntry> {
        self.entries
            .iter()
            .filter_map(|entry| score(entry, fp).map(|score| (score, entry)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, entry)| entry)
    }
}

/// `None` disqualifies; `Some(score)` is the match weight. vid/pid are
/// mandatory; a malformed pattern never matches (it was supposed to be
/// rejected at load time).
fn score(entry: &QuirkEntry, fp: &DeviceFingerprint) -> Option<u32> {
    let vid = entry.match_pattern.vid_value().ok()?;
    let pid = entry.match_pattern.pid_value().ok()?;
    if vid != fp.vendor_id || pid != fp.product_id {
        return None;
    }
    let mut total = 8;

    if let Some(bcd) = entry.match_pattern.bcd_value().ok()? {
        if Some(bcd) != fp.bcd_device {
            return None;
        }
        total += 3;
    }

    if let Some(iface) = &entry.match_pattern.iface {
        if let Some(class) = iface.class {
            if Some(class) != fp.interface_class {
                return None;
            }
            total += 2;
        }
        if let Some(subclass) = iface.subclass {
            if Some(subclass) != fp.interface_subclass {
                return None;
            }
            total += 2;
        }
        if let Some(protocol) = iface.protocol {
            if Some(protocol) != fp.interface_protocol {
                return None;
            }
            total += 2;
        }
    }

    Some(total)
}

/// USB still-image-capture-device interface class, used to pick the
/// no-match fallback (`spec.md` §4.7).
pub const PTP_INTERFACE_CLASS: u8 = 0x06;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "schemaVersion": "1",
            "entries": [{
                "id": "sony-walkman-nwa55",
                "category": "dap",
                "match": {"vid": "0x2717", "pid": "0xff10"},
                "tuning": {"stabilizeMs": 500},
                "hooks": [],
                "flags": {},
                "status": "verified",
                "confidence": "high"
            }]
        }"#
    }

    #[test]
    fn parses_and_matches_s6_entry() {
        let db = QuirkDatabase::parse(sample_json()).unwrap();
        let fp = DeviceFingerprint::new(0x2717, 0xff10);
        let matched = db.best_match(&fp).unwrap();
        assert_eq!(matched.id, "sony-walkman-nwa55");
        assert_eq!(matched.tuning.stabilize_ms, Some(500));
    }

    #[test]
    fn mismatched_vid_never_matches() {
        let db = QuirkDatabase::parse(sample_json()).unwrap();
        let fp = DeviceFingerprint::new(0xffff, 0xffff);
        assert!(db.best_match(&fp).is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dup = sample_json().replace("\"entries\": [", "\"entries\": [").to_string();
        let mut two_entries = serde_json::from_str::<serde_json::Value>(&dup).unwrap();
        let entry = two_entries["entries"][0].clone();
        two_entries["entries"].as_array_mut().unwrap().push(entry);
        let json = two_entries.to_string();
        assert!(QuirkDatabase::parse(&json).is_err());
    }

    #[test]
    fn bad_hex_pattern_is_rejected() {
        let bad = sample_json().replace("0x2717", "2717");
        assert!(QuirkDatabase::parse(&bad).is_err());
    }
}
