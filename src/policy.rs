//! Effective tuning and policy: the quirk resolver's output after merging
//! defaults, a learned profile, a matched quirk entry, and user overrides
//! (`spec.md` §4.7).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enumeration::EnumerationStrategy;
use crate::fingerprint::DeviceFingerprint;
use crate::quirk::{BusyBackoff, Hook, HookPhase, QuirkDatabase, QuirkFlags, PTP_INTERFACE_CLASS};

/// Which input a merged field's value ultimately came from, for
/// observability (`spec.md` §4.7 "Merging order").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Default,
    Learned,
    Quirk,
    Probe,
    UserOverride,
}

#[derive(Debug, Clone, Copy)]
struct Merged<T> {
    value: T,
    source: Provenance,
}

impl<T> Merged<T> {
    fn defaulted(value: T) -> Merged<T> {
        Merged {
            value,
            source: Provenance::Default,
        }
    }

    /// Overwrite with `next` (and its source) if `next` is `Some`.
    fn overlay(self, next: Option<T>, source: Provenance) -> Merged<T> {
        match next {
            Some(value) => Merged { value, source },
            None => self,
        }
    }
}

/// Previously-observed per-device tuning, persisted across sessions
/// (`spec.md` §6 "Learned profile store").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearnedProfile {
    pub optimal_chunk_bytes: Option<u64>,
    pub io_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub read_throughput_p95_bps: Option<f64>,
    pub write_throughput_p95_bps: Option<f64>,
    pub handshake_avg_ms: Option<f64>,
    pub success_rate: Option<f64>,
    pub sample_count: u64,
    pub updated_at_unix_ms: u64,
}

/// User-supplied overrides — the highest-precedence policy source
/// (`spec.md` §6 "Environment overrides"). Plain data so callers can
/// populate it from whatever configuration surface they use; the core
/// never reads environment variables directly.
#[derive(Debug, Clone, Default)]
pub struct UserOverrides {
    pub chunk_bytes: Option<u64>,
    pub io_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub inactivity_timeout_ms: Option<u64>,
    pub overall_deadline_ms: Option<u64>,
    pub force_reset: Option<bool>,
    pub quirks_path: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Partial64,
    Partial32,
    WholeObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    PropListPrelude,
    ObjectInfoPrelude,
}

/// Strategies latched by probe-and-latch on first use, stored on the
/// policy so subsequent calls skip straight to the known-good path
/// (`spec.md` §4.5 "Probe-and-latch").
#[derive(Debug, Clone, Default)]
pub struct FallbackSelections {
    pub enumeration: Option<EnumerationStrategy>,
    pub read: Option<ReadStrategy>,
    pub write: Option<WriteStrategy>,
}

#[derive(Debug, Clone)]
pub struct EffectiveTuning {
    pub max_chunk_bytes: u64,
    pub io_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub overall_deadline: Duration,
    pub stabilize: Duration,
    pub post_claim_stabilize: Duration,
    pub reset_on_open: bool,
    pub disable_event_pump: bool,
}

#[derive(Debug, Clone)]
pub struct TuningSources {
    pub max_chunk_bytes: Provenance,
    pub io_timeout: Provenance,
    pub handshake_timeout: Provenance,
    pub inactivity_timeout: Provenance,
    pub overall_deadline: Provenance,
    pub stabilize: Provenance,
    pub post_claim_stabilize: Provenance,
    pub reset_on_open: Provenance,
    pub disable_event_pump: Provenance,
}

#[derive(Debug, Clone, Copy)]
pub struct FlagsSource(pub Provenance);

/// The quirk resolver's full output: tuning, flags, fallback selections,
/// and per-field provenance, ready for the session actor to consume
/// (`spec.md` §4.7 "Effective tuning + policy").
#[derive(Debug, Clone)]
pub struct Policy {
    pub tuning: EffectiveTuning,
    pub tuning_sources: TuningSources,
    pub flags: QuirkFlags,
    pub flags_source: Provenance,
    pub hooks: Vec<Hook>,
    pub fallback: FallbackSelections,
    pub matched_quirk_id: Option<String>,
}

impl Policy {
    pub fn hook(&self, phase: HookPhase) -> Option<&Hook> {
        self.hooks.iter().find(|h| h.phase == phase)
    }

    pub fn busy_backoff(&self) -> BusyBackoff {
        self.hook(HookPhase::OnDeviceBusy)
            .and_then(|h| h.busy_backoff.clone())
            .unwrap_or_default()
    }
}

const DEFAULT_MAX_CHUNK_BYTES: u64 = 1024 * 1024;
const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_OVERALL_DEADLINE_MS: u64 = 120_000;
const DEFAULT_STABILIZE_MS: u64 = 0;
const DEFAULT_POST_CLAIM_STABILIZE_MS: u64 = 0;

/// Resolve a device's effective policy from its fingerprint, the quirk
/// database, an optional learned profile, and user overrides
/// (`spec.md` §4.7).
#[tracing::instrument(skip(db, learned, user), fields(vendor_id = fp.vendor_id, product_id = fp.product_id))]
pub fn resolve(
    fp: &DeviceFingerprint,
    db: Option<&QuirkDatabase>,
    learned: Option<&LearnedProfile>,
    user: &UserOverrides,
) -> Policy {
    let matched = db.and_then(|db| db.best_match(fp));

    let is_ptp_class = fp.interface_class == Some(PTP_INTERFACE_CLASS);

    // No-match synthesis: PTP-class devices get camera defaults, everything
    // else gets the conservative default (`spec.md` §4.7 "Matching").
    let (default_flags, default_read) = if matched.is_none() && is_ptp_class {
        (
            QuirkFlags {
                supports_get_object_prop_list: Some(true),
                supports_partial_read_32: Some(true),
                requires_kernel_detach: Some(false),
                ..Default::default()
            },
            ReadStrategy::Partial32,
        )
    } else {
        (
            QuirkFlags {
                supports_get_object_prop_list: Some(false),
                requires_kernel_detach: Some(false),
                ..Default::default()
            },
            ReadStrategy::WholeObject,
        )
    };

    let max_chunk_bytes = Merged::defaulted(DEFAULT_MAX_CHUNK_BYTES)
        .overlay(learned.and_then(|l| l.optimal_chunk_bytes), Provenance::Learned)
        .overlay(matched.and_then(|q| q.tuning.max_chunk_bytes), Provenance::Quirk)
        .overlay(user.chunk_bytes, Provenance::UserOverride);

    let io_timeout_ms = Merged::defaulted(DEFAULT_IO_TIMEOUT_MS)
        .overlay(learned.and_then(|l| l.io_timeout_ms), Provenance::Learned)
        .overlay(matched.and_then(|q| q.tuning.io_timeout_ms), Provenance::Quirk)
        .overlay(user.io_timeout_ms, Provenance::UserOverride);

    let handshake_timeout_ms = Merged::defaulted(DEFAULT_HANDSHAKE_TIMEOUT_MS)
        .overlay(learned.and_then(|l| l.handshake_timeout_ms), Provenance::Learned)
        .overlay(matched.and_then(|q| q.tuning.handshake_timeout_ms), Provenance::Quirk)
        .overlay(user.handshake_timeout_ms, Provenance::UserOverride);

    let inactivity_timeout_ms = Merged::defaulted(DEFAULT_INACTIVITY_TIMEOUT_MS)
        .overlay(matched.and_then(|q| q.tuning.inactivity_timeout_ms), Provenance::Quirk)
        .overlay(user.inactivity_timeout_ms, Provenance::UserOverride);

    let overall_deadline_ms = Merged::defaulted(DEFAULT_OVERALL_DEADLINE_MS)
        .overlay(matched.and_then(|q| q.tuning.overall_deadline_ms), Provenance::Quirk)
        .overlay(user.overall_deadline_ms, Provenance::UserOverride);

    let stabilize_ms = Merged::defaulted(DEFAULT_STABILIZE_MS)
        .overlay(matched.and_then(|q| q.tuning.stabilize_ms), Provenance::Quirk);

    let post_claim_stabilize_ms = Merged::defaulted(DEFAULT_POST_CLAIM_STABILIZE_MS)
        .overlay(matched.and_then(|q| q.tuning.post_claim_stabilize_ms), Provenance::Quirk);

    let reset_on_open = Merged::defaulted(false)
        .overlay(matched.and_then(|q| q.tuning.reset_on_open), Provenance::Quirk)
        .overlay(user.force_reset, Provenance::UserOverride);

    let disable_event_pump = Merged::defaulted(false)
        .overlay(matched.and_then(|q| q.tuning.disable_event_pump), Provenance::Quirk);

    let flags_source = if matched.is_some() { Provenance::Quirk } else { Provenance::Default };
    let flags = merge_flags(default_flags, matched.map(|q| &q.flags));

    let fallback = FallbackSelections {
        enumeration: None,
        read: Some(if flags.supports_partial_read_64 == Some(true) {
            ReadStrategy::Partial64
        } else {
            default_read
        }),
        write: None,
    };

    Policy {
        tuning: EffectiveTuning {
            max_chunk_bytes: max_chunk_bytes.value,
            io_timeout: Duration::from_millis(io_timeout_ms.value),
            handshake_timeout: Duration::from_millis(handshake_timeout_ms.value),
            inactivity_timeout: Duration::from_millis(inactivity_timeout_ms.value),
            overall_deadline: Duration::from_millis(overall_deadline_ms.value),
            stabilize: Duration::from_millis(stabilize_ms.value),
            post_claim_stabilize: Duration::from_millis(post_claim_stabilize_ms.value),
            reset_on_open: reset_on_open.value,
            disable_event_pump: disable_event_pump.value,
        },
        tuning_sources: TuningSources {
            max_chunk_bytes: max_chunk_bytes.source,
            io_timeout: io_timeout_ms.source,
            handshake_timeout: handshake_timeout_ms.source,
            inactivity_timeout: inactivity_timeout_ms.source,
            overall_deadline: overall_deadline_ms.source,
            stabilize: stabilize_ms.source,
            post_claim_stabilize: post_claim_stabilize_ms.source,
            reset_on_open: reset_on_open.source,
            disable_event_pump: disable_event_pump.source,
        },
        flags,
        flags_source,
        hooks: matched.map(|q| q.hooks.clone()).unwrap_or_default(),
        fallback,
        matched_quirk_id: matched.map(|q| q.id.clone()),
    }
}

fn merge_flags(base: QuirkFlags, quirk: Option<&QuirkFlags>) -> QuirkFlags {
    let Some(q) = quirk else { return base };
    QuirkFlags {
        reset_on_open: q.reset_on_open.or(base.reset_on_open),
        requires_kernel_detach: q.requires_kernel_detach.or(base.requires_kernel_detach),
        skip_ptp_reset: q.skip_ptp_reset.or(base.skip_ptp_reset),
        supports_partial_read_64: q.supports_partial_read_64.or(base.supports_partial_read_64),
        supports_partial_read_32: q.supports_partial_read_32.or(base.supports_partial_read_32),
        supports_partial_write: q.supports_partial_write.or(base.supports_partial_write),
        prefers_prop_list_enumeration: q.prefers_prop_list_enumeration.or(base.prefers_prop_list_enumeration),
        supports_get_object_prop_list: q.supports_get_object_prop_list.or(base.supports_get_object_prop_list),
        disable_event_pump: q.disable_event_pump.or(base.disable_event_pump),
        require_stabilization: q.require_stabilization.or(base.require_stabilization),
        write_to_subfolder_only: q.write_to_subfolder_only.or(base.write_to_subfolder_only),
        preferred_write_folder: q.preferred_write_folder.clone().or(base.preferred_write_folder.clone()),
        camera_class: q.camera_class.or(base.camera_class),
        no_zero_length_packets: q.no_zero_length_packets.or(base.no_zero_length_packets),
    }
}

/// `delay = clamp(base * 2^attempt * (1 +/- jitter), 50ms, 10s)`
/// (`spec.md` §4.3 "Busy backoff"). `jitter_sample` is in `[-1, 1]`; the
/// caller supplies it from whatever RNG it likes so this stays pure.
pub fn busy_backoff_delay(backoff: &BusyBackoff, attempt: u32, jitter_sample: f64) -> Duration {
    let base = backoff.base_ms as f64 * 2f64.powi(attempt as i32);
    let jittered = base * (1.0 + backoff.jitter * jitter_sample.clamp(-1.0, 1.0));
    let clamped = jittered.clamp(50.0, 10_000.0);
    Duration::from_millis(clamped.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quirk::QuirkDatabase;

    #[test]
    fn s6_quirk_match_resolves_stabilize_ms_with_quirk_provenance() {
        let json = r#"{
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
        }"#;
        let db = QuirkDatabase::parse(json).unwrap();
        let fp = DeviceFingerprint::new(0x2717, 0xff10);
        let policy = resolve(&fp, Some(&db), None, &UserOverrides::default());
        assert_eq!(policy.tuning.stabilize.as_millis(), 500);
        assert_eq!(policy.tuning_sources.stabilize, Provenance::Quirk);
    }

    #[test]
    fn s6_no_match_on_ptp_class_synthesizes_camera_defaults() {
        let mut fp = DeviceFingerprint::new(0xffff, 0xffff);
        fp.interface_class = Some(PTP_INTERFACE_CLASS);
        let policy = resolve(&fp, None, None, &UserOverrides::default());
        assert_eq!(policy.flags.supports_get_object_prop_list, Some(true));
        assert_eq!(policy.flags.requires_kernel_detach, Some(false));
    }

    #[test]
    fn user_override_beats_quirk_and_learned() {
        let fp = DeviceFingerprint::new(0x1234, 0x5678);
        let learned = LearnedProfile {
            optimal_chunk_bytes: Some(64 * 1024),
            ..Default::default()
        };
        let overrides = UserOverrides {
            chunk_bytes: Some(8 * 1024),
            ..Default::default()
        };
        let policy = resolve(&fp, None, Some(&learned), &overrides);
        assert_eq!(policy.tuning.max_chunk_bytes, 8 * 1024);
        assert_eq!(policy.tuning_sources.max_chunk_bytes, Provenance::UserOverride);
    }

    #[test]
    fn backoff_delay_is_clamped_to_the_50ms_10s_window() {
        let backoff = BusyBackoff {
            retries: 3,
            base_ms: 200,
            jitter: 0.2,
        };
        let short = busy_backoff_delay(&backoff, 0, 0.0);
        assert!(short.as_millis() >= 50);
        let long = busy_backoff_delay(&backoff, 20, 1.0);
        assert_eq!(long.as_millis(), 10_000);
    }
}
