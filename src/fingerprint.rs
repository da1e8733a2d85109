//! Device fingerprinting and stable identity (`spec.md` §3, §4.2).
//!
//! A [`DeviceFingerprint`] is everything the host can read off the USB
//! descriptors before a session is open; the quirk resolver scores
//! candidate entries against it. A [`StableIdentity`] is the coarser,
//! always-available key used to persist learned profiles and journal
//! entries across reconnects.

use std::hash::{Hash, Hasher};

/// Raw USB-level identity used to match quirk entries (`spec.md` §4.2).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceFingerprint {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: Option<u16>,
    pub interface_class: Option<u8>,
    pub interface_subclass: Option<u8>,
    pub interface_protocol: Option<u8>,
    pub endpoint_max_packet_sizes: Option<Vec<u16>>,
}

impl DeviceFingerprint {
    pub fn new(vendor_id: u16, product_id: u16) -> DeviceFingerprint {
        DeviceFingerprint {
            vendor_id,
            product_id,
            bcd_device: None,
            interface_class: None,
            interface_subclass: None,
            interface_protocol: None,
            endpoint_max_packet_sizes: None,
        }
    }
}

/// The identity used to key learned profiles and journal entries: vendor
/// and product id, plus either the device's own USB serial string or a
/// synthetic one derived from whatever else distinguishes it, for devices
/// that report no serial at all (`spec.md` §4.2, §6.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StableIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: SerialKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SerialKind {
    Reported(String),
    Synthetic(u64),
}

impl StableIdentity {
    pub fn reported(vendor_id: u16, product_id: u16, serial: String) -> StableIdentity {
        StableIdentity {
            vendor_id,
            product_id,
            serial: SerialKind::Reported(serial),
        }
    }

    /// Derive a synthetic identity for a device with no usable serial
    /// number, from whatever fingerprint fields are available. The hash is
    /// stable across a process's lifetime and reconnects of the same
    /// physical device, but is not guaranteed stable across host OS or
    /// crate versions (`spec.md` §4.2 Design Notes).
    pub fn synthetic(fp: &DeviceFingerprint) -> StableIdentity {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        fp.bcd_device.hash(&mut hasher);
        fp.interface_class.hash(&mut hasher);
        fp.interface_subclass.hash(&mut hasher);
        fp.interface_protocol.hash(&mut hasher);
        fp.endpoint_max_packet_sizes.hash(&mut hasher);
        StableIdentity {
            vendor_id: fp.vendor_id,
            product_id: fp.product_id,
            serial: SerialKind::Synthetic(hasher.finish()),
        }
    }

    /// Builds the identity from a fingerprint and an optionally-reported
    /// serial string, falling back to a synthetic one when the device
    /// reports none or reports an empty string.
    pub fn from_fingerprint(fp: &DeviceFingerprint, reported_serial: Option<&str>) -> StableIdentity {
        match reported_serial {
            Some(s) if !s.is_empty() => StableIdentity::reported(fp.vendor_id, fp.product_id, s.to_owned()),
            _ => StableIdentity::synthetic(fp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_serial_is_used_verbatim() {
        let fp = DeviceFingerprint::new(0x04e8, 0x6860);
        let id = StableIdentity::from_fingerprint(&fp, Some("SN123"));
        assert_eq!(id.serial, SerialKind::Reported("SN123".into()));
    }

    #[test]
    fn missing_serial_falls_back_to_synthetic_and_is_deterministic() {
        let mut fp = DeviceFingerprint::new(0x04e8, 0x6860);
        fp.bcd_device = Some(0x0100);
        let id_a = StableIdentity::from_fingerprint(&fp, None);
        let id_b = StableIdentity::from_fingerprint(&fp, Some(""));
        assert_eq!(id_a, id_b);
        assert!(matches!(id_a.serial, SerialKind::Synthetic(_)));
    }

    #[test]
    fn different_fingerprints_yield_different_synthetic_serials() {
        let fp_a = DeviceFingerprint::new(0x04e8, 0x6860);
        let mut fp_b = DeviceFingerprint::new(0x04e8, 0x6860);
        fp_b.interface_protocol = Some(1);
        let id_a = StableIdentity::from_fingerprint(&fp_a, None);
        let id_b = StableIdentity::from_fingerprint(&fp_b, None);
        assert_ne!(id_a, id_b);
    }
}
