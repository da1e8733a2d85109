//! The `GetDeviceInfo` dataset (`spec.md` §3).

use std::io::Cursor;

use crate::data::PtpRead;
use crate::command::StandardCommandCode;
use crate::Error;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_ex_id: u32,
    pub vendor_ex_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub image_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn decode(buf: &[u8]) -> Result<DeviceInfo, Error> {
        let mut cur = Cursor::new(buf);

        Ok(DeviceInfo {
            standard_version: cur.read_ptp_u16()?,
            vendor_ex_id: cur.read_ptp_u32()?,
            vendor_ex_version: cur.read_ptp_u16()?,
            vendor_extension_desc: cur.read_ptp_str()?,
            functional_mode: cur.read_ptp_u16()?,
            operations_supported: cur.read_ptp_u16_vec()?,
            events_supported: cur.read_ptp_u16_vec()?,
            device_properties_supported: cur.read_ptp_u16_vec()?,
            capture_formats: cur.read_ptp_u16_vec()?,
            image_formats: cur.read_ptp_u16_vec()?,
            manufacturer: cur.read_ptp_str()?,
            model: cur.read_ptp_str()?,
            device_version: cur.read_ptp_str()?,
            serial_number: cur.read_ptp_str()?,
        })
    }

    pub fn supports_operation(&self, code: StandardCommandCode) -> bool {
        use num_traits::ToPrimitive;
        code.to_u16()
            .map(|raw| self.operations_supported.contains(&raw))
            .unwrap_or(false)
    }

    pub fn supports_event(&self, code: u16) -> bool {
        self.events_supported.contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_sample() -> Vec<u8> {
        let mut buf = vec![];
        buf.extend_from_slice(&100u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        crate::data::write_ptp_str(&mut buf, "").unwrap();
        buf.extend_from_slice(&0u16.to_le_bytes());
        for ops in [vec![0x1004u16, 0x1005, 0x1007, 0x1008], vec![], vec![], vec![], vec![]] {
            buf.extend_from_slice(&(ops.len() as u32).to_le_bytes());
            for op in ops {
                buf.extend_from_slice(&op.to_le_bytes());
            }
        }
        crate::data::write_ptp_str(&mut buf, "TestCo").unwrap();
        crate::data::write_ptp_str(&mut buf, "TestDevice").unwrap();
        crate::data::write_ptp_str(&mut buf, "1.0").unwrap();
        crate::data::write_ptp_str(&mut buf, "SN123").unwrap();
        buf
    }

    #[test]
    fn decodes_device_info_matching_s1() {
        let buf = encode_sample();
        let info = DeviceInfo::decode(&buf).unwrap();
        assert_eq!(info.manufacturer, "TestCo");
        assert_eq!(info.model, "TestDevice");
        assert_eq!(info.serial_number, "SN123");
        assert!(info.supports_operation(StandardCommandCode::GetStorageIDs));
        assert!(info.supports_operation(StandardCommandCode::GetObjectHandles));
        assert!(!info.supports_operation(StandardCommandCode::SendObject));
    }

    #[test]
    fn truncated_buffer_yields_error_not_panic() {
        let buf = encode_sample();
        let truncated = &buf[..buf.len() - 3];
        assert!(DeviceInfo::decode(truncated).is_err());
    }
}
