//! Storage identifiers and the storage info dataset (`spec.md` §3).

use std::fmt::Display;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::data::PtpRead;
use crate::Error;

/// A storage volume identifier. Unlike object handles, storage IDs persist
/// until the volume is ejected (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, serde::Serialize)]
pub struct StorageId(pub(crate) u32);

impl StorageId {
    pub fn new(raw: u32) -> StorageId {
        StorageId(raw)
    }

    /// `0xFFFFFFFF`: "all storages" on read paths, invalid on write paths
    /// (`spec.md` §3).
    pub fn all() -> StorageId {
        StorageId(0xFFFFFFFF)
    }

    pub fn is_all(self) -> bool {
        self.0 == 0xFFFFFFFF
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageId(0x{:08x})", self.0)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, serde::Serialize)]
pub enum StorageType {
    Undefined = 0x0000,
    FixedRom = 0x0001,
    RemovableRom = 0x0002,
    FixedRam = 0x0003,
    RemovableRam = 0x0004,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, serde::Serialize)]
pub enum FilesystemType {
    Undefined = 0x0000,
    GenericFlat = 0x0001,
    GenericHierarchical = 0x0002,
    Dcf = 0x0003,
}

/// Storage access capability. `0` = read/write, `1` = read-only with
/// deletion allowed, `2` = read-only, deletion not allowed (`spec.md` §3).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, serde::Serialize)]
pub enum AccessType {
    ReadWrite = 0x0000,
    ReadOnlyWithDeletion = 0x0001,
    ReadOnly = 0x0002,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageInfo {
    pub storage_type: StorageType,
    pub filesystem_type: FilesystemType,
    pub access_capability: AccessType,
    pub max_capacity: u64,
    pub free_space_in_bytes: u64,
    pub free_space_in_objects: u32,
    pub storage_description: String,
    pub volume_label: String,
}

impl StorageInfo {
    pub fn decode<T: PtpRead>(cur: &mut T) -> Result<StorageInfo, Error> {
        Ok(StorageInfo {
            storage_type: StorageType::from_u16(cur.read_ptp_u16()?)
                .ok_or_else(|| Error::Malformed("bad storage type".into()))?,
            filesystem_type: FilesystemType::from_u16(cur.read_ptp_u16()?)
                .ok_or_else(|| Error::Malformed("bad filesystem type".into()))?,
            access_capability: AccessType::from_u16(cur.read_ptp_u16()?)
                .ok_or_else(|| Error::Malformed("bad access capability".into()))?,
            max_capacity: cur.read_ptp_u64()?,
            free_space_in_bytes: cur.read_ptp_u64()?,
            free_space_in_objects: cur.read_ptp_u32()?,
            storage_description: cur.read_ptp_str()?,
            volume_label: cur.read_ptp_str()?,
        })
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.access_capability, AccessType::ReadWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn decodes_storage_info() {
        // S1: one storage 0x00010001 "Internal" cap 16 GB free 8 GB
        let mut buf = vec![];
        buf.extend_from_slice(&0x0004u16.to_le_bytes()); // RemovableRam
        buf.extend_from_slice(&0x0002u16.to_le_bytes()); // GenericHierarchical
        buf.extend_from_slice(&0x0000u16.to_le_bytes()); // ReadWrite
        buf.extend_from_slice(&(16_000_000_000u64).to_le_bytes());
        buf.extend_from_slice(&(8_000_000_000u64).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        crate::data::write_ptp_str(&mut buf, "Internal").unwrap();
        crate::data::write_ptp_str(&mut buf, "").unwrap();

        let mut cur = Cursor::new(buf);
        let info = StorageInfo::decode(&mut cur).unwrap();
        assert_eq!(info.storage_description, "Internal");
        assert_eq!(info.max_capacity, 16_000_000_000);
        assert_eq!(info.free_space_in_bytes, 8_000_000_000);
        assert!(info.is_writable());
    }
}
