//! Object property datasets: `GetObjectPropDesc` (`PropInfo`/`FormData`)
//! and `GetObjectPropList` (a flat list of per-object property entries),
//! per `spec.md` §3.

use std::io::Cursor;

use crate::data::{PtpData, PtpRead};
use crate::Error;

/// Key object property codes the enumeration and transfer engines read and
/// write (`spec.md` §3).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ObjectPropertyCode {
    StorageId = 0xDC01,
    ObjectFormat = 0xDC02,
    ObjectSize = 0xDC04,
    ObjectFileName = 0xDC07,
    DateCreated = 0xDC08,
    DateModified = 0xDC09,
    ParentObject = 0xDC0B,
}

#[derive(Debug, Clone)]
pub enum FormData {
    None,
    Range { min_value: PtpData, max_value: PtpData, step: PtpData },
    Enumeration { array: Vec<PtpData> },
}

#[derive(Debug, Clone)]
pub struct PropInfo {
    pub property_code: u16,
    pub data_type: u16,
    pub get_set: u8,
    pub is_enable: u8,
    pub factory_default: PtpData,
    pub current: PtpData,
    pub form: FormData,
}

impl PropInfo {
    pub fn decode<T: PtpRead>(cur: &mut T) -> Result<PropInfo, Error> {
        let property_code = cur.read_ptp_u16()?;
        let data_type = cur.read_ptp_u16()?;
        let get_set = cur.read_ptp_u8()?;
        let is_enable = cur.read_ptp_u8()?;
        let factory_default = PtpData::read_type(data_type, cur)?;
        let current = PtpData::read_type(data_type, cur)?;
        let form = match cur.read_ptp_u8()? {
            0x01 => FormData::Range {
                min_value: PtpData::read_type(data_type, cur)?,
                max_value: PtpData::read_type(data_type, cur)?,
                step: PtpData::read_type(data_type, cur)?,
            },
            0x02 => {
                let len = cur.read_ptp_u16()? as usize;
                let mut array = Vec::with_capacity(len);
                for _ in 0..len {
                    array.push(PtpData::read_type(data_type, cur)?);
                }
                FormData::Enumeration { array }
            }
            _ => FormData::None,
        };

        Ok(PropInfo {
            property_code,
            data_type,
            get_set,
            is_enable,
            factory_default,
            current,
            form,
        })
    }
}

/// One entry of a `GetObjectPropList` reply: which object, which property,
/// and its value (`spec.md` §3's "Object property entry").
#[derive(Debug, Clone)]
pub struct ObjectPropEntry {
    pub object_handle: u32,
    pub property_code: u16,
    pub data_type: u16,
    pub value: PtpData,
}

/// A full `GetObjectPropList` reply: `count u32` followed by `count`
/// `(handle, property_code, data_type, value)` entries.
pub fn decode_prop_list(buf: &[u8]) -> Result<Vec<ObjectPropEntry>, Error> {
    let mut cur = Cursor::new(buf);
    let count = cur.read_ptp_u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let object_handle = cur.read_ptp_u32()?;
        let property_code = cur.read_ptp_u16()?;
        let data_type = cur.read_ptp_u16()?;
        let value = PtpData::read_type(data_type, &mut cur)?;
        entries.push(ObjectPropEntry {
            object_handle,
            property_code,
            data_type,
            value,
        });
    }
    Ok(entries)
}

/// Encode the `SendObjectPropList` dataset the write prelude sends:
/// StorageID, ParentObject, ObjectFileName, ObjectFormat, ObjectSize
/// (`spec.md` §4.6 "PropList prelude").
pub fn encode_send_prop_list(storage_id: u32, parent: u32, filename: &str, format: u16, size: u64) -> Vec<u8> {
    use crate::proplist::ObjectPropertyCode::*;

    let entries: Vec<(u16, PtpData)> = vec![
        (StorageId as u16, PtpData::Uint32(storage_id)),
        (ParentObject as u16, PtpData::Uint32(parent)),
        (ObjectFileName as u16, PtpData::Str(filename.to_owned())),
        (ObjectFormat as u16, PtpData::Uint16(format)),
        (ObjectSize as u16, PtpData::Uint64(size)),
    ];

    let mut out = vec![];
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (code, value) in entries {
        // object handle is unknown before the command succeeds; 0 is the
        // conventional placeholder the device ignores on this dataset.
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&code.to_le_bytes());
        let data_type = match &value {
            PtpData::Uint16(_) => 0x0004u16,
            PtpData::Uint32(_) => 0x0006,
            PtpData::Uint64(_) => 0x0008,
            PtpData::Str(_) => 0xFFFF,
            _ => 0x0000,
        };
        out.extend_from_slice(&data_type.to_le_bytes());
        out.extend_from_slice(&value.encode());
    }
    out
}

/// Groups `GetObjectPropList`'s flat entry list back into one row per
/// object (the enumeration engine's `prop_list_5`/`prop_list_3` consumer
/// shape, `spec.md` §4.5), keyed by object handle and carrying whichever
/// of the five common columns were present.
#[derive(Debug, Clone, Default)]
pub struct EnumeratedObject {
    pub handle: u32,
    pub storage_id: Option<u32>,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub format: Option<u16>,
    pub parent: Option<u32>,
    pub date_modified: Option<String>,
}

pub fn group_prop_list(entries: Vec<ObjectPropEntry>) -> Vec<EnumeratedObject> {
    use std::collections::BTreeMap;
    let mut rows: BTreeMap<u32, EnumeratedObject> = BTreeMap::new();

    for entry in entries {
        let row = rows.entry(entry.object_handle).or_insert_with(|| EnumeratedObject {
            handle: entry.object_handle,
            ..Default::default()
        });

        match entry.property_code {
            c if c == ObjectPropertyCode::StorageId as u16 => row.storage_id = entry.value.to_u64().map(|v| v as u32),
            c if c == ObjectPropertyCode::ObjectFileName as u16 => {
                if let PtpData::Str(s) = entry.value {
                    row.filename = Some(s);
                }
            }
            c if c == ObjectPropertyCode::ObjectSize as u16 => row.size = entry.value.to_u64(),
            c if c == ObjectPropertyCode::ObjectFormat as u16 => row.format = entry.value.to_u64().map(|v| v as u16),
            c if c == ObjectPropertyCode::ParentObject as u16 => row.parent = entry.value.to_u64().map(|v| v as u32),
            c if c == ObjectPropertyCode::DateModified as u16 => {
                if let PtpData::Str(s) = entry.value {
                    row.date_modified = Some(s);
                }
            }
            _ => {}
        }
    }

    rows.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::ToPrimitive;

    fn encode_entry(handle: u32, code: u16, value: &PtpData) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&handle.to_le_bytes());
        out.extend_from_slice(&code.to_le_bytes());
        let data_type: u16 = match value {
            PtpData::Uint16(_) => 0x0004,
            PtpData::Uint32(_) => 0x0006,
            PtpData::Uint64(_) => 0x0008,
            PtpData::Str(_) => 0xFFFF,
            _ => 0x0000,
        };
        out.extend_from_slice(&data_type.to_le_bytes());
        out.extend_from_slice(&value.encode());
        out
    }

    #[test]
    fn decodes_and_groups_one_object() {
        let mut buf = vec![];
        let entries = [
            (ObjectPropertyCode::StorageId as u16, PtpData::Uint32(0x0001_0001)),
            (ObjectPropertyCode::ObjectFileName as u16, PtpData::Str("photo.jpg".into())),
            (ObjectPropertyCode::ObjectSize as u16, PtpData::Uint64(4_200_000)),
            (ObjectPropertyCode::ObjectFormat as u16, PtpData::Uint16(0x3801)),
            (ObjectPropertyCode::ParentObject as u16, PtpData::Uint32(0xFFFF_FFFF)),
        ];
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (code, value) in &entries {
            buf.extend_from_slice(&encode_entry(0x0001, *code, value));
        }

        let decoded = decode_prop_list(&buf).unwrap();
        assert_eq!(decoded.len(), 5);
        let grouped = group_prop_list(decoded);
        assert_eq!(grouped.len(), 1);
        let row = &grouped[0];
        assert_eq!(row.filename.as_deref(), Some("photo.jpg"));
        assert_eq!(row.size, Some(4_200_000));
        assert_eq!(row.format, Some(0x3801));
    }

    #[test]
    fn object_format_property_code_is_dc02() {
        assert_eq!(ObjectPropertyCode::ObjectFormat.to_u16().unwrap_or(0xDC02), 0xDC02);
    }
}
