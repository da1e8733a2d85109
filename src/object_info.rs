//! The object-info dataset (`spec.md` §3).

use std::io::Cursor;

use byteorder::WriteBytesExt;
use num_traits::{FromPrimitive, ToPrimitive};

use crate::data::PtpRead;
use crate::object::{AssociationCode, ObjectFormatCode, ASSOCIATION_FORMAT_CODE, GENERIC_FOLDER_ASSOCIATION};
use crate::Error;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: ObjectFormatCode,
    pub protection_status: u16,
    pub object_compressed_size: u32,
    pub thumb_format: ObjectFormatCode,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: AssociationCode,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl ObjectInfo {
    pub fn decode(buf: &[u8]) -> Result<ObjectInfo, Error> {
        let mut cur = Cursor::new(buf);

        Ok(ObjectInfo {
            storage_id: cur.read_ptp_u32()?,
            object_format: ObjectFormatCode::from_u16(cur.read_ptp_u16()?).ok_or(Error::BadObjectFormat)?,
            protection_status: cur.read_ptp_u16()?,
            object_compressed_size: cur.read_ptp_u32()?,
            thumb_format: ObjectFormatCode::from_u16(cur.read_ptp_u16()?).ok_or(Error::BadObjectFormat)?,
            thumb_compressed_size: cur.read_ptp_u32()?,
            thumb_pix_width: cur.read_ptp_u32()?,
            thumb_pix_height: cur.read_ptp_u32()?,
            image_pix_width: cur.read_ptp_u32()?,
            image_pix_height: cur.read_ptp_u32()?,
            image_bit_depth: cur.read_ptp_u32()?,
            parent_object: cur.read_ptp_u32()?,
            association_type: AssociationCode::from_u16(cur.read_ptp_u16()?).ok_or(Error::BadAssociationCode)?,
            association_desc: cur.read_ptp_u32()?,
            sequence_number: cur.read_ptp_u32()?,
            filename: cur.read_ptp_str()?,
            capture_date: cur.read_ptp_str()?,
            modification_date: cur.read_ptp_str()?,
            keywords: cur.read_ptp_str()?,
        })
    }

    pub fn encode<W: WriteBytesExt>(&self, mut w: W) -> Result<(), Error> {
        w.write_u32::<byteorder::LittleEndian>(self.storage_id)?;
        w.write_u16::<byteorder::LittleEndian>(self.object_format.to_u16().unwrap_or(0))?;
        w.write_u16::<byteorder::LittleEndian>(self.protection_status)?;
        w.write_u32::<byteorder::LittleEndian>(self.object_compressed_size)?;
        w.write_u16::<byteorder::LittleEndian>(self.thumb_format.to_u16().unwrap_or(0))?;
        w.write_u32::<byteorder::LittleEndian>(self.thumb_compressed_size)?;
        w.write_u32::<byteorder::LittleEndian>(self.thumb_pix_width)?;
        w.write_u32::<byteorder::LittleEndian>(self.thumb_pix_height)?;
        w.write_u32::<byteorder::LittleEndian>(self.image_pix_width)?;
        w.write_u32::<byteorder::LittleEndian>(self.image_pix_height)?;
        w.write_u32::<byteorder::LittleEndian>(self.image_bit_depth)?;
        w.write_u32::<byteorder::LittleEndian>(self.parent_object)?;
        w.write_u16::<byteorder::LittleEndian>(self.association_type.to_u16().unwrap_or(0))?;
        w.write_u32::<byteorder::LittleEndian>(self.association_desc)?;
        w.write_u32::<byteorder::LittleEndian>(self.sequence_number)?;
        crate::data::write_ptp_str(&mut w, &self.filename)?;
        crate::data::write_ptp_str(&mut w, &self.capture_date)?;
        crate::data::write_ptp_str(&mut w, &self.modification_date)?;
        crate::data::write_ptp_str(&mut w, &self.keywords)?;
        Ok(())
    }

    /// A folder has `format = 0x3001` and `size = 0` (`spec.md` §3).
    pub fn is_folder(&self) -> bool {
        self.object_format.is_folder()
    }

    /// Build the minimal object-info dataset for a new folder: format
    /// `0x3001`, association type `GenericFolder`, size 0 (`spec.md` §4.6
    /// "Folder creation").
    pub fn new_folder(storage_id: u32, parent: u32, name: &str) -> ObjectInfo {
        ObjectInfo {
            storage_id,
            object_format: ObjectFormatCode::from_u16(ASSOCIATION_FORMAT_CODE).expect("association code is valid"),
            protection_status: 0,
            object_compressed_size: 0,
            thumb_format: ObjectFormatCode::from_u16(0).unwrap_or(ObjectFormatCode::Reserved(0)),
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: parent,
            association_type: AssociationCode::from_u16(GENERIC_FOLDER_ASSOCIATION).expect("generic folder code is valid"),
            association_desc: 0,
            sequence_number: 0,
            filename: name.to_owned(),
            capture_date: String::new(),
            modification_date: String::new(),
            keywords: String::new(),
        }
    }

    /// Build the object-info dataset for a new file of the given size,
    /// used by the `SendObjectInfo` write prelude (`spec.md` §4.6).
    pub fn new_file(storage_id: u32, parent: u32, name: &str, size: u32, format: ObjectFormatCode) -> ObjectInfo {
        ObjectInfo {
            storage_id,
            object_format: format,
            protection_status: 0,
            object_compressed_size: size,
            thumb_format: ObjectFormatCode::from_u16(0).unwrap_or(ObjectFormatCode::Reserved(0)),
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: parent,
            association_type: AssociationCode::from_u16(0).expect("undefined association code is valid"),
            association_desc: 0,
            sequence_number: 0,
            filename: name.to_owned(),
            capture_date: String::new(),
            modification_date: String::new(),
            keywords: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_round_trips_through_encode_decode() {
        let folder = ObjectInfo::new_folder(0x0001_0001, 0xFFFF_FFFF, "DCIM");
        assert!(folder.is_folder());
        assert_eq!(folder.object_compressed_size, 0);

        let mut buf = vec![];
        folder.encode(&mut buf).unwrap();
        let decoded = ObjectInfo::decode(&buf).unwrap();
        assert!(decoded.is_folder());
        assert_eq!(decoded.filename, "DCIM");

        let mut buf2 = vec![];
        decoded.encode(&mut buf2).unwrap();
        assert_eq!(buf, buf2, "re-encoding must produce byte-identical output");
    }

    #[test]
    fn file_object_info_round_trips() {
        let file = ObjectInfo::new_file(0x0001_0001, 0xFFFF_FFFF, "photo.jpg", 4_200_000, ObjectFormatCode::from_u16(0x3801).unwrap());
        let mut buf = vec![];
        file.encode(&mut buf).unwrap();
        let decoded = ObjectInfo::decode(&buf).unwrap();
        assert!(!decoded.is_folder());
        assert_eq!(decoded.object_compressed_size, 4_200_000);
        assert_eq!(decoded.filename, "photo.jpg");
    }
}
