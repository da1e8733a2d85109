//! Object handles and format/association codes (`spec.md` §3).

use std::fmt::Display;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// A session-scoped object identifier. Handles are valid only within the
/// open session that returned them (`spec.md` §3's "Object handles are
/// scoped to a single open session" invariant, and §1's non-goal of
/// cross-session object identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct ObjectHandle(pub(crate) u32);

impl ObjectHandle {
    pub fn new(raw: u32) -> ObjectHandle {
        ObjectHandle(raw)
    }

    /// `0xFFFFFFFF` as a parent handle means "root" on read paths
    /// (`spec.md` §3).
    pub fn root() -> ObjectHandle {
        ObjectHandle(0xFFFFFFFF)
    }

    pub fn is_root(self) -> bool {
        self.0 == 0xFFFFFFFF
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHandle(0x{:08x})", self.0)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, ToPrimitive, serde::Serialize)]
pub enum StandardObjectFormatCode {
    UndefinedNonImage = 0x3000,
    Association,
    Script,
    Executable,
    Text,
    Html,
    Dpof,
    Aiff,
    Wav,
    Mp3,
    Avi,
    Mpeg,
    Asf,
    UndefinedImage = 0x3800,
    ExifJpeg,
    TiffEp,
    FlashPix,
    Bmp,
    Ciff,
    UndefinedReserved,
    Gif,
    Jfif,
    Pcd,
    Pict,
    Png,
    UndefinedReserved2,
    Tiff,
    TiffIt,
    Jp2,
    Jpx,
}

pub const ASSOCIATION_FORMAT_CODE: u16 = 0x3001;
pub const GENERIC_FOLDER_ASSOCIATION: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ObjectFormatCode {
    Standard(StandardObjectFormatCode),
    Reserved(u16),
    Vendor(u16),
    ImageOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormatCategory {
    Ancillary,
    Image,
    Unknown,
}

impl ObjectFormatCode {
    pub fn category(&self) -> ObjectFormatCategory {
        use StandardObjectFormatCode::*;
        match self {
            ObjectFormatCode::Standard(sofc) => match sofc {
                UndefinedNonImage | Association | Script | Executable | Text | Html | Dpof
                | Aiff | Wav | Mp3 | Avi | Mpeg | Asf => ObjectFormatCategory::Ancillary,
                UndefinedImage | ExifJpeg | TiffEp | FlashPix | Bmp | Ciff | UndefinedReserved
                | Gif | Jfif | Pcd | Pict | Png | UndefinedReserved2 | Tiff | TiffIt | Jp2
                | Jpx => ObjectFormatCategory::Image,
            },
            ObjectFormatCode::ImageOnly => ObjectFormatCategory::Image,
            _ => ObjectFormatCategory::Unknown,
        }
    }

    /// `true` for `format = 0x3001` (Association), the PTP term for a
    /// folder (`spec.md` §3).
    pub fn is_folder(&self) -> bool {
        self.to_u64() == Some(ASSOCIATION_FORMAT_CODE as u64)
    }
}

impl FromPrimitive for ObjectFormatCode {
    fn from_i64(_: i64) -> Option<Self> {
        None
    }

    fn from_u64(n: u64) -> Option<Self> {
        let n = n as u16;

        const MSN_MASK: u16 = 0b1111_0000_0000_0000;
        const RESERVED_MSN: u16 = 0b0011;
        const VENDOR_MSN: u16 = 0b1011;

        if let Some(ofc) = StandardObjectFormatCode::from_u16(n) {
            return Some(ObjectFormatCode::Standard(ofc));
        }

        if n == 0xFFFF {
            return Some(ObjectFormatCode::ImageOnly);
        }

        let msn = (n & MSN_MASK) >> 12;

        if msn == VENDOR_MSN {
            return Some(ObjectFormatCode::Vendor(n));
        }

        if msn == RESERVED_MSN {
            return Some(ObjectFormatCode::Reserved(n));
        }

        None
    }
}

impl ToPrimitive for ObjectFormatCode {
    fn to_i64(&self) -> Option<i64> {
        None
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            ObjectFormatCode::Standard(ofc) => ofc.to_u64(),
            ObjectFormatCode::Reserved(n) | ObjectFormatCode::Vendor(n) => Some(*n as u64),
            ObjectFormatCode::ImageOnly => Some(0xFFFF),
        }
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, serde::Serialize)]
pub enum StandardAssociationCode {
    Undefined = 0x0000,
    GenericFolder,
    Album,
    TimeSequence,
    PanoramicHorizontal,
    PanoramicVertical,
    Panoramic2D,
    AncillaryData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AssociationCode {
    Standard(StandardAssociationCode),
    Reserved(u16),
    Vendor(u16),
}

impl FromPrimitive for AssociationCode {
    fn from_i64(_: i64) -> Option<Self> {
        None
    }

    fn from_u64(n: u64) -> Option<Self> {
        let n = n as u16;

        if let Some(ac) = StandardAssociationCode::from_u16(n) {
            return Some(AssociationCode::Standard(ac));
        }

        if (n >> 15) & 1 == 1 {
            return Some(AssociationCode::Vendor(n));
        }

        Some(AssociationCode::Reserved(n))
    }
}

impl ToPrimitive for AssociationCode {
    fn to_i64(&self) -> Option<i64> {
        None
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            AssociationCode::Standard(ac) => ac.to_u64(),
            AssociationCode::Reserved(n) | AssociationCode::Vendor(n) => Some(*n as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_format_is_recognized() {
        let fmt = ObjectFormatCode::from_u16(ASSOCIATION_FORMAT_CODE).unwrap();
        assert!(fmt.is_folder());
        assert_eq!(fmt.category(), ObjectFormatCategory::Ancillary);
    }

    #[test]
    fn root_handle_is_all_ones() {
        assert!(ObjectHandle::root().is_root());
        assert_eq!(ObjectHandle::root().raw(), 0xFFFF_FFFF);
    }

    #[test]
    fn vendor_format_codes_round_trip() {
        let fmt = ObjectFormatCode::from_u16(0xb001).unwrap();
        assert_eq!(fmt, ObjectFormatCode::Vendor(0xb001));
        assert_eq!(fmt.to_u64(), Some(0xb001));
    }
}
