//! Mid-level dataset codec: little-endian primitives, PTP strings, and the
//! property-value dispatch used by `GetObjectPropList`/`GetDevicePropDesc`
//! datasets (`spec.md` §3, §4.1).
//!
//! This builds on [`crate::container`]'s pure offset-based decoders by
//! layering a `Cursor`-based reader (as the teacher did) that turns
//! truncation into an `Err(Error::Io(..))` via `byteorder`'s `UnexpectedEof`
//! rather than panicking — no out-of-bounds read is possible through this
//! trait.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::ToPrimitive;

use crate::Error;

pub trait PtpRead: ReadBytesExt {
    fn read_ptp_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_u8()?)
    }

    fn read_ptp_i8(&mut self) -> Result<i8, Error> {
        Ok(self.read_i8()?)
    }

    fn read_ptp_u16(&mut self) -> Result<u16, Error> {
        Ok(self.read_u16::<LittleEndian>()?)
    }

    fn read_ptp_i16(&mut self) -> Result<i16, Error> {
        Ok(self.read_i16::<LittleEndian>()?)
    }

    fn read_ptp_u32(&mut self) -> Result<u32, Error> {
        Ok(self.read_u32::<LittleEndian>()?)
    }

    fn read_ptp_i32(&mut self) -> Result<i32, Error> {
        Ok(self.read_i32::<LittleEndian>()?)
    }

    fn read_ptp_u64(&mut self) -> Result<u64, Error> {
        Ok(self.read_u64::<LittleEndian>()?)
    }

    fn read_ptp_i64(&mut self) -> Result<i64, Error> {
        Ok(self.read_i64::<LittleEndian>()?)
    }

    fn read_ptp_u128(&mut self) -> Result<(u64, u64), Error> {
        let lo = self.read_u64::<LittleEndian>()?;
        let hi = self.read_u64::<LittleEndian>()?;
        Ok((lo, hi))
    }

    fn read_ptp_i128(&mut self) -> Result<(u64, u64), Error> {
        let lo = self.read_u64::<LittleEndian>()?;
        let hi = self.read_u64::<LittleEndian>()?;
        Ok((lo, hi))
    }

    #[inline(always)]
    fn read_ptp_vec<T: Sized, U: Fn(&mut Self) -> Result<T, Error>>(
        &mut self,
        func: U,
    ) -> Result<Vec<T>, Error> {
        let len = self.read_u32::<LittleEndian>()? as usize;
        (0..len).map(|_| func(self)).collect()
    }

    fn read_ptp_u8_vec(&mut self) -> Result<Vec<u8>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_u8())
    }

    fn read_ptp_i8_vec(&mut self) -> Result<Vec<i8>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_i8())
    }

    fn read_ptp_u16_vec(&mut self) -> Result<Vec<u16>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_u16())
    }

    fn read_ptp_i16_vec(&mut self) -> Result<Vec<i16>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_i16())
    }

    fn read_ptp_u32_vec(&mut self) -> Result<Vec<u32>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_u32())
    }

    fn read_ptp_i32_vec(&mut self) -> Result<Vec<i32>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_i32())
    }

    fn read_ptp_u64_vec(&mut self) -> Result<Vec<u64>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_u64())
    }

    fn read_ptp_i64_vec(&mut self) -> Result<Vec<i64>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_i64())
    }

    fn read_ptp_u128_vec(&mut self) -> Result<Vec<(u64, u64)>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_u128())
    }

    fn read_ptp_i128_vec(&mut self) -> Result<Vec<(u64, u64)>, Error> {
        self.read_ptp_vec(|cur| cur.read_ptp_i128())
    }

    /// A PTP string: a one-byte code-unit count `N` (including the trailing
    /// NUL) followed by `N` UTF-16LE code units. `N == 0` is the empty
    /// string with no code units at all (`spec.md` §3).
    fn read_ptp_str(&mut self) -> Result<String, Error> {
        let len = self.read_u8()?;
        if len == 0 {
            return Ok(String::new());
        }
        let data: Vec<u16> = (0..(len - 1))
            .map(|_| self.read_u16::<LittleEndian>())
            .collect::<Result<Vec<_>, _>>()?;
        self.read_u16::<LittleEndian>()?; // trailing NUL
        String::from_utf16(&data).map_err(|_| Error::Malformed(format!("invalid utf-16 data: {data:?}")))
    }

    fn expect_end(&mut self) -> Result<(), Error>;
}

impl<T: AsRef<[u8]>> PtpRead for Cursor<T> {
    fn expect_end(&mut self) -> Result<(), Error> {
        let len = self.get_ref().as_ref().len();
        if len as u64 != self.position() {
            Err(Error::Malformed(format!(
                "container had {len} bytes, decoder consumed {}",
                self.position()
            )))
        } else {
            Ok(())
        }
    }
}

/// Write a PTP string. Strings longer than 254 UTF-16 code units cannot be
/// represented (the length prefix is one byte including the trailing NUL)
/// and are truncated to fit, matching the round-trip domain in `spec.md`
/// §4.1 ("≤ 254 code units after NUL-padding").
pub fn write_ptp_str<W: WriteBytesExt>(mut w: W, s: &str) -> Result<(), Error> {
    if s.is_empty() {
        w.write_u8(0)?;
        return Ok(());
    }
    let mut units: Vec<u16> = s.encode_utf16().collect();
    if units.len() > 254 {
        units.truncate(254);
    }
    w.write_u8((units.len() + 1) as u8)?;
    for unit in &units {
        w.write_u16::<LittleEndian>(*unit)?;
    }
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

#[derive(Debug, Eq, PartialEq, PartialOrd, Clone)]
pub enum PtpData {
    Undef,
    Int8(i8),
    Uint8(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Int128((u64, u64)),
    Uint128((u64, u64)),
    AInt8(Vec<i8>),
    AUint8(Vec<u8>),
    AInt16(Vec<i16>),
    AUint16(Vec<u16>),
    AInt32(Vec<i32>),
    AUint32(Vec<u32>),
    AInt64(Vec<i64>),
    AUint64(Vec<u64>),
    AInt128(Vec<(u64, u64)>),
    AUint128(Vec<(u64, u64)>),
    Str(String),
}

impl PtpData {
    pub fn encode(&self) -> Vec<u8> {
        use PtpData::*;
        let mut out = vec![];
        match self {
            Undef => {}
            Int8(val) => {
                out.write_i8(*val).ok();
            }
            Uint8(val) => {
                out.write_u8(*val).ok();
            }
            Int16(val) => {
                out.write_i16::<LittleEndian>(*val).ok();
            }
            Uint16(val) => {
                out.write_u16::<LittleEndian>(*val).ok();
            }
            Int32(val) => {
                out.write_i32::<LittleEndian>(*val).ok();
            }
            Uint32(val) => {
                out.write_u32::<LittleEndian>(*val).ok();
            }
            Int64(val) => {
                out.write_i64::<LittleEndian>(*val).ok();
            }
            Uint64(val) => {
                out.write_u64::<LittleEndian>(*val).ok();
            }
            Int128((lo, hi)) | Uint128((lo, hi)) => {
                out.write_u64::<LittleEndian>(*lo).ok();
                out.write_u64::<LittleEndian>(*hi).ok();
            }
            AInt8(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i8(*item).ok();
                }
            }
            AUint8(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u8(*item).ok();
                }
            }
            AInt16(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i16::<LittleEndian>(*item).ok();
                }
            }
            AUint16(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u16::<LittleEndian>(*item).ok();
                }
            }
            AInt32(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i32::<LittleEndian>(*item).ok();
                }
            }
            AUint32(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u32::<LittleEndian>(*item).ok();
                }
            }
            AInt64(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i64::<LittleEndian>(*item).ok();
                }
            }
            AUint64(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u64::<LittleEndian>(*item).ok();
                }
            }
            AInt128(val) | AUint128(val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for &(lo, hi) in val {
                    out.write_u64::<LittleEndian>(lo).ok();
                    out.write_u64::<LittleEndian>(hi).ok();
                }
            }
            Str(val) => {
                write_ptp_str(&mut out, val).ok();
            }
        }
        out
    }

    /// Dispatch on a PTP data-type tag: the low byte family selects width
    /// and signedness, bit `0x4000` switches to a count-prefixed array of
    /// the base type, and `0xFFFF` is a PTP string. Unknown data types
    /// decode to [`PtpData::Undef`] (`spec.md` §4.1).
    pub fn read_type<T: PtpRead>(kind: u16, reader: &mut T) -> Result<PtpData, Error> {
        use PtpData::*;
        Ok(match kind {
            0x0001 => Int8(reader.read_ptp_i8()?),
            0x0002 => Uint8(reader.read_ptp_u8()?),
            0x0003 => Int16(reader.read_ptp_i16()?),
            0x0004 => Uint16(reader.read_ptp_u16()?),
            0x0005 => Int32(reader.read_ptp_i32()?),
            0x0006 => Uint32(reader.read_ptp_u32()?),
            0x0007 => Int64(reader.read_ptp_i64()?),
            0x0008 => Uint64(reader.read_ptp_u64()?),
            0x0009 => Int128(reader.read_ptp_i128()?),
            0x000A => Uint128(reader.read_ptp_u128()?),
            0x4001 => AInt8(reader.read_ptp_i8_vec()?),
            0x4002 => AUint8(reader.read_ptp_u8_vec()?),
            0x4003 => AInt16(reader.read_ptp_i16_vec()?),
            0x4004 => AUint16(reader.read_ptp_u16_vec()?),
            0x4005 => AInt32(reader.read_ptp_i32_vec()?),
            0x4006 => AUint32(reader.read_ptp_u32_vec()?),
            0x4007 => AInt64(reader.read_ptp_i64_vec()?),
            0x4008 => AUint64(reader.read_ptp_u64_vec()?),
            0x4009 => AInt128(reader.read_ptp_i128_vec()?),
            0x400A => AUint128(reader.read_ptp_u128_vec()?),
            0xFFFF => Str(reader.read_ptp_str()?),
            _ => Undef,
        })
    }
}

impl ToPrimitive for PtpData {
    fn to_i64(&self) -> Option<i64> {
        match self {
            PtpData::Int8(v) => Some(*v as i64),
            PtpData::Uint8(v) => Some(*v as i64),
            PtpData::Int16(v) => Some(*v as i64),
            PtpData::Uint16(v) => Some(*v as i64),
            PtpData::Int32(v) => Some(*v as i64),
            PtpData::Uint32(v) => Some(*v as i64),
            PtpData::Int64(v) => Some(*v),
            _ => None,
        }
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            PtpData::Uint8(v) => Some(*v as u64),
            PtpData::Uint16(v) => Some(*v as u64),
            PtpData::Uint32(v) => Some(*v as u64),
            PtpData::Uint64(v) => Some(*v),
            _ => None,
        }
    }
}

macro_rules! impl_from_for_ptp_data {
    ($t:ty, $variant:ident) => {
        impl From<$t> for PtpData {
            fn from(value: $t) -> Self {
                PtpData::$variant(value)
            }
        }
    };
}

impl_from_for_ptp_data!(i8, Int8);
impl_from_for_ptp_data!(u8, Uint8);
impl_from_for_ptp_data!(i16, Int16);
impl_from_for_ptp_data!(u16, Uint16);
impl_from_for_ptp_data!(i32, Int32);
impl_from_for_ptp_data!(u32, Uint32);
impl_from_for_ptp_data!(i64, Int64);
impl_from_for_ptp_data!(u64, Uint64);

impl From<&str> for PtpData {
    fn from(value: &str) -> Self {
        PtpData::Str(value.to_owned())
    }
}

impl From<String> for PtpData {
    fn from(value: String) -> Self {
        PtpData::Str(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_round_trips_as_single_zero_byte() {
        let mut out = vec![];
        write_ptp_str(&mut out, "").unwrap();
        assert_eq!(out, vec![0]);
        let mut cur = Cursor::new(out);
        assert_eq!(cur.read_ptp_str().unwrap(), "");
    }

    #[test]
    fn ascii_string_round_trips() {
        let mut out = vec![];
        write_ptp_str(&mut out, "photo.jpg").unwrap();
        let mut cur = Cursor::new(out);
        assert_eq!(cur.read_ptp_str().unwrap(), "photo.jpg");
    }

    #[test]
    fn non_ascii_string_round_trips() {
        let mut out = vec![];
        write_ptp_str(&mut out, "héllo").unwrap();
        let mut cur = Cursor::new(out);
        assert_eq!(cur.read_ptp_str().unwrap(), "héllo");
    }

    #[test]
    fn property_value_dispatch_covers_array_bit() {
        let mut buf = vec![];
        buf.write_u32::<LittleEndian>(3).unwrap();
        buf.write_u16::<LittleEndian>(10).unwrap();
        buf.write_u16::<LittleEndian>(20).unwrap();
        buf.write_u16::<LittleEndian>(30).unwrap();
        let mut cur = Cursor::new(buf);
        let value = PtpData::read_type(0x4004, &mut cur).unwrap();
        assert_eq!(value, PtpData::AUint16(vec![10, 20, 30]));
    }

    #[test]
    fn unknown_data_type_decodes_to_undef() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        assert_eq!(PtpData::read_type(0x1234, &mut cur).unwrap(), PtpData::Undef);
    }
}
