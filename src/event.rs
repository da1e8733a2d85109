use std::fmt::{self, LowerHex};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::Error;

#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash, serde::Serialize)]
pub enum EventCode {
    Standard(StandardEventCode),
    Vendor(u16),
    Reserved(u16),
}

impl FromPrimitive for EventCode {
    fn from_i64(_: i64) -> Option<Self> {
        None
    }

    fn from_u64(n: u64) -> Option<Self> {
        let n = n as u16;

        const MSN_MASK: u16 = 0b1111_0000_0000_0000;
        const RESERVED_MSN: u16 = 0b0100;
        const VENDOR_MSN: u16 = 0b1100;

        if let Some(ec) = StandardEventCode::from_u16(n) {
            return Some(EventCode::Standard(ec));
        }

        let msn = (n & MSN_MASK) >> 12;

        if msn == VENDOR_MSN {
            return Some(EventCode::Vendor(n));
        }

        if msn == RESERVED_MSN {
            return Some(EventCode::Reserved(n));
        }

        None
    }
}

impl ToPrimitive for EventCode {
    fn to_i64(&self) -> Option<i64> {
        None
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            EventCode::Standard(ec) => ec.to_u64(),
            EventCode::Reserved(n) | EventCode::Vendor(n) => Some(*n as u64),
        }
    }
}

impl LowerHex for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCode::Standard(code) => fmt::LowerHex::fmt(code, f),
            EventCode::Reserved(code) | EventCode::Vendor(code) => fmt::LowerHex::fmt(code, f),
        }
    }
}

impl From<StandardEventCode> for EventCode {
    fn from(code: StandardEventCode) -> Self {
        EventCode::Standard(code)
    }
}

#[repr(u16)]
#[derive(FromPrimitive, ToPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash, serde::Serialize)]
pub enum StandardEventCode {
    Undefined = 0x4000,
    CancelTransaction,
    ObjectAdded,
    ObjectRemoved,
    StoreAdded,
    StoreRemoved,
    DevicePropChanged,
    ObjectInfoChanged,
    StoreFull,
    DeviceReset,
    StorageInfoChanged,
    CaptureComplete,
    UnreportedStatus,
}

impl LowerHex for StandardEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = self.to_u16().unwrap();
        fmt::LowerHex::fmt(&val, f)
    }
}

/// A decoded PTP event container: code plus up to 3 `u32` parameters
/// (`spec.md` §3's container shape applied to `type = Event`).
#[derive(Debug, Clone, Hash, serde::Serialize)]
pub struct Event {
    pub code: EventCode,
    pub params: Vec<u32>,
}

impl Event {
    pub fn new(code: u16, params: &[u8]) -> Result<Self, Error> {
        Ok(Event {
            code: EventCode::from_u16(code).ok_or(Error::BadEventCode)?,
            params: params
                .chunks_exact(4)
                .map(|c| {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(c);
                    u32::from_le_bytes(b)
                })
                .collect(),
        })
    }

    /// The object handle an `ObjectAdded`/`ObjectRemoved`/`ObjectInfoChanged`
    /// event carries as its first parameter, if any.
    pub fn object_handle(&self) -> Option<u32> {
        matches!(
            self.code,
            EventCode::Standard(
                StandardEventCode::ObjectAdded
                    | StandardEventCode::ObjectRemoved
                    | StandardEventCode::ObjectInfoChanged
            )
        )
        .then(|| self.params.first().copied())
        .flatten()
    }

    /// A coalescing key: events that differ only in arrival time but refer
    /// to the same code+params are duplicates within the pump's 50 ms
    /// window (`spec.md` §4.9).
    pub fn dedup_key(&self) -> (u16, Vec<u32>) {
        (self.code.to_u16().unwrap_or(0xFFFF), self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_object_added_with_one_param() {
        let handle: u32 = 0x0001_0002;
        let event = Event::new(0x4002, &handle.to_le_bytes()).unwrap();
        assert_eq!(event.code, EventCode::Standard(StandardEventCode::ObjectAdded));
        assert_eq!(event.object_handle(), Some(handle));
    }

    #[test]
    fn bad_event_code_is_rejected() {
        // 0x5000 is neither standard, nor reserved (0x4xxx), nor vendor (0xCxxx)
        assert!(Event::new(0x5000, &[]).is_err());
    }
}
