//! The enumeration engine: probe-and-latch selection among the three
//! listing strategies, and paged batch delivery (`spec.md` §4.5).

use num_traits::ToPrimitive;
use tokio::sync::mpsc;

use crate::command::{CommandCode, StandardCommandCode};
use crate::link::{DataPhase, Link, TransactionRequest};
use crate::object::ObjectHandle;
use crate::proplist::{decode_prop_list, group_prop_list, EnumeratedObject};
use crate::response::{ResponseCode, StandardResponseCode};
use crate::storage_info::StorageId;
use crate::{Error, Phase};
use std::time::Duration;

/// Default upper bound on objects per emitted batch (`spec.md` §4.5
/// "Paged enumeration").
pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationStrategy {
    PropList5,
    PropList3,
    HandlesThenInfo,
}

impl EnumerationStrategy {
    /// The strategy order to probe, most-to-least preferred
    /// (`spec.md` §4.5).
    pub fn probe_order() -> [EnumerationStrategy; 3] {
        [
            EnumerationStrategy::PropList5,
            EnumerationStrategy::PropList3,
            EnumerationStrategy::HandlesThenInfo,
        ]
    }

    /// Default strategy to try first for a given interface class, absent a
    /// latched selection or quirk override (`spec.md` §4.5).
    pub fn default_for_interface_class(interface_class: u8, quirk_prefers_prop_list: bool) -> EnumerationStrategy {
        const ANDROID_VENDOR_CLASS: u8 = 0xFF;
        const PTP_CLASS: u8 = 0x06;
        match interface_class {
            PTP_CLASS => EnumerationStrategy::PropList5,
            ANDROID_VENDOR_CLASS if quirk_prefers_prop_list => EnumerationStrategy::PropList5,
            ANDROID_VENDOR_CLASS => EnumerationStrategy::HandlesThenInfo,
            _ => EnumerationStrategy::PropList5,
        }
    }
}

/// A batch of enumerated objects, sent over the paging channel
/// (`spec.md` §4.5 "Paged enumeration").
pub type Batch = Result<Vec<EnumeratedObject>, Error>;

async fn get_object_prop_list(
    link: &Link,
    storage: StorageId,
    parent: ObjectHandle,
    three_param_shape: bool,
    timeout: Duration,
) -> Result<Vec<EnumeratedObject>, Error> {
    let params = if three_param_shape {
        vec![storage.raw(), 0u32, parent.raw()]
    } else {
        vec![storage.raw(), 0u32, parent.raw(), 1u32, 0u32]
    };

    let mut payload = Vec::new();
    {
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            payload.extend_from_slice(chunk);
            Ok(())
        };
        let response = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetObjectPropList),
                params,
                data: DataPhase::In(&mut sink),
                io_timeout: timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
    }

    let entries = decode_prop_list(&payload)?;
    Ok(group_prop_list(entries))
}

async fn get_handles_then_info(
    link: &Link,
    storage: StorageId,
    parent: ObjectHandle,
    timeout: Duration,
) -> Result<Vec<EnumeratedObject>, Error> {
    let mut handles_buf = Vec::new();
    {
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            handles_buf.extend_from_slice(chunk);
            Ok(())
        };
        let response = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetObjectHandles),
                params: vec![storage.raw(), 0, parent.raw()],
                data: DataPhase::In(&mut sink),
                io_timeout: timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
    }

    use crate::data::PtpRead;
    let mut cur = std::io::Cursor::new(handles_buf);
    let handles = cur.read_ptp_u32_vec()?;

    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        let mut info_buf = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            info_buf.extend_from_slice(chunk);
            Ok(())
        };
        let response = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetObjectInfo),
                params: vec![handle],
                data: DataPhase::In(&mut sink),
                io_timeout: timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        let info = crate::object_info::ObjectInfo::decode(&info_buf)?;
        out.push(EnumeratedObject {
            handle,
            storage_id: Some(info.storage_id),
            filename: Some(info.filename),
            size: Some(info.object_compressed_size as u64),
            format: info.object_format.to_u16(),
            parent: Some(info.parent_object),
            date_modified: Some(info.modification_date),
        });
    }
    Ok(out)
}

fn reject_unless_ok(code: ResponseCode) -> Result<(), Error> {
    match code {
        ResponseCode::Standard(StandardResponseCode::Ok) => Ok(()),
        ResponseCode::Standard(StandardResponseCode::OperationNotSupported) => Err(Error::NotSupported("enumeration strategy")),
        ResponseCode::Standard(StandardResponseCode::InvalidParameter) => Err(Error::PreconditionFailed("invalid enumeration parameters".into())),
        other => Err(Error::from_response_code(other, None)),
    }
}

async fn try_strategy(
    link: &Link,
    strategy: EnumerationStrategy,
    storage: StorageId,
    parent: ObjectHandle,
    timeout: Duration,
) -> Result<Vec<EnumeratedObject>, Error> {
    match strategy {
        EnumerationStrategy::PropList5 => get_object_prop_list(link, storage, parent, false, timeout).await,
        EnumerationStrategy::PropList3 => get_object_prop_list(link, storage, parent, true, timeout).await,
        EnumerationStrategy::HandlesThenInfo => get_handles_then_info(link, storage, parent, timeout).await,
    }
}

/// Probe-and-latch: try strategies starting from `start`, in the standard
/// probe order, skipping ones already ruled out, until one succeeds or all
/// have failed. Returns the winning strategy alongside its first batch of
/// results (`spec.md` §4.5 "Probe-and-latch").
pub async fn probe_and_latch(
    link: &Link,
    start: EnumerationStrategy,
    storage: StorageId,
    parent: ObjectHandle,
    timeout: Duration,
) -> Result<(EnumerationStrategy, Vec<EnumeratedObject>), Error> {
    let mut order: Vec<EnumerationStrategy> = EnumerationStrategy::probe_order().into_iter().collect();
    if let Some(pos) = order.iter().position(|s| *s == start) {
        order.rotate_left(pos);
    }

    let mut last_err = None;
    for strategy in order {
        match try_strategy(link, strategy, storage, parent, timeout).await {
            Ok(objects) => return Ok((strategy, objects)),
            Err(e @ Error::NotSupported(_)) | Err(e @ Error::PreconditionFailed(_)) => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(Error::NotSupported("no enumeration strategy succeeded")))
}

/// List a directory using an already-latched strategy, delivering results
/// in batches of at most [`DEFAULT_BATCH_SIZE`] over an mpsc channel so
/// callers never have to hold the whole directory in memory at once
/// (`spec.md` §4.5 "Paged enumeration").
pub async fn list_paged(
    link: &Link,
    strategy: EnumerationStrategy,
    storage: StorageId,
    parent: ObjectHandle,
    timeout: Duration,
    batch_size: usize,
) -> mpsc::Receiver<Batch> {
    let (tx, rx) = mpsc::channel(4);
    let batch_size = batch_size.max(1);

    match try_strategy(link, strategy, storage, parent, timeout).await {
        Ok(objects) => {
            for chunk in objects.chunks(batch_size) {
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
        }
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeTransport;
    use std::sync::Arc;

    fn encode_prop_list_payload() -> Vec<u8> {
        use crate::data::PtpData;
        use crate::proplist::ObjectPropertyCode::*;

        let rows: [(u32, u16, PtpData); 5] = [
            (1, StorageId as u16, PtpData::Uint32(0x0001_0001)),
            (1, ObjectFileName as u16, PtpData::Str("a.jpg".into())),
            (1, ObjectSize as u16, PtpData::Uint64(100)),
            (1, ObjectFormat as u16, PtpData::Uint16(0x3801)),
            (1, ParentObject as u16, PtpData::Uint32(0xFFFF_FFFF)),
        ];
        let mut buf = vec![];
        buf.extend_from_slice(&(rows.len() as u32).to_le_bytes());
        for (handle, code, value) in &rows {
            buf.extend_from_slice(&handle.to_le_bytes());
            buf.extend_from_slice(&code.to_le_bytes());
            let data_type: u16 = match value {
                PtpData::Uint16(_) => 0x0004,
                PtpData::Uint32(_) => 0x0006,
                PtpData::Uint64(_) => 0x0008,
                PtpData::Str(_) => 0xFFFF,
                _ => 0,
            };
            buf.extend_from_slice(&data_type.to_le_bytes());
            buf.extend_from_slice(&value.encode());
        }
        buf
    }

    #[tokio::test]
    async fn prop_list_5_succeeds_on_first_try() {
        let fake = FakeTransport::new();
        let payload = encode_prop_list_payload();
        fake.queue_data(StandardCommandCode::GetObjectPropList as u16, 1, &payload);
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        let link = Link::new(Arc::new(fake), false);

        let (strategy, objects) = probe_and_latch(
            &link,
            EnumerationStrategy::PropList5,
            StorageId::new(0x0001_0001),
            ObjectHandle::root(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(strategy, EnumerationStrategy::PropList5);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].filename.as_deref(), Some("a.jpg"));
    }

    #[tokio::test]
    async fn not_supported_falls_through_to_the_next_strategy() {
        let fake = FakeTransport::new();
        // first attempt (prop_list_5): NotSupported, no data phase
        fake.queue_response(StandardResponseCode::OperationNotSupported as u16, vec![]);
        // second attempt (prop_list_3): succeeds
        let payload = encode_prop_list_payload();
        fake.queue_data(StandardCommandCode::GetObjectPropList as u16, 2, &payload);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 2);
        let link = Link::new(Arc::new(fake), false);

        let (strategy, objects) = probe_and_latch(
            &link,
            EnumerationStrategy::PropList5,
            StorageId::new(0x0001_0001),
            ObjectHandle::root(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(strategy, EnumerationStrategy::PropList3);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn default_strategy_matches_interface_class_table() {
        assert_eq!(
            EnumerationStrategy::default_for_interface_class(0x06, false),
            EnumerationStrategy::PropList5
        );
        assert_eq!(
            EnumerationStrategy::default_for_interface_class(0xFF, false),
            EnumerationStrategy::HandlesThenInfo
        );
        assert_eq!(
            EnumerationStrategy::default_for_interface_class(0xFF, true),
            EnumerationStrategy::PropList5
        );
    }
}
