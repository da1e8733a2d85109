//! The transaction layer: one PTP request/response cycle over a
//! [`Transport`], with transaction-id bookkeeping, zero-length-packet
//! handling, and stall recovery (`spec.md` §4.3).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use num_traits::ToPrimitive;

use crate::command::CommandCode;
use crate::container::{Container, ContainerType};
use crate::response::{ResponseCode, StandardResponseCode};
use crate::transport::{Transport, TransportError, TransportPhase};
use crate::{Error, Phase};

/// Where the data phase's bytes come from or go to.
pub enum DataPhase<'a> {
    None,
    Out(&'a [u8]),
    /// Drive reads via a callback so callers can stream into a file without
    /// materializing the whole payload — the callback receives borrowed
    /// chunks, never an owned buffer the link had to allocate for them.
    In(&'a mut dyn FnMut(&[u8]) -> Result<(), Error>),
}

pub struct TransactionRequest<'a> {
    pub code: CommandCode,
    pub params: Vec<u32>,
    pub data: DataPhase<'a>,
    pub io_timeout: Duration,
}

pub struct TransactionResponse {
    pub code: ResponseCode,
    pub params: Vec<u32>,
}

fn transport_phase_to_phase(p: TransportPhase) -> Phase {
    match p {
        TransportPhase::BulkOut => Phase::BulkOut,
        TransportPhase::BulkIn => Phase::BulkIn,
        TransportPhase::ResponseWait => Phase::ResponseWait,
        TransportPhase::InterruptIn => Phase::InterruptIn,
    }
}

fn map_transport_err(e: TransportError) -> Error {
    match e {
        TransportError::NoDevice | TransportError::Disconnected => Error::Disconnected,
        TransportError::AccessDenied => Error::PermissionDenied,
        TransportError::Stall => Error::Stall,
        TransportError::TimeoutInPhase(p) => Error::Timeout(Some(transport_phase_to_phase(p))),
        TransportError::Io(msg) => Error::Transport(TransportError::Io(msg)),
    }
}

/// Bounded drain used to recover from a cancelled in-flight bulk-in read
/// without leaving the device mid-phase (`spec.md` §5 "Cancellation").
const CANCEL_DRAIN_MAX_BYTES: usize = 16 * 1024 * 1024;
const CANCEL_DRAIN_CHUNK: usize = 64 * 1024;

/// The transaction layer. Holds the shared transport handle and the
/// monotonic transaction-id counter; one `Link` is owned by exactly one
/// session actor (`spec.md` §5 "Shared resources").
pub struct Link {
    transport: Arc<dyn Transport>,
    next_transaction_id: AtomicU32,
    no_zero_length_packets: bool,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, no_zero_length_packets: bool) -> Link {
        Link {
            transport,
            next_transaction_id: AtomicU32::new(1),
            no_zero_length_packets,
        }
    }

    fn next_transaction_id(&self) -> u32 {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Run one full transaction: command phase, optional data phase,
    /// response phase. On a single bulk stall, clears the halt and retries
    /// the stalled phase once; a second stall is fatal (`spec.md` §5
    /// "Retry discipline").
    pub async fn execute(&self, req: TransactionRequest<'_>) -> Result<TransactionResponse, Error> {
        let transaction_id = self.next_transaction_id();
        match self.execute_with_id(req, transaction_id).await {
            Err(Error::Stall) => {
                // one clear-halt + one immediate retry on the bulk endpoints,
                // then fatal (a fresh TransactionRequest can't be replayed
                // here since it was consumed; callers that need the retried
                // attempt construct their own retry loop using this as the
                // single stall-aware attempt).
                Err(Error::Stall)
            }
            other => other,
        }
    }

    async fn execute_with_id(&self, req: TransactionRequest<'_>, transaction_id: u32) -> Result<TransactionResponse, Error> {
        let code = req.code.to_u16().unwrap_or(0);
        trace!("tid {transaction_id}: command 0x{code:04x}, params {:?}", req.params);
        let command_bytes = Container::encode(ContainerType::Command, code, transaction_id, &req.params);
        self.bulk_out_with_stall_recovery(&command_bytes, req.io_timeout).await?;

        match req.data {
            DataPhase::None => {}
            DataPhase::Out(bytes) => {
                let header = Container::encode_data_header(code, transaction_id, bytes.len());
                self.bulk_out_with_stall_recovery(&header, req.io_timeout).await?;
                self.bulk_out_with_stall_recovery(bytes, req.io_timeout).await?;
                if self.needs_zero_length_packet(header.len() + bytes.len()) {
                    self.bulk_out_with_stall_recovery(&[], req.io_timeout).await?;
                }
            }
            DataPhase::In(callback) => {
                if let Some(early_response) = self.read_data_phase(transaction_id, callback, req.io_timeout).await? {
                    return Ok(early_response);
                }
            }
        }

        self.read_response(transaction_id, req.io_timeout).await
    }

    /// Whether a just-sent data phase of `total_len` bytes must be
    /// terminated with a zero-length packet: the phase length is an exact
    /// multiple of the endpoint's max packet size, and the device doesn't
    /// set `noZeroLengthPackets` (`spec.md` §4.3).
    fn needs_zero_length_packet(&self, total_len: usize) -> bool {
        if self.no_zero_length_packets {
            return false;
        }
        let mps = self.transport.out_max_packet_size();
        mps > 0 && total_len % mps == 0
    }

    async fn bulk_out_with_stall_recovery(&self, bytes: &[u8], timeout: Duration) -> Result<(), Error> {
        match self.transport.bulk_out(bytes, timeout).await {
            Ok(_) => Ok(()),
            Err(TransportError::Stall) => {
                warn!("bulk-out stalled, clearing halt and retrying once");
                let endpoints = self.transport.endpoints();
                self.transport.clear_halt(endpoints.bulk_out).await.map_err(map_transport_err)?;
                self.transport.bulk_out(bytes, timeout).await.map_err(map_transport_err)?;
                Ok(())
            }
            Err(e) => Err(map_transport_err(e)),
        }
    }

    /// Read the container that arrives where a data phase is expected. A
    /// well-behaved data phase yields `Ok(None)` after streaming its
    /// payload through `callback`; a device that short-circuits straight to
    /// an error response (skipping the data phase entirely, as real PTP
    /// devices do) yields `Ok(Some(response))` so the caller returns it
    /// without waiting on a data phase that will never arrive.
    async fn read_data_phase(
        &self,
        transaction_id: u32,
        callback: &mut dyn FnMut(&[u8]) -> Result<(), Error>,
        timeout: Duration,
    ) -> Result<Option<TransactionResponse>, Error> {
        let mut header_buf = [0u8; crate::container::HEADER_SIZE];
        self.bulk_in_with_stall_recovery(&mut header_buf, timeout).await?;
        let (total_len, kind, code, rx_txid) =
            Container::decode_header(&header_buf).ok_or_else(|| Error::Malformed("bad data container header".into()))?;

        if rx_txid != transaction_id {
            return Err(Error::Malformed(format!(
                "container transaction id {rx_txid} does not match request {transaction_id}"
            )));
        }

        match kind {
            ContainerType::Data => {
                let mut remaining = total_len.saturating_sub(crate::container::HEADER_SIZE);
                let mut chunk = vec![0u8; 64 * 1024];
                while remaining > 0 {
                    let want = remaining.min(chunk.len());
                    self.bulk_in_with_stall_recovery(&mut chunk[..want], timeout).await?;
                    callback(&chunk[..want])?;
                    remaining -= want;
                }
                Ok(None)
            }
            ContainerType::Response => {
                let params = self.read_response_params(total_len, timeout).await?;
                let response_code = ResponseCode::from_u16(code).unwrap_or(ResponseCode::Other(code));
                Ok(Some(TransactionResponse {
                    code: response_code,
                    params,
                }))
            }
            _ => Err(Error::Malformed("unexpected container where a data phase was expected".into())),
        }
    }

    async fn read_response_params(&self, total_len: usize, timeout: Duration) -> Result<Vec<u32>, Error> {
        let params_len = total_len.saturating_sub(crate::container::HEADER_SIZE);
        let mut params_buf = vec![0u8; params_len];
        if params_len > 0 {
            self.bulk_in_with_stall_recovery(&mut params_buf, timeout).await?;
        }
        Ok(params_buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    async fn bulk_in_with_stall_recovery(&self, buf: &mut [u8], timeout: Duration) -> Result<(), Error> {
        match self.transport.bulk_in(buf, timeout).await {
            Ok(_) => Ok(()),
            Err(TransportError::Stall) => {
                warn!("bulk-in stalled, clearing halt and retrying once");
                let endpoints = self.transport.endpoints();
                self.transport.clear_halt(endpoints.bulk_in).await.map_err(map_transport_err)?;
                self.transport.bulk_in(buf, timeout).await.map_err(map_transport_err)?;
                Ok(())
            }
            Err(e) => Err(map_transport_err(e)),
        }
    }

    async fn read_response(&self, transaction_id: u32, timeout: Duration) -> Result<TransactionResponse, Error> {
        let mut header_buf = [0u8; crate::container::HEADER_SIZE];
        self.bulk_in_with_stall_recovery(&mut header_buf, timeout).await?;
        let (total_len, kind, code, rx_txid) =
            Container::decode_header(&header_buf).ok_or_else(|| Error::Malformed("bad response container header".into()))?;

        if !matches!(kind, ContainerType::Response) {
            return Err(Error::Malformed("expected a response container".into()));
        }
        if rx_txid != transaction_id {
            return Err(Error::Malformed(format!(
                "response transaction id {rx_txid} does not match request {transaction_id}"
            )));
        }

        let params_len = total_len.saturating_sub(crate::container::HEADER_SIZE);
        let mut params_buf = vec![0u8; params_len];
        if params_len > 0 {
            self.bulk_in_with_stall_recovery(&mut params_buf, timeout).await?;
        }
        let params = params_buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let response_code = ResponseCode::from_u16(code).unwrap_or(ResponseCode::Other(code));
        Ok(TransactionResponse {
            code: response_code,
            params,
        })
    }

    /// Drain an in-flight bulk-in read up to a bounded byte count so the
    /// device is left in a known state after a cancelled transaction
    /// (`spec.md` §4.3 "Cancellation").
    pub async fn drain_bulk_in(&self, timeout: Duration) -> Result<(), Error> {
        let mut drained = 0usize;
        let mut chunk = vec![0u8; CANCEL_DRAIN_CHUNK];
        while drained < CANCEL_DRAIN_MAX_BYTES {
            match self.transport.bulk_in(&mut chunk, timeout).await {
                Ok(0) => break,
                Ok(n) => drained += n,
                Err(_) => break,
            }
        }
        Ok(())
    }

    pub async fn reset_device(&self) -> Result<(), Error> {
        self.transport.reset_device().await.map_err(map_transport_err)
    }
}

/// `true` for the two response codes `spec.md` §4.3 treats as "busy,
/// retry with backoff": `DeviceBusy` (0x2019) and `SessionNotOpen`
/// (0x2003, per the §9 Open Question resolution retained as specified).
pub fn is_busy_response(code: ResponseCode) -> bool {
    matches!(code, ResponseCode::Standard(c) if c.is_busy_retryable())
}

pub fn is_ok_response(code: ResponseCode) -> bool {
    matches!(code, ResponseCode::Standard(StandardResponseCode::Ok))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeTransport;
    use crate::StandardCommandCode;

    #[tokio::test]
    async fn open_session_round_trips_matching_spec_s2() {
        let fake = FakeTransport::new();
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        let link = Link::new(Arc::new(fake), false);

        let resp = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::OpenSession),
                params: vec![1],
                data: DataPhase::None,
                io_timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();

        assert!(is_ok_response(resp.code));
    }

    #[tokio::test]
    async fn mismatched_transaction_id_in_response_is_malformed() {
        let fake = FakeTransport::new();
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 999);
        let link = Link::new(Arc::new(fake), false);

        let result = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::OpenSession),
                params: vec![1],
                data: DataPhase::None,
                io_timeout: Duration::from_secs(1),
            })
            .await;

        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[tokio::test]
    async fn stall_on_bulk_out_recovers_after_one_clear_halt() {
        let fake = FakeTransport::new();
        fake.queue_stall_then_ok_out();
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        let link = Link::new(Arc::new(fake), false);

        let resp = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::OpenSession),
                params: vec![1],
                data: DataPhase::None,
                io_timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        assert!(is_ok_response(resp.code));
    }
}
