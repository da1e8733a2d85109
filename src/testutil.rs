//! An in-memory [`Transport`] used by unit and integration tests across the
//! crate. Not part of the public API; gated behind `#[cfg(test)]` in
//! `lib.rs`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::container::{Container, ContainerType};
use crate::transport::{Endpoints, Transport, TransportError, TransportPhase};

struct Inner {
    incoming: VecDeque<u8>,
    interrupt: VecDeque<u8>,
    outgoing: Vec<Vec<u8>>,
    bulk_out_stall_once: bool,
    bulk_in_stall_once: bool,
}

pub struct FakeTransport {
    inner: Mutex<Inner>,
    disconnected: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> FakeTransport {
        FakeTransport {
            inner: Mutex::new(Inner {
                incoming: VecDeque::new(),
                interrupt: VecDeque::new(),
                outgoing: vec![],
                bulk_out_stall_once: false,
                bulk_in_stall_once: false,
            }),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn queue_response(&self, code: u16, params: Vec<u32>) {
        self.queue_response_with_txid(code, params, 1);
    }

    pub fn queue_response_with_txid(&self, code: u16, params: Vec<u32>, txid: u32) {
        let bytes = Container::encode(ContainerType::Response, code, txid, &params);
        self.inner.lock().unwrap().incoming.extend(bytes);
    }

    pub fn queue_data(&self, code: u16, txid: u32, payload: &[u8]) {
        let header = Container::encode_data_header(code, txid, payload.len());
        let mut inner = self.inner.lock().unwrap();
        inner.incoming.extend(header);
        inner.incoming.extend(payload.iter().copied());
    }

    pub fn queue_stall_then_ok_out(&self) {
        self.inner.lock().unwrap().bulk_out_stall_once = true;
    }

    pub fn queue_stall_then_ok_in(&self) {
        self.inner.lock().unwrap().bulk_in_stall_once = true;
    }

    pub fn queue_event(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().interrupt.extend(bytes.iter().copied());
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().outgoing.clone()
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

impl Default for FakeTransport {
    fn default() -> FakeTransport {
        FakeTransport::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn claim(&self, _vendor_id: u16, _product_id: u16, _interface: Option<u8>, _timeout: Duration) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::NoDevice);
        }
        Ok(())
    }

    async fn release(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn bulk_out(&self, bytes: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.bulk_out_stall_once {
            inner.bulk_out_stall_once = false;
            return Err(TransportError::Stall);
        }
        inner.outgoing.push(bytes.to_vec());
        Ok(bytes.len())
    }

    async fn bulk_in(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.bulk_in_stall_once {
            inner.bulk_in_stall_once = false;
            return Err(TransportError::Stall);
        }
        if inner.incoming.is_empty() {
            return Err(TransportError::TimeoutInPhase(TransportPhase::BulkIn));
        }
        let n = buf.len().min(inner.incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.incoming.pop_front().unwrap();
        }
        Ok(n)
    }

    async fn interrupt_in(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.interrupt.is_empty() {
            return Err(TransportError::TimeoutInPhase(TransportPhase::InterruptIn));
        }
        let n = buf.len().min(inner.interrupt.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.interrupt.pop_front().unwrap();
        }
        Ok(n)
    }

    async fn clear_halt(&self, _endpoint: u8) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reset_device(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn out_max_packet_size(&self) -> usize {
        512
    }

    fn endpoints(&self) -> Endpoints {
        Endpoints {
            bulk_in: 0x81,
            bulk_out: 0x01,
            interrupt_in: 0x82,
        }
    }
}
