//! The USB transport contract.
//!
//! This module defines, but does not implement, the byte-stream boundary
//! the rest of the core consumes (`spec.md` §4.2). Implementing the real
//! kernel/userspace USB driver is explicitly out of scope (`spec.md` §1);
//! embedders provide a [`Transport`] and the core drives it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// The USB transfer phase a [`TransportError::Timeout`] occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    BulkOut,
    BulkIn,
    ResponseWait,
    InterruptIn,
}

/// Errors a [`Transport`] implementation may report.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no such device")]
    NoDevice,

    #[error("access denied while claiming the interface")]
    AccessDenied,

    #[error("endpoint stalled")]
    Stall,

    #[error("timed out during the {0:?} phase")]
    TimeoutInPhase(TransportPhase),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("device disconnected")]
    Disconnected,
}

/// An opaque handle to a claimed USB interface. Transport implementations
/// define their own concrete handle type and box it behind this trait
/// object boundary so the rest of the core never names a specific USB
/// backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Claim the interface implementing the PTP/MTP class on the device
    /// identified by `vendor_id`/`product_id`, selecting `interface` if
    /// more than one candidate interface exists.
    async fn claim(&self, vendor_id: u16, product_id: u16, interface: Option<u8>, timeout: Duration)
        -> Result<(), TransportError>;

    /// Release a previously claimed interface.
    async fn release(&self) -> Result<(), TransportError>;

    /// Write the given bytes to the bulk-out endpoint.
    async fn bulk_out(&self, bytes: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes from the bulk-in endpoint, returning the
    /// number of bytes actually read.
    async fn bulk_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes from the interrupt-in endpoint (events).
    async fn interrupt_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Clear a halt/stall condition on the given endpoint address.
    async fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError>;

    /// Reset the underlying USB device.
    async fn reset_device(&self) -> Result<(), TransportError>;

    /// The bulk-out endpoint's max packet size, used to decide whether a
    /// zero-length packet is required to terminate a data phase
    /// (`spec.md` §4.3).
    fn out_max_packet_size(&self) -> usize;

    /// Endpoint addresses, for diagnostics and `clear_halt` targeting.
    fn endpoints(&self) -> Endpoints;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: u8,
}
