use std::fmt;

use thiserror::Error;

use crate::response::ResponseCode;
use crate::transport::TransportError;

/// The phase of a transaction during which a timeout or transport failure
/// occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Phase {
    BulkOut,
    BulkIn,
    ResponseWait,
    InterruptIn,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::BulkOut => "bulk-out",
            Phase::BulkIn => "bulk-in",
            Phase::ResponseWait => "response-wait",
            Phase::InterruptIn => "interrupt-in",
        };
        f.write_str(s)
    }
}

/// Every error the core can surface to a caller.
///
/// Transport errors bubble into [`crate::link::Link`] unchanged and are
/// converted there into the matching member below; protocol response codes
/// are converted by the session actor. See `spec.md` §7.
#[derive(Error, Debug)]
pub enum Error {
    #[error("the device is no longer reachable")]
    Disconnected,

    #[error("the transport refused to claim the device")]
    PermissionDenied,

    #[error("no session is open on this device")]
    NotOpen,

    #[error("operation not supported by this device: {0}")]
    NotSupported(&'static str),

    #[error("object handle not found on the device")]
    ObjectNotFound,

    #[error("storage id not recognized by the device")]
    InvalidStorage,

    #[error("parent object handle not recognized by the device")]
    InvalidParent,

    #[error("the destination storage is full")]
    StorageFull,

    #[error("the object is write-protected")]
    WriteProtected,

    #[error("the storage is read-only")]
    ReadOnly,

    #[error("the device is busy")]
    Busy,

    #[error("the operation timed out{}", .0.map(|p| format!(" during the {p} phase")).unwrap_or_default())]
    Timeout(Option<Phase>),

    #[error("the endpoint stalled")]
    Stall,

    #[error("the ptp device returned {code:?} ({code:#06x}){}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Protocol {
        code: ResponseCode,
        message: Option<String>,
    },

    #[error("post-write verification failed: expected {expected} bytes, got {actual}")]
    VerificationFailed { expected: u64, actual: u64 },

    #[error("precondition violated: {0}")]
    PreconditionFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Data received was malformed in a way that isn't one of the more
    /// specific variants below.
    #[error("the data received was malformed: {0}")]
    Malformed(String),

    #[error("the data received was malformed: bad object format")]
    BadObjectFormat,

    #[error("the data received was malformed: bad association code")]
    BadAssociationCode,

    #[error("the data received was malformed: bad event code")]
    BadEventCode,

    #[error("received an event with no payload")]
    NoEventPayload,

    /// A transport-layer failure that doesn't map to one of the protocol
    /// error kinds above.
    #[error("a transport error occurred: {0}")]
    Transport(#[from] TransportError),

    #[error("an i/o error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("a journal store error occurred: {0}")]
    Journal(String),
}

impl Error {
    /// A short, user-facing remediation hint. See `spec.md` §7.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Disconnected => "Reconnect the device and unlock the screen",
            Error::PermissionDenied => "Grant the application permission to access the device",
            Error::NotOpen => "Open a session on the device before using it",
            Error::NotSupported(_) => "This device does not support that operation",
            Error::ObjectNotFound => "The file or folder no longer exists on the device",
            Error::InvalidStorage => "The storage volume is no longer available",
            Error::InvalidParent => "The destination folder no longer exists on the device",
            Error::StorageFull => "The destination storage is full",
            Error::WriteProtected => "The file is write-protected on the device",
            Error::ReadOnly => "The destination storage is read-only",
            Error::Busy => "The device is busy; try again in a moment",
            Error::Timeout(Some(Phase::BulkOut)) => "The USB transfer timed out while sending data",
            Error::Timeout(Some(Phase::BulkIn)) => "The USB transfer timed out while receiving data",
            Error::Timeout(Some(Phase::ResponseWait)) => "The device did not respond in time",
            Error::Timeout(Some(Phase::InterruptIn)) => "The device stopped reporting events",
            Error::Timeout(None) => "The operation took too long and was abandoned",
            Error::Stall => "The USB endpoint stalled; the transfer was retried once",
            Error::Protocol { .. } => "The device reported a protocol error",
            Error::VerificationFailed { .. } => "The transferred file did not match in size after the transfer",
            Error::PreconditionFailed(_) => "The request was invalid for this device",
            Error::Cancelled => "The operation was cancelled",
            Error::Malformed(_)
            | Error::BadObjectFormat
            | Error::BadAssociationCode
            | Error::BadEventCode
            | Error::NoEventPayload => "The device sent data the host could not parse",
            Error::Transport(_) => "A USB communication error occurred",
            Error::Io(_) => "A local file system error occurred",
            Error::Journal(_) => "The resumable-transfer record could not be updated",
        }
    }

    /// True if a caller may usefully retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Stall | Error::Timeout(_))
    }

    pub(crate) fn from_response_code(code: ResponseCode, message: Option<String>) -> Error {
        use crate::response::StandardResponseCode as R;
        match code {
            ResponseCode::Standard(R::InvalidStorageId) => Error::InvalidStorage,
            ResponseCode::Standard(R::InvalidObjectHandle) => Error::ObjectNotFound,
            ResponseCode::Standard(R::InvalidParentObject) => Error::InvalidParent,
            ResponseCode::Standard(R::StoreFull) => Error::StorageFull,
            ResponseCode::Standard(R::ObjectWriteProtected) => Error::WriteProtected,
            ResponseCode::Standard(R::StoreReadOnly) => Error::ReadOnly,
            ResponseCode::Standard(R::AccessDenied) => Error::PermissionDenied,
            ResponseCode::Standard(R::DeviceBusy) | ResponseCode::Standard(R::SessionNotOpen) => {
                Error::Busy
            }
            ResponseCode::Standard(R::OperationNotSupported) => Error::NotSupported("operation"),
            ResponseCode::Standard(R::SessionAlreadyOpen) => Error::Protocol { code, message },
            _ => Error::Protocol { code, message },
        }
    }
}
