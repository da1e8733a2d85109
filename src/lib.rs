//! `swiftmtp-core`: an MTP/PTP host protocol engine.
//!
//! This crate speaks the PTP wire protocol over a caller-supplied USB bulk
//! transport (`spec.md` §4.2 defines the boundary; this crate never touches
//! `libusb`/`rusb` I/O directly) and exposes a structured device/storage/
//! object API: streaming reads and writes, resumable transfers via a
//! journal, and device-specific behavioural overrides via a quirk resolver.
//!
//! Layers, leaves first:
//! - [`container`] / [`data`]: wire codec (container headers, little-endian
//!   primitives, PTP strings, property values).
//! - [`command`] / [`response`] / [`event`]: the standard PTP/MTP op,
//!   response and event code tables.
//! - [`object`] / [`object_info`] / [`storage_info`] / [`device_info`] /
//!   [`proplist`]: the datasets those codes carry.
//! - [`fingerprint`]: USB-descriptor identity used to key quirks and
//!   learned profiles.
//! - [`transport`]: the transport contract a real USB stack implements.
//! - [`link`]: one command/data/response transaction per call.
//! - [`quirk`] / [`policy`]: device fingerprint → behavioural policy.
//! - [`enumeration`] / [`transfer`] / [`pipeline`]: listing and transfer
//!   strategies.
//! - [`journal`]: durable record of resumable transfers.
//! - [`event_pump`]: background interrupt-in event polling.
//! - [`session`]: the public, serializing device actor that ties all of the
//!   above together.

mod command;
mod container;
mod data;
mod device_info;
mod enumeration;
mod error;
mod event;
mod event_pump;
mod fingerprint;
mod journal;
mod link;
mod object;
mod object_info;
mod pipeline;
mod policy;
mod proplist;
mod quirk;
mod response;
mod session;
mod storage_info;
mod transfer;
mod transport;

#[cfg(test)]
mod testutil;

pub use crate::command::{CommandCode, StandardCommandCode};
pub use crate::container::{Container, ContainerType, HEADER_SIZE};
pub use crate::data::{PtpData, PtpRead};
pub use crate::device_info::DeviceInfo;
pub use crate::enumeration::{Batch, EnumerationStrategy, DEFAULT_BATCH_SIZE};
pub use crate::error::{Error, Phase};
pub use crate::event::{Event, EventCode, StandardEventCode};
pub use crate::fingerprint::{DeviceFingerprint, StableIdentity};
pub use crate::journal::{ETag, FileJournalStore, InMemoryJournalStore, JournalEntry, JournalStore, TransferKind, TransferState};
pub use crate::object::{AssociationCode, ObjectFormatCode, ObjectHandle, StandardObjectFormatCode};
pub use crate::object_info::ObjectInfo;
pub use crate::policy::{
    EffectiveTuning, FallbackSelections, LearnedProfile, Policy, Provenance, ReadStrategy,
    TuningSources, UserOverrides, WriteStrategy,
};
pub use crate::proplist::{EnumeratedObject, FormData, ObjectPropertyCode, PropInfo};
pub use crate::quirk::{
    BusyBackoff, Hook, HookPhase, InterfaceMatch, MatchPattern, QuirkConfidence, QuirkDatabase,
    QuirkEntry, QuirkFlags, QuirkStatus, Tuning,
};
pub use crate::response::{ResponseCode, StandardResponseCode};
pub use crate::session::{OpenConfig, Opened, Session};
pub use crate::storage_info::{AccessType, FilesystemType, StorageId, StorageInfo, StorageType};
pub use crate::transfer::{ByteRange, UploadOutcome};
pub use crate::transport::{Endpoints, Transport, TransportError, TransportPhase};
