//! The session / device actor (`spec.md` §4.4): a single `tokio` task owns
//! the [`Link`] exclusively and drains a request channel one message at a
//! time, which is what gives the crate its "at most one transaction in
//! flight per device" guarantee for free — callers never need their own
//! locking, they just `.await` a reply.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use num_traits::ToPrimitive;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::command::{CommandCode, StandardCommandCode};
use crate::data::PtpData;
use crate::device_info::DeviceInfo;
use crate::enumeration::{self, EnumerationStrategy};
use crate::event::Event;
use crate::event_pump::{EventPump, DEFAULT_COALESCE_WINDOW};
use crate::fingerprint::{DeviceFingerprint, StableIdentity};
use crate::journal::JournalStore;
use crate::link::{DataPhase, Link, TransactionRequest};
use crate::object::{ObjectFormatCode, ObjectHandle};
use crate::object_info::ObjectInfo;
use crate::pipeline::BufferPool;
use crate::policy::{self, EffectiveTuning, Policy, ReadStrategy, UserOverrides, WriteStrategy};
use crate::proplist::{ObjectPropertyCode, PropInfo};
use crate::quirk::QuirkDatabase;
use crate::response::{ResponseCode, StandardResponseCode};
use crate::storage_info::{StorageId, StorageInfo};
use crate::transfer::{self, ByteRange, UploadOutcome};
use crate::{Error, Phase};

fn reject_unless_ok(code: ResponseCode) -> Result<(), Error> {
    if crate::link::is_ok_response(code) {
        Ok(())
    } else {
        Err(Error::from_response_code(code, None))
    }
}

/// Input the embedder supplies to open a session: everything the quirk
/// resolver and the transport need that the core has no way to discover
/// on its own, since real USB descriptor access is out of scope
/// (`spec.md` §1, §4.2).
pub struct OpenConfig {
    pub fingerprint: DeviceFingerprint,
    pub interface: Option<u8>,
    pub quirks: Option<QuirkDatabase>,
    pub learned: Option<crate::policy::LearnedProfile>,
    pub user: UserOverrides,
    pub journal: Arc<dyn JournalStore>,
}

type ReadSink = Box<dyn FnMut(&[u8]) -> Result<(), Error> + Send>;
type WriteSource = Pin<Box<dyn AsyncRead + Send>>;

/// One request sent to the actor task. Every variant carries its own
/// one-shot reply channel; the actor loop processes these strictly in
/// arrival order.
enum Command {
    Info(oneshot::Sender<DeviceInfo>),
    Storages(oneshot::Sender<Result<Vec<(StorageId, StorageInfo)>, Error>>),
    List {
        parent: ObjectHandle,
        storage: StorageId,
        reply: oneshot::Sender<Result<mpsc::Receiver<enumeration::Batch>, Error>>,
    },
    GetInfo {
        handle: ObjectHandle,
        reply: oneshot::Sender<Result<ObjectInfo, Error>>,
    },
    Read {
        handle: ObjectHandle,
        range: ByteRange,
        sink: ReadSink,
        reply: oneshot::Sender<Result<u64, Error>>,
    },
    Write {
        parent: Option<ObjectHandle>,
        storage: StorageId,
        name: String,
        format: ObjectFormatCode,
        size: u64,
        source: WriteSource,
        reply: oneshot::Sender<Result<ObjectHandle, Error>>,
    },
    CreateFolder {
        parent: ObjectHandle,
        storage: StorageId,
        name: String,
        reply: oneshot::Sender<Result<ObjectHandle, Error>>,
    },
    Delete {
        handle: ObjectHandle,
        recursive: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    MoveObject {
        handle: ObjectHandle,
        new_storage: StorageId,
        new_parent: ObjectHandle,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    CopyObject {
        handle: ObjectHandle,
        new_storage: StorageId,
        new_parent: ObjectHandle,
        reply: oneshot::Sender<Result<ObjectHandle, Error>>,
    },
    GetNumObjects {
        storage: StorageId,
        parent: ObjectHandle,
        reply: oneshot::Sender<Result<u32, Error>>,
    },
    GetObjectPropValue {
        handle: ObjectHandle,
        prop: ObjectPropertyCode,
        reply: oneshot::Sender<Result<PtpData, Error>>,
    },
    SetObjectPropValue {
        handle: ObjectHandle,
        prop: ObjectPropertyCode,
        value: PtpData,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    GetObjectPropDesc {
        object_format: ObjectFormatCode,
        prop_code: u16,
        reply: oneshot::Sender<Result<PropInfo, Error>>,
    },
    DownloadResumable {
        handle: ObjectHandle,
        total_bytes: u64,
        dest_path: PathBuf,
        reply: oneshot::Sender<Result<PathBuf, Error>>,
    },
    UploadResumable {
        storage: StorageId,
        parent: ObjectHandle,
        source_path: PathBuf,
        format: ObjectFormatCode,
        reply: oneshot::Sender<Result<UploadOutcome, Error>>,
    },
    Close,
}

/// A handle to an open device. Cloning shares the same underlying actor
/// and transport; every clone's calls still serialize through the one
/// task (`spec.md` §5 "Shared resources").
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<Command>,
}

/// The device's identity and cached capabilities, handed back alongside
/// the [`Session`] so callers don't need a round trip just to learn what
/// [`open`] already found out.
pub struct Opened {
    pub session: Session,
    pub stable_id: StableIdentity,
    pub matched_quirk_id: Option<String>,
    pub events: mpsc::Receiver<Event>,
}

fn well_known_prop_data_type(prop: ObjectPropertyCode) -> u16 {
    match prop {
        ObjectPropertyCode::StorageId | ObjectPropertyCode::ParentObject => 0x0006,
        ObjectPropertyCode::ObjectFormat => 0x0004,
        ObjectPropertyCode::ObjectSize => 0x0008,
        ObjectPropertyCode::ObjectFileName | ObjectPropertyCode::DateCreated | ObjectPropertyCode::DateModified => 0xFFFF,
    }
}

async fn get_device_info(link: &Link, timeout: Duration) -> Result<DeviceInfo, Error> {
    let mut buf = Vec::new();
    let mut sink = |chunk: &[u8]| -> Result<(), Error> {
        buf.extend_from_slice(chunk);
        Ok(())
    };
    let response = link
        .execute(TransactionRequest {
            code: CommandCode::Standard(StandardCommandCode::GetDeviceInfo),
            params: vec![],
            data: DataPhase::In(&mut sink),
            io_timeout: timeout,
        })
        .await?;
    reject_unless_ok(response.code)?;
    DeviceInfo::decode(&buf)
}

async fn open_session_txn(link: &Link, timeout: Duration) -> Result<(), Error> {
    let response = link
        .execute(TransactionRequest {
            code: CommandCode::Standard(StandardCommandCode::OpenSession),
            params: vec![1],
            data: DataPhase::None,
            io_timeout: timeout,
        })
        .await?;
    match response.code {
        ResponseCode::Standard(StandardResponseCode::Ok) => Ok(()),
        ResponseCode::Standard(StandardResponseCode::SessionAlreadyOpen) => Ok(()),
        other => Err(Error::from_response_code(other, None)),
    }
}

/// Probe read/write/enumeration capability once, right after the session
/// opens, and latch the winners onto the policy's fallback selections
/// (`spec.md` §4.4 step 8, §4.5 "Probe-and-latch").
async fn probe_capabilities(link: &Link, device_info: &DeviceInfo, fp: &DeviceFingerprint, policy: &mut Policy, timeout: Duration) {
    let prefers_prop_list = policy.flags.prefers_prop_list_enumeration.unwrap_or(false);
    let start = EnumerationStrategy::default_for_interface_class(fp.interface_class.unwrap_or(crate::quirk::PTP_INTERFACE_CLASS), prefers_prop_list);
    if let Ok((strategy, _)) = enumeration::probe_and_latch(link, start, StorageId::all(), ObjectHandle::root(), timeout).await {
        policy.fallback.enumeration = Some(strategy);
    }

    if policy.fallback.read != Some(ReadStrategy::Partial64) {
        if device_info.supports_operation(StandardCommandCode::GetPartialObject64) {
            policy.fallback.read = Some(ReadStrategy::Partial64);
        } else if device_info.supports_operation(StandardCommandCode::GetPartialObject) {
            policy.fallback.read = Some(ReadStrategy::Partial32);
        } else {
            policy.fallback.read.get_or_insert(ReadStrategy::WholeObject);
        }
    }

    policy.fallback.write = Some(
        if policy.flags.supports_get_object_prop_list.unwrap_or(false) && device_info.supports_operation(StandardCommandCode::SendObjectPropList) {
            WriteStrategy::PropListPrelude
        } else {
            WriteStrategy::ObjectInfoPrelude
        },
    );
}

/// Retry `f` with the hook policy's jittered exponential backoff whenever
/// it fails with [`Error::Busy`] (response codes `DeviceBusy`/
/// `SessionNotOpen`), up to the configured number of retries. Each retry
/// re-issues the operation from scratch, which gets it a fresh transaction
/// id via the `Link`'s own counter (`spec.md` §4.4 "Busy backoff").
///
/// Only used for single-transaction operations: a multi-chunk transfer
/// that went partway through before hitting `Busy` would duplicate data on
/// retry, so `read`/`write`/`list` do not go through this wrapper.
async fn with_busy_backoff<T, F, Fut>(policy: &Policy, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let backoff = policy.busy_backoff();
    let mut attempt = 0u32;
    loop {
        match f().await {
            Err(Error::Busy) if attempt < backoff.retries => {
                let jitter_sample = rand::random::<f64>() * 2.0 - 1.0;
                let delay = policy::busy_backoff_delay(&backoff, attempt, jitter_sample);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

struct Actor {
    link: Link,
    policy: Policy,
    device_info: DeviceInfo,
    fp: DeviceFingerprint,
    journal: Arc<dyn JournalStore>,
    stable_id: StableIdentity,
    pool: BufferPool,
    pump: Option<EventPump>,
}

impl Actor {
    async fn get_object_info_once(&self, handle: ObjectHandle) -> Result<ObjectInfo, Error> {
        let mut buf = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            buf.extend_from_slice(chunk);
            Ok(())
        };
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetObjectInfo),
                params: vec![handle.raw()],
                data: DataPhase::In(&mut sink),
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        ObjectInfo::decode(&buf)
    }

    async fn get_storage_info_once(&self, storage: StorageId) -> Result<StorageInfo, Error> {
        use crate::data::PtpRead;
        let mut buf = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            buf.extend_from_slice(chunk);
            Ok(())
        };
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetStorageInfo),
                params: vec![storage.raw()],
                data: DataPhase::In(&mut sink),
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        let mut cur = std::io::Cursor::new(buf);
        StorageInfo::decode(&mut cur)
    }

    async fn storages_once(&self) -> Result<Vec<(StorageId, StorageInfo)>, Error> {
        use crate::data::PtpRead;
        let mut buf = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            buf.extend_from_slice(chunk);
            Ok(())
        };
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetStorageIDs),
                params: vec![],
                data: DataPhase::In(&mut sink),
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        let mut cur = std::io::Cursor::new(buf);
        let ids = cur.read_ptp_u32_vec()?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let storage = StorageId::new(id);
            let info = self.get_storage_info_once(storage).await?;
            out.push((storage, info));
        }
        Ok(out)
    }

    async fn delete_object_once(&self, handle: ObjectHandle) -> Result<(), Error> {
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::DeleteObject),
                params: vec![handle.raw(), 0],
                data: DataPhase::None,
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)
    }

    /// Best-effort recursive delete (`spec.md` §4.4 "Delete(recursive)"):
    /// walk the subtree, deleting deepest objects first, and keep going
    /// past a child's failure so the rest of the tree is still reclaimed.
    /// The requested handle's own delete result is what's returned.
    async fn delete(&mut self, handle: ObjectHandle, recursive: bool) -> Result<(), Error> {
        if !recursive {
            return with_busy_backoff(&self.policy, || self.delete_object_once(handle)).await;
        }

        let mut stack = vec![handle];
        let mut discovered = vec![];
        while let Some(h) = stack.pop() {
            discovered.push(h);
            let Ok(info) = self.get_object_info_once(h).await else {
                continue;
            };
            if !info.object_format.is_folder() {
                continue;
            }
            let storage = StorageId::new(info.storage_id);
            let strategy = self.policy.fallback.enumeration.unwrap_or(EnumerationStrategy::HandlesThenInfo);
            if let Ok((latched, children)) = enumeration::probe_and_latch(&self.link, strategy, storage, h, self.policy.tuning.io_timeout).await {
                self.policy.fallback.enumeration = Some(latched);
                for child in children {
                    stack.push(ObjectHandle::new(child.handle));
                }
            }
        }

        let mut root_result = Ok(());
        for h in discovered.into_iter().rev() {
            let result = with_busy_backoff(&self.policy, || self.delete_object_once(h)).await;
            if h == handle {
                root_result = result;
            }
        }
        root_result
    }

    async fn move_object_once(&self, handle: ObjectHandle, new_storage: StorageId, new_parent: ObjectHandle) -> Result<(), Error> {
        if !self.device_info.supports_operation(StandardCommandCode::MoveObject) {
            return Err(Error::NotSupported("MoveObject"));
        }
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::MoveObject),
                params: vec![handle.raw(), new_storage.raw(), new_parent.raw()],
                data: DataPhase::None,
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        // never emulate via copy+delete: free-space and timestamp semantics
        // differ, so an unsupported MoveObject surfaces to the caller.
        reject_unless_ok(response.code)
    }

    async fn copy_object_once(&self, handle: ObjectHandle, new_storage: StorageId, new_parent: ObjectHandle) -> Result<ObjectHandle, Error> {
        if !self.device_info.supports_operation(StandardCommandCode::CopyObject) {
            return Err(Error::NotSupported("CopyObject"));
        }
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::CopyObject),
                params: vec![handle.raw(), new_storage.raw(), new_parent.raw()],
                data: DataPhase::None,
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        let new_handle = response.params.first().copied().ok_or_else(|| Error::Malformed("CopyObject response missing the new handle".into()))?;
        Ok(ObjectHandle::new(new_handle))
    }

    async fn get_num_objects_once(&self, storage: StorageId, parent: ObjectHandle) -> Result<u32, Error> {
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetNumObjects),
                params: vec![storage.raw(), 0, parent.raw()],
                data: DataPhase::None,
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        response.params.first().copied().ok_or_else(|| Error::Malformed("GetNumObjects response missing the count".into()))
    }

    async fn get_object_prop_value_once(&self, handle: ObjectHandle, prop: ObjectPropertyCode) -> Result<PtpData, Error> {
        let data_type = well_known_prop_data_type(prop);
        let mut buf = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            buf.extend_from_slice(chunk);
            Ok(())
        };
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetObjectPropValue),
                params: vec![handle.raw(), prop as u32],
                data: DataPhase::In(&mut sink),
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        let mut cur = std::io::Cursor::new(buf);
        PtpData::read_type(data_type, &mut cur)
    }

    async fn set_object_prop_value_once(&self, handle: ObjectHandle, prop: ObjectPropertyCode, value: &PtpData) -> Result<(), Error> {
        let encoded = value.encode();
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::SetObjectPropValue),
                params: vec![handle.raw(), prop as u32],
                data: DataPhase::Out(&encoded),
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)
    }

    async fn get_object_prop_desc_once(&self, object_format: ObjectFormatCode, prop_code: u16) -> Result<PropInfo, Error> {
        let mut buf = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<(), Error> {
            buf.extend_from_slice(chunk);
            Ok(())
        };
        let response = self
            .link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetObjectPropDesc),
                params: vec![prop_code as u32, object_format.to_u16().unwrap_or(0) as u32],
                data: DataPhase::In(&mut sink),
                io_timeout: self.policy.tuning.io_timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        let mut cur = std::io::Cursor::new(buf);
        PropInfo::decode(&mut cur)
    }

    async fn list(&mut self, parent: ObjectHandle, storage: StorageId) -> Result<mpsc::Receiver<enumeration::Batch>, Error> {
        let strategy = match self.policy.fallback.enumeration {
            Some(s) => s,
            None => {
                let prefers_prop_list = self.policy.flags.prefers_prop_list_enumeration.unwrap_or(false);
                let start = EnumerationStrategy::default_for_interface_class(self.fp.interface_class.unwrap_or(crate::quirk::PTP_INTERFACE_CLASS), prefers_prop_list);
                let (latched, _) = enumeration::probe_and_latch(&self.link, start, storage, parent, self.policy.tuning.io_timeout).await?;
                self.policy.fallback.enumeration = Some(latched);
                latched
            }
        };
        Ok(enumeration::list_paged(&self.link, strategy, storage, parent, self.policy.tuning.io_timeout, enumeration::DEFAULT_BATCH_SIZE).await)
    }

    async fn read(&self, handle: ObjectHandle, range: ByteRange, mut sink: ReadSink) -> Result<u64, Error> {
        let strategy = self.policy.fallback.read.unwrap_or(ReadStrategy::WholeObject);
        transfer::read_object(&self.link, handle, range, strategy, self.policy.tuning.max_chunk_bytes, self.policy.tuning.io_timeout, move |chunk| sink(chunk)).await
    }

    async fn write(
        &mut self,
        parent: Option<ObjectHandle>,
        storage: StorageId,
        name: String,
        format: ObjectFormatCode,
        size: u64,
        mut source: WriteSource,
    ) -> Result<ObjectHandle, Error> {
        let write_to_subfolder_only = self.policy.flags.write_to_subfolder_only.unwrap_or(false);
        let target_parent = if parent.is_none() || write_to_subfolder_only {
            let enumeration_strategy = self.policy.fallback.enumeration.unwrap_or(EnumerationStrategy::PropList5);
            transfer::resolve_write_target(
                &self.link,
                enumeration_strategy,
                storage,
                parent,
                self.policy.flags.preferred_write_folder.as_deref(),
                &[],
                self.policy.tuning.io_timeout,
            )
            .await?
        } else {
            parent.expect("checked above")
        };

        let strategy = self.policy.fallback.write.unwrap_or(WriteStrategy::ObjectInfoPrelude);
        let supports_partial_write = self.policy.flags.supports_partial_write.unwrap_or(false);

        let outcome = transfer::upload_from_reader(
            &self.link,
            strategy,
            supports_partial_write,
            storage,
            target_parent,
            &name,
            format,
            size,
            self.policy.tuning.stabilize,
            self.policy.tuning.max_chunk_bytes,
            self.policy.tuning.io_timeout,
            &self.pool,
            &mut source,
            |_| {},
        )
        .await?;
        Ok(outcome.handle)
    }

    async fn create_folder(&self, parent: ObjectHandle, storage: StorageId, name: String) -> Result<ObjectHandle, Error> {
        with_busy_backoff(&self.policy, || transfer::create_folder(&self.link, storage, parent, &name, self.policy.tuning.io_timeout)).await
    }

    async fn download_resumable(&self, handle: ObjectHandle, total_bytes: u64, dest_path: PathBuf) -> Result<PathBuf, Error> {
        let strategy = self.policy.fallback.read.unwrap_or(ReadStrategy::WholeObject);
        transfer::download_resumable(
            &self.link,
            self.journal.as_ref(),
            &self.stable_id,
            handle,
            total_bytes,
            &dest_path,
            strategy,
            self.policy.tuning.max_chunk_bytes,
            self.policy.tuning.io_timeout,
            &self.pool,
            |_| {},
        )
        .await
    }

    async fn upload_resumable(&self, storage: StorageId, parent: ObjectHandle, source_path: PathBuf, format: ObjectFormatCode) -> Result<UploadOutcome, Error> {
        let strategy = self.policy.fallback.write.unwrap_or(WriteStrategy::ObjectInfoPrelude);
        let supports_partial_write = self.policy.flags.supports_partial_write.unwrap_or(false);
        transfer::upload_resumable(
            &self.link,
            self.journal.as_ref(),
            &self.stable_id,
            strategy,
            supports_partial_write,
            storage,
            parent,
            &source_path,
            format,
            self.policy.tuning.stabilize,
            self.policy.tuning.max_chunk_bytes,
            self.policy.tuning.io_timeout,
            &self.pool,
            |_| {},
        )
        .await
    }

    #[tracing::instrument(skip(self, cmd), fields(device = %self.stable_id_label()))]
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Info(reply) => {
                let _ = reply.send(self.device_info.clone());
            }
            Command::Storages(reply) => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.storages_once()).await);
            }
            Command::List { parent, storage, reply } => {
                let _ = reply.send(self.list(parent, storage).await);
            }
            Command::GetInfo { handle, reply } => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.get_object_info_once(handle)).await);
            }
            Command::Read { handle, range, sink, reply } => {
                let _ = reply.send(self.read(handle, range, sink).await);
            }
            Command::Write {
                parent,
                storage,
                name,
                format,
                size,
                source,
                reply,
            } => {
                let _ = reply.send(self.write(parent, storage, name, format, size, source).await);
            }
            Command::CreateFolder { parent, storage, name, reply } => {
                let _ = reply.send(self.create_folder(parent, storage, name).await);
            }
            Command::Delete { handle, recursive, reply } => {
                let _ = reply.send(self.delete(handle, recursive).await);
            }
            Command::MoveObject {
                handle,
                new_storage,
                new_parent,
                reply,
            } => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.move_object_once(handle, new_storage, new_parent)).await);
            }
            Command::CopyObject {
                handle,
                new_storage,
                new_parent,
                reply,
            } => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.copy_object_once(handle, new_storage, new_parent)).await);
            }
            Command::GetNumObjects { storage, parent, reply } => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.get_num_objects_once(storage, parent)).await);
            }
            Command::GetObjectPropValue { handle, prop, reply } => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.get_object_prop_value_once(handle, prop)).await);
            }
            Command::SetObjectPropValue { handle, prop, value, reply } => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.set_object_prop_value_once(handle, prop, &value)).await);
            }
            Command::GetObjectPropDesc { object_format, prop_code, reply } => {
                let _ = reply.send(with_busy_backoff(&self.policy, || self.get_object_prop_desc_once(object_format, prop_code)).await);
            }
            Command::DownloadResumable { handle, total_bytes, dest_path, reply } => {
                let _ = reply.send(self.download_resumable(handle, total_bytes, dest_path).await);
            }
            Command::UploadResumable { storage, parent, source_path, format, reply } => {
                let _ = reply.send(self.upload_resumable(storage, parent, source_path, format).await);
            }
            Command::Close => return false,
        }
        true
    }

    fn stable_id_label(&self) -> String {
        format!("{:04x}:{:04x}", self.stable_id.vendor_id, self.stable_id.product_id)
    }
}

async fn run_actor(mut actor: Actor, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        if !actor.handle(cmd).await {
            break;
        }
    }
    if let Some(pump) = actor.pump.take() {
        pump.stop();
    }
    let _ = actor.link.release_best_effort().await;
}

impl Session {
    /// Run the open sequence (`spec.md` §4.4 "Open sequence") against
    /// `transport` and spawn the actor task that will own it for the rest
    /// of the session's lifetime.
    pub async fn open(transport: Arc<dyn crate::transport::Transport>, config: OpenConfig) -> Result<Opened, Error> {
        let mut policy = policy::resolve(&config.fingerprint, config.quirks.as_ref(), config.learned.as_ref(), &config.user);
        let link = Link::new(transport.clone(), policy.flags.no_zero_length_packets.unwrap_or(false));

        transport
            .claim(config.fingerprint.vendor_id, config.fingerprint.product_id, config.interface, policy.tuning.handshake_timeout)
            .await
            .map_err(|e| Error::from(e))?;

        if policy.tuning.reset_on_open {
            transport.reset_device().await.map_err(Error::from)?;
        }

        if !policy.tuning.post_claim_stabilize.is_zero() {
            tokio::time::sleep(policy.tuning.post_claim_stabilize).await;
        }

        let device_info = get_device_info(&link, policy.tuning.io_timeout).await?;

        let reported_serial = (!device_info.serial_number.is_empty()).then(|| device_info.serial_number.as_str());
        let stable_id = StableIdentity::from_fingerprint(&config.fingerprint, reported_serial);

        if let Err(e) = open_session_txn(&link, policy.tuning.io_timeout).await {
            if policy.flags.skip_ptp_reset == Some(true) {
                return Err(e);
            }
            link.reset_device().await?;
            open_session_txn(&link, policy.tuning.io_timeout).await?;
        }

        if !policy.tuning.stabilize.is_zero() {
            tokio::time::sleep(policy.tuning.stabilize).await;
        }

        probe_capabilities(&link, &device_info, &config.fingerprint, &mut policy, policy.tuning.io_timeout).await;

        let (pump, events) = if !policy.tuning.disable_event_pump {
            let (pump, rx) = EventPump::spawn(transport.clone(), policy.tuning.inactivity_timeout, DEFAULT_COALESCE_WINDOW);
            (Some(pump), rx)
        } else {
            let (_tx, rx) = mpsc::channel(1);
            (None, rx)
        };

        let matched_quirk_id = policy.matched_quirk_id.clone();

        let actor = Actor {
            link,
            policy,
            device_info,
            fp: config.fingerprint,
            journal: config.journal,
            stable_id: stable_id.clone(),
            pool: BufferPool::with_defaults(),
            pump,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        tokio::spawn(run_actor(actor, cmd_rx));

        Ok(Opened {
            session: Session { cmd_tx },
            stable_id,
            matched_quirk_id,
            events,
        })
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    pub async fn info(&self) -> Result<DeviceInfo, Error> {
        self.call(Command::Info).await
    }

    pub async fn storages(&self) -> Result<Vec<(StorageId, StorageInfo)>, Error> {
        self.call(Command::Storages).await?
    }

    pub async fn list(&self, parent: ObjectHandle, storage: StorageId) -> Result<mpsc::Receiver<enumeration::Batch>, Error> {
        self.call(|reply| Command::List { parent, storage, reply }).await?
    }

    pub async fn get_info(&self, handle: ObjectHandle) -> Result<ObjectInfo, Error> {
        self.call(|reply| Command::GetInfo { handle, reply }).await?
    }

    pub async fn read(&self, handle: ObjectHandle, range: ByteRange, sink: impl FnMut(&[u8]) -> Result<(), Error> + Send + 'static) -> Result<u64, Error> {
        self.call(|reply| Command::Read {
            handle,
            range,
            sink: Box::new(sink),
            reply,
        })
        .await?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        &self,
        parent: Option<ObjectHandle>,
        storage: StorageId,
        name: impl Into<String>,
        format: ObjectFormatCode,
        size: u64,
        source: impl AsyncRead + Send + 'static,
    ) -> Result<ObjectHandle, Error> {
        self.call(|reply| Command::Write {
            parent,
            storage,
            name: name.into(),
            format,
            size,
            source: Box::pin(source),
            reply,
        })
        .await?
    }

    pub async fn create_folder(&self, parent: ObjectHandle, storage: StorageId, name: impl Into<String>) -> Result<ObjectHandle, Error> {
        self.call(|reply| Command::CreateFolder {
            parent,
            storage,
            name: name.into(),
            reply,
        })
        .await?
    }

    pub async fn delete(&self, handle: ObjectHandle, recursive: bool) -> Result<(), Error> {
        self.call(|reply| Command::Delete { handle, recursive, reply }).await?
    }

    /// `MoveObject` when the device supports it; surfaces
    /// [`Error::NotSupported`] rather than emulating the move via
    /// copy-then-delete (`spec.md` §4.4 "Move").
    pub async fn move_object(&self, handle: ObjectHandle, new_storage: StorageId, new_parent: ObjectHandle) -> Result<(), Error> {
        self.call(|reply| Command::MoveObject {
            handle,
            new_storage,
            new_parent,
            reply,
        })
        .await?
    }

    /// Not in the distilled operation table, but exposed so callers who
    /// actually want copy semantics never have to go through `move` and
    /// have it silently faked (`SPEC_FULL.md` "Supplemented features").
    pub async fn copy_object(&self, handle: ObjectHandle, new_storage: StorageId, new_parent: ObjectHandle) -> Result<ObjectHandle, Error> {
        self.call(|reply| Command::CopyObject {
            handle,
            new_storage,
            new_parent,
            reply,
        })
        .await?
    }

    pub async fn get_num_objects(&self, storage: StorageId, parent: ObjectHandle) -> Result<u32, Error> {
        self.call(|reply| Command::GetNumObjects { storage, parent, reply }).await?
    }

    pub async fn get_object_prop_value(&self, handle: ObjectHandle, prop: ObjectPropertyCode) -> Result<PtpData, Error> {
        self.call(|reply| Command::GetObjectPropValue { handle, prop, reply }).await?
    }

    pub async fn set_object_prop_value(&self, handle: ObjectHandle, prop: ObjectPropertyCode, value: PtpData) -> Result<(), Error> {
        self.call(|reply| Command::SetObjectPropValue { handle, prop, value, reply }).await?
    }

    pub async fn get_object_prop_desc(&self, object_format: ObjectFormatCode, prop_code: u16) -> Result<PropInfo, Error> {
        self.call(|reply| Command::GetObjectPropDesc { object_format, prop_code, reply }).await?
    }

    /// Download to `dest_path`, resuming from a prior attempt via the
    /// journal when one exists for this `(device, handle, dest_path)`
    /// (`spec.md` §4.6, §4.8).
    pub async fn download_resumable(&self, handle: ObjectHandle, total_bytes: u64, dest_path: impl Into<PathBuf>) -> Result<PathBuf, Error> {
        let dest_path = dest_path.into();
        self.call(|reply| Command::DownloadResumable { handle, total_bytes, dest_path, reply }).await?
    }

    /// Upload `source_path`, resuming a previously paused chunked upload
    /// when the file's size/mtime still match the journal's record
    /// (`spec.md` §4.6, §4.8).
    pub async fn upload_resumable(&self, storage: StorageId, parent: ObjectHandle, source_path: impl Into<PathBuf>, format: ObjectFormatCode) -> Result<UploadOutcome, Error> {
        let source_path = source_path.into();
        self.call(|reply| Command::UploadResumable {
            storage,
            parent,
            source_path,
            format,
            reply,
        })
        .await?
    }

    /// Stop the actor task and release the transport. Further calls on
    /// this (or any clone of this) session return [`Error::Disconnected`].
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::StandardObjectFormatCode;
    use crate::policy::UserOverrides;
    use crate::quirk::QuirkDatabase;
    use crate::testutil::FakeTransport;
    use std::io::Cursor as StdCursor;

    fn device_info_bytes() -> Vec<u8> {
        use crate::data::PtpData;
        let mut buf = vec![];
        buf.extend_from_slice(&100u16.to_le_bytes()); // standard_version
        buf.extend_from_slice(&0u32.to_le_bytes()); // vendor_ex_id
        buf.extend_from_slice(&0u16.to_le_bytes()); // vendor_ex_version
        buf.extend_from_slice(&PtpData::Str(String::new()).encode()); // vendor_extension_desc
        buf.extend_from_slice(&0u16.to_le_bytes()); // functional_mode
        let ops: Vec<u16> = vec![0x1001, 0x1002, 0x1003, 0x1004, 0x1005, 0x1007, 0x1008, 0x1009, 0x100B, 0x9805];
        buf.extend_from_slice(&(ops.len() as u32).to_le_bytes());
        for op in &ops {
            buf.extend_from_slice(&op.to_le_bytes());
        }
        buf.extend_from_slice(&0u32.to_le_bytes()); // events_supported (empty)
        buf.extend_from_slice(&0u32.to_le_bytes()); // device_properties_supported
        buf.extend_from_slice(&0u32.to_le_bytes()); // capture_formats
        buf.extend_from_slice(&0u32.to_le_bytes()); // image_formats
        buf.extend_from_slice(&PtpData::Str("Acme".into()).encode());
        buf.extend_from_slice(&PtpData::Str("Camera9000".into()).encode());
        buf.extend_from_slice(&PtpData::Str("1.0".into()).encode());
        buf.extend_from_slice(&PtpData::Str("SN-1".into()).encode());
        buf
    }

    async fn open_fake() -> (Opened, Arc<FakeTransport>) {
        let fake = Arc::new(FakeTransport::new());
        // GetDeviceInfo
        fake.queue_data(StandardCommandCode::GetDeviceInfo as u16, 1, &device_info_bytes());
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        // OpenSession
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 2);
        // probe_capabilities enumeration probe: GetObjectPropList on root
        fake.queue_response_with_txid(StandardResponseCode::OperationNotSupported as u16, vec![], 3);
        fake.queue_response_with_txid(StandardResponseCode::OperationNotSupported as u16, vec![], 4);
        // handles_then_info: GetObjectHandles returns empty list
        let mut empty_handles = vec![];
        empty_handles.extend_from_slice(&0u32.to_le_bytes());
        fake.queue_data(StandardCommandCode::GetObjectHandles as u16, 5, &empty_handles);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 5);

        let config = OpenConfig {
            fingerprint: DeviceFingerprint::new(0x1234, 0x5678),
            interface: None,
            quirks: None,
            learned: None,
            user: UserOverrides::default(),
            journal: Arc::new(crate::journal::InMemoryJournalStore::default()),
        };

        let opened = Session::open(fake.clone(), config).await.unwrap();
        (opened, fake)
    }

    #[tokio::test]
    async fn open_latches_device_info_and_handles_then_info_strategy() {
        let (opened, _fake) = open_fake().await;
        let info = opened.session.info().await.unwrap();
        assert_eq!(info.manufacturer, "Acme");
        assert_eq!(info.model, "Camera9000");
    }

    #[tokio::test]
    async fn open_session_already_open_is_treated_as_success() {
        let fake = Arc::new(FakeTransport::new());
        fake.queue_data(StandardCommandCode::GetDeviceInfo as u16, 1, &device_info_bytes());
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        fake.queue_response_with_txid(StandardResponseCode::SessionAlreadyOpen as u16, vec![], 2);
        fake.queue_response_with_txid(StandardResponseCode::OperationNotSupported as u16, vec![], 3);
        fake.queue_response_with_txid(StandardResponseCode::OperationNotSupported as u16, vec![], 4);
        let mut empty_handles = vec![];
        empty_handles.extend_from_slice(&0u32.to_le_bytes());
        fake.queue_data(StandardCommandCode::GetObjectHandles as u16, 5, &empty_handles);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 5);

        let config = OpenConfig {
            fingerprint: DeviceFingerprint::new(0x1234, 0x5678),
            interface: None,
            quirks: None,
            learned: None,
            user: UserOverrides::default(),
            journal: Arc::new(crate::journal::InMemoryJournalStore::default()),
        };
        assert!(Session::open(fake, config).await.is_ok());
    }

    #[tokio::test]
    async fn move_object_surfaces_not_supported_when_device_lacks_it() {
        let (opened, _fake) = open_fake().await;
        let err = opened.session.move_object(ObjectHandle::new(5), StorageId::new(1), ObjectHandle::root()).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn get_num_objects_reads_the_response_parameter() {
        let (opened, fake) = open_fake().await;
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![42], 6);
        let count = opened.session.get_num_objects(StorageId::all(), ObjectHandle::root()).await.unwrap();
        assert_eq!(count, 42);
    }

    #[tokio::test]
    async fn busy_then_ok_retries_with_a_fresh_transaction_id() {
        let (opened, fake) = open_fake().await;
        fake.queue_response_with_txid(StandardResponseCode::DeviceBusy as u16, vec![], 6);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![7], 7);
        let count = opened.session.get_num_objects(StorageId::all(), ObjectHandle::root()).await.unwrap();
        assert_eq!(count, 7);
    }

    #[tokio::test]
    async fn delete_recursive_is_best_effort_on_child_failure() {
        let (opened, fake) = open_fake().await;

        // GetObjectInfo(folder) -> Association format
        let mut info = crate::object_info::ObjectInfo::new_folder(1, 0xFFFF_FFFF, "pics");
        info.parent_object = 0;
        let mut buf = vec![];
        info.encode(&mut buf).unwrap();
        fake.queue_data(StandardCommandCode::GetObjectInfo as u16, 6, &buf);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 6);

        // enumeration probe for children via handles_then_info (already latched)
        let mut one_handle = vec![];
        one_handle.extend_from_slice(&1u32.to_le_bytes());
        one_handle.extend_from_slice(&99u32.to_le_bytes());
        fake.queue_data(StandardCommandCode::GetObjectHandles as u16, 7, &one_handle);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 7);

        let mut child_info = crate::object_info::ObjectInfo::new_file(1, 10, "a.jpg", StandardObjectFormatCode::ExifJpeg.into(), 10);
        let mut child_buf = vec![];
        child_info.encode(&mut child_buf).unwrap();
        fake.queue_data(StandardCommandCode::GetObjectInfo as u16, 8, &child_buf);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 8);

        // child delete fails
        fake.queue_response_with_txid(StandardResponseCode::InvalidObjectHandle as u16, vec![], 9);
        // root delete succeeds
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 10);

        let result = opened.session.delete(ObjectHandle::new(10), true).await;
        assert!(result.is_ok());
    }

    #[test]
    fn quirk_db_can_be_constructed_for_open_config() {
        let json = r#"{"schemaVersion":1,"entries":[]}"#;
        assert!(QuirkDatabase::parse(json).is_ok());
    }
}
