//! The transfer engine: chunked reads and writes over a [`Link`], the
//! write-target resolution ladder, folder creation, and resumable
//! transfers backed by a [`JournalStore`] (`spec.md` §4.6).

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use num_traits::ToPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::command::{CommandCode, StandardCommandCode};
use crate::enumeration::{self, EnumerationStrategy};
use crate::fingerprint::StableIdentity;
use crate::journal::{ETag, JournalEntry, JournalStore, TransferKind, TransferState};
use crate::link::{DataPhase, Link, TransactionRequest};
use crate::object::{ObjectFormatCode, ObjectHandle, ASSOCIATION_FORMAT_CODE};
use crate::object_info::ObjectInfo;
use crate::pipeline::{BufferPool, PooledBuffer};
use crate::policy::{ReadStrategy, WriteStrategy};
use crate::proplist::{encode_send_prop_list, EnumeratedObject};
use crate::response::ResponseCode;
use crate::storage_info::StorageId;
use crate::Error;

/// Which slice of an object's bytes a read covers (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Whole,
    Range { offset: u64, length: u64 },
}

fn reject_unless_ok(code: ResponseCode) -> Result<(), Error> {
    if crate::link::is_ok_response(code) {
        Ok(())
    } else {
        Err(Error::from_response_code(code, None))
    }
}

fn missing_handle() -> Error {
    Error::Malformed("response missing the new object handle".into())
}

/// Journal writes never abort a transfer in progress: a failure here is
/// logged and the transfer proceeds with whatever durability the journal
/// already has (`spec.md` §7 "Journal and resolver errors never corrupt
/// session state").
fn log_journal_err(result: Result<(), Error>) {
    if let Err(e) = result {
        warn!("journal update failed, continuing without it: {e}");
    }
}

/// Read an object (or a byte range of it) through `on_chunk`, choosing the
/// wire shape from `strategy`. A ranged read against [`ReadStrategy::WholeObject`]
/// fails with [`Error::NotSupported`] since `GetObject` carries no range
/// parameters (`spec.md` §4.6 "Read paths").
pub async fn read_object(
    link: &Link,
    handle: ObjectHandle,
    range: ByteRange,
    strategy: ReadStrategy,
    chunk_bytes: u64,
    timeout: Duration,
    mut on_chunk: impl FnMut(&[u8]) -> Result<(), Error>,
) -> Result<u64, Error> {
    if strategy == ReadStrategy::WholeObject {
        if !matches!(range, ByteRange::Whole) {
            return Err(Error::NotSupported("byte-range reads on this device"));
        }
        let mut total = 0u64;
        let response = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::GetObject),
                params: vec![handle.raw()],
                data: DataPhase::In(&mut |chunk: &[u8]| {
                    total += chunk.len() as u64;
                    on_chunk(chunk)
                }),
                io_timeout: timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        return Ok(total);
    }

    let (mut offset, length) = match range {
        ByteRange::Whole => (0u64, u64::MAX),
        ByteRange::Range { offset, length } => (offset, length),
    };
    let unranged = matches!(range, ByteRange::Whole);
    let mut total = 0u64;

    loop {
        if total >= length {
            break;
        }
        let want = chunk_bytes.min(length.saturating_sub(total));
        if want == 0 {
            break;
        }
        let mut got = 0u64;
        let response = match strategy {
            ReadStrategy::Partial64 => {
                link.execute(TransactionRequest {
                    code: CommandCode::Standard(StandardCommandCode::GetPartialObject64),
                    params: vec![handle.raw(), offset as u32, (offset >> 32) as u32, want as u32],
                    data: DataPhase::In(&mut |chunk: &[u8]| {
                        got += chunk.len() as u64;
                        on_chunk(chunk)
                    }),
                    io_timeout: timeout,
                })
                .await?
            }
            ReadStrategy::Partial32 => {
                if offset > u32::MAX as u64 {
                    return Err(Error::NotSupported("32-bit partial reads beyond a 4 GiB offset"));
                }
                link.execute(TransactionRequest {
                    code: CommandCode::Standard(StandardCommandCode::GetPartialObject),
                    params: vec![handle.raw(), offset as u32, want as u32],
                    data: DataPhase::In(&mut |chunk: &[u8]| {
                        got += chunk.len() as u64;
                        on_chunk(chunk)
                    }),
                    io_timeout: timeout,
                })
                .await?
            }
            ReadStrategy::WholeObject => unreachable!("handled above"),
        };
        reject_unless_ok(response.code)?;
        total += got;
        offset += got;
        if got == 0 {
            break;
        }
        if unranged && got < want {
            // a short chunk on an unranged read is the device's way of
            // saying "that was the whole object".
            break;
        }
    }
    Ok(total)
}

/// Stream a full object into `writer`, overlapping the next chunk's USB
/// fetch with the previous chunk's disk write via a [`BufferPool`]
/// (`spec.md` §4.6 "Pipelined disk I/O"). Progress (cumulative bytes
/// written) is reported after every flushed chunk.
pub async fn download_to_writer<W: AsyncWrite + Unpin>(
    link: &Link,
    handle: ObjectHandle,
    total_bytes: u64,
    strategy: ReadStrategy,
    chunk_bytes: u64,
    timeout: Duration,
    pool: &BufferPool,
    mut writer: W,
    mut on_progress: impl FnMut(u64),
) -> Result<u64, Error> {
    let effective_chunk = if strategy == ReadStrategy::WholeObject {
        total_bytes.max(1)
    } else {
        chunk_bytes.max(1)
    };

    let mut offset = 0u64;
    let mut pending: Option<(PooledBuffer<'_>, usize)> = None;
    let mut total_written = 0u64;

    loop {
        let this_offset = offset;
        let fetch_next = async {
            if this_offset >= total_bytes {
                return Ok::<Option<(PooledBuffer<'_>, usize, u64)>, Error>(None);
            }
            let want = effective_chunk.min(total_bytes - this_offset);
            let mut buf = pool.acquire().await;
            let mut filled = 0usize;
            let range = if strategy == ReadStrategy::WholeObject {
                ByteRange::Whole
            } else {
                ByteRange::Range { offset: this_offset, length: want }
            };
            read_object(link, handle, range, strategy, chunk_bytes, timeout, |chunk| {
                let end = filled + chunk.len();
                if end > buf.len() {
                    buf.resize(end, 0);
                }
                buf[filled..end].copy_from_slice(chunk);
                filled = end;
                Ok(())
            })
            .await?;
            Ok(Some((buf, filled, this_offset + filled as u64)))
        };

        let flush_previous = async {
            match pending.take() {
                Some((buf, len)) => {
                    writer.write_all(&buf[..len]).await.map_err(Error::Io)?;
                    Ok::<u64, Error>(len as u64)
                }
                None => Ok(0),
            }
        };

        let (fetched, flushed) = tokio::join!(fetch_next, flush_previous);
        total_written += flushed?;
        if total_written > 0 {
            on_progress(total_written);
        }

        match fetched? {
            Some((buf, len, new_offset)) => {
                offset = new_offset;
                if len == 0 {
                    break;
                }
                pending = Some((buf, len));
            }
            None => break,
        }
    }

    if let Some((buf, len)) = pending.take() {
        writer.write_all(&buf[..len]).await.map_err(Error::Io)?;
        total_written += len as u64;
        on_progress(total_written);
    }
    writer.flush().await.map_err(Error::Io)?;
    Ok(total_written)
}

async fn send_object_info_prelude(
    link: &Link,
    storage: StorageId,
    parent: ObjectHandle,
    name: &str,
    size: u64,
    format: ObjectFormatCode,
    timeout: Duration,
) -> Result<ObjectHandle, Error> {
    // ObjectInfo's size field is u32; files at or beyond 4 GiB use the
    // conventional 0xFFFFFFFF sentinel and carry their true size only in
    // the SendObject data phase's length (`spec.md` §4.6 "ObjectInfo
    // prelude").
    let dataset_size = if size > u32::MAX as u64 { u32::MAX } else { size as u32 };
    let info = ObjectInfo::new_file(storage.raw(), parent.raw(), name, dataset_size, format);
    let mut buf = Vec::new();
    info.encode(&mut buf)?;

    let response = link
        .execute(TransactionRequest {
            code: CommandCode::Standard(StandardCommandCode::SendObjectInfo),
            params: vec![storage.raw(), parent.raw()],
            data: DataPhase::Out(&buf),
            io_timeout: timeout,
        })
        .await?;
    reject_unless_ok(response.code)?;
    let handle = response.params.first().copied().ok_or_else(missing_handle)?;
    Ok(ObjectHandle::new(handle))
}

async fn send_object_prop_list_prelude(
    link: &Link,
    storage: StorageId,
    parent: ObjectHandle,
    name: &str,
    size: u64,
    format: ObjectFormatCode,
    timeout: Duration,
) -> Result<ObjectHandle, Error> {
    let format_code = format.to_u16().unwrap_or(0);
    let payload = encode_send_prop_list(storage.raw(), parent.raw(), name, format_code, size);

    let response = link
        .execute(TransactionRequest {
            code: CommandCode::Standard(StandardCommandCode::SendObjectPropList),
            params: vec![storage.raw(), parent.raw(), format_code as u32, (size >> 32) as u32, size as u32],
            data: DataPhase::Out(&payload),
            io_timeout: timeout,
        })
        .await?;
    reject_unless_ok(response.code)?;
    let handle = response.params.first().copied().ok_or_else(missing_handle)?;
    Ok(ObjectHandle::new(handle))
}

async fn run_prelude(
    link: &Link,
    strategy: WriteStrategy,
    storage: StorageId,
    parent: ObjectHandle,
    name: &str,
    size: u64,
    format: ObjectFormatCode,
    timeout: Duration,
) -> Result<ObjectHandle, Error> {
    match strategy {
        WriteStrategy::ObjectInfoPrelude => send_object_info_prelude(link, storage, parent, name, size, format, timeout).await,
        WriteStrategy::PropListPrelude => send_object_prop_list_prelude(link, storage, parent, name, size, format, timeout).await,
    }
}

/// Send one chunk of an already-created object via `SendPartialObject`
/// (`spec.md` §4.6 "Resumable writes").
pub async fn write_chunk(link: &Link, handle: ObjectHandle, offset: u64, chunk: &[u8], timeout: Duration) -> Result<(), Error> {
    let response = link
        .execute(TransactionRequest {
            code: CommandCode::Standard(StandardCommandCode::SendPartialObject),
            params: vec![handle.raw(), offset as u32, (offset >> 32) as u32, chunk.len() as u32],
            data: DataPhase::Out(chunk),
            io_timeout: timeout,
        })
        .await?;
    reject_unless_ok(response.code)
}

pub struct UploadOutcome {
    pub handle: ObjectHandle,
    pub bytes_sent: u64,
}

/// Create an object via the latched write prelude, wait out the
/// post-prelude stabilization delay devices like the Sony Walkman need
/// before accepting `SendObject` (`spec.md` §4.6 "ObjectInfo prelude"),
/// then push the object's bytes from `reader`.
///
/// If `supports_partial_write` is set, the data phase is pipelined as a
/// series of `SendPartialObject` chunks, each overlapping its disk read
/// with the previous chunk's USB send. Otherwise the whole object is read
/// into memory and sent as a single `SendObject` data phase, since a
/// bare `SendObject` has exactly one data phase and no chunk boundary a
/// streaming send could resume from.
pub async fn upload_from_reader<R: AsyncRead + Unpin>(
    link: &Link,
    strategy: WriteStrategy,
    supports_partial_write: bool,
    storage: StorageId,
    parent: ObjectHandle,
    name: &str,
    format: ObjectFormatCode,
    total_bytes: u64,
    stabilize: Duration,
    chunk_bytes: u64,
    timeout: Duration,
    pool: &BufferPool,
    mut reader: R,
    mut on_progress: impl FnMut(u64),
) -> Result<UploadOutcome, Error> {
    let handle = run_prelude(link, strategy, storage, parent, name, total_bytes, format, timeout).await?;

    if !stabilize.is_zero() {
        tokio::time::sleep(stabilize).await;
    }

    if !supports_partial_write {
        let mut whole = Vec::with_capacity(total_bytes.min(64 * 1024 * 1024) as usize);
        reader.read_to_end(&mut whole).await.map_err(Error::Io)?;
        let response = link
            .execute(TransactionRequest {
                code: CommandCode::Standard(StandardCommandCode::SendObject),
                params: vec![],
                data: DataPhase::Out(&whole),
                io_timeout: timeout,
            })
            .await?;
        reject_unless_ok(response.code)?;
        on_progress(whole.len() as u64);
        return Ok(UploadOutcome {
            handle,
            bytes_sent: whole.len() as u64,
        });
    }

    let mut read_offset = 0u64;
    let mut pending: Option<(PooledBuffer<'_>, usize, u64)> = None;
    let mut total_sent = 0u64;

    loop {
        let this_offset = read_offset;
        let read_next = async {
            if this_offset >= total_bytes {
                return Ok::<Option<(PooledBuffer<'_>, usize)>, Error>(None);
            }
            let want = chunk_bytes.min(total_bytes - this_offset) as usize;
            let mut buf = pool.acquire().await;
            if buf.len() < want {
                buf.resize(want, 0);
            }
            let mut filled = 0usize;
            while filled < want {
                let n = reader.read(&mut buf[filled..want]).await.map_err(Error::Io)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(Some((buf, filled)))
        };

        let send_previous = async {
            match pending.take() {
                Some((buf, len, start)) if len > 0 => {
                    write_chunk(link, handle, start, &buf[..len], timeout).await?;
                    Ok::<u64, Error>(len as u64)
                }
                _ => Ok(0),
            }
        };

        let (read_result, sent) = tokio::join!(read_next, send_previous);
        total_sent += sent?;
        if total_sent > 0 {
            on_progress(total_sent);
        }

        match read_result? {
            Some((buf, len)) => {
                if len == 0 {
                    break;
                }
                pending = Some((buf, len, this_offset));
                read_offset = this_offset + len as u64;
            }
            None => break,
        }
    }

    if let Some((buf, len, start)) = pending.take() {
        write_chunk(link, handle, start, &buf[..len], timeout).await?;
        total_sent += len as u64;
        on_progress(total_sent);
    }

    Ok(UploadOutcome { handle, bytes_sent: total_sent })
}

/// Create a folder: `SendObjectInfo` with a folder dataset, followed by
/// the empty `SendObject` data phase every folder creation carries
/// (`spec.md` §4.6 "Folder creation").
pub async fn create_folder(link: &Link, storage: StorageId, parent: ObjectHandle, name: &str, timeout: Duration) -> Result<ObjectHandle, Error> {
    let info = ObjectInfo::new_folder(storage.raw(), parent.raw(), name);
    let mut buf = Vec::new();
    info.encode(&mut buf)?;

    let response = link
        .execute(TransactionRequest {
            code: CommandCode::Standard(StandardCommandCode::SendObjectInfo),
            params: vec![storage.raw(), parent.raw()],
            data: DataPhase::Out(&buf),
            io_timeout: timeout,
        })
        .await?;
    reject_unless_ok(response.code)?;
    let handle = response.params.first().copied().ok_or_else(missing_handle)?;

    let send_response = link
        .execute(TransactionRequest {
            code: CommandCode::Standard(StandardCommandCode::SendObject),
            params: vec![],
            data: DataPhase::Out(&[]),
            io_timeout: timeout,
        })
        .await?;
    reject_unless_ok(send_response.code)?;

    Ok(ObjectHandle::new(handle))
}

const WELL_KNOWN_FOLDER_NAMES: [&str; 6] = ["Download", "Downloads", "DCIM", "Camera", "Pictures", "Documents"];

/// Folder created at a storage's root as the last resort of the
/// write-target ladder (`spec.md` §4.6 "Write-target resolution").
pub const FALLBACK_FOLDER_NAME: &str = "SwiftMTP";

/// Resolve where a write should land, per the ladder in `spec.md` §4.6:
/// an explicit parent, then the quirk's preferred folder name, then a
/// well-known folder name, then any first-level folder, then a freshly
/// created fallback folder at the storage root. `excluded_parents` rules
/// out folders a previous attempt already failed against.
pub async fn resolve_write_target(
    link: &Link,
    strategy: EnumerationStrategy,
    storage: StorageId,
    explicit_parent: Option<ObjectHandle>,
    preferred_folder_name: Option<&str>,
    excluded_parents: &[ObjectHandle],
    timeout: Duration,
) -> Result<ObjectHandle, Error> {
    if let Some(parent) = explicit_parent {
        if !excluded_parents.contains(&parent) {
            return Ok(parent);
        }
    }

    let (_, root_entries) = enumeration::probe_and_latch(link, strategy, storage, ObjectHandle::root(), timeout).await?;
    let folders: Vec<&EnumeratedObject> = root_entries.iter().filter(|e| e.format == Some(ASSOCIATION_FORMAT_CODE)).collect();

    let find_by_name = |name: &str| -> Option<ObjectHandle> {
        folders
            .iter()
            .find(|f| f.filename.as_deref() == Some(name))
            .map(|f| ObjectHandle::new(f.handle))
    };

    if let Some(name) = preferred_folder_name {
        if let Some(handle) = find_by_name(name) {
            if !excluded_parents.contains(&handle) {
                return Ok(handle);
            }
        }
    }

    for name in WELL_KNOWN_FOLDER_NAMES {
        if let Some(handle) = find_by_name(name) {
            if !excluded_parents.contains(&handle) {
                return Ok(handle);
            }
        }
    }

    if let Some(first) = folders.iter().map(|f| ObjectHandle::new(f.handle)).find(|h| !excluded_parents.contains(h)) {
        return Ok(first);
    }

    create_folder(link, storage, ObjectHandle::root(), FALLBACK_FOLDER_NAME, timeout).await
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".swiftmtp-part");
    dest.with_file_name(name)
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn etag_for(path: &Path) -> Option<ETag> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let mtime = meta.modified().ok()?;
    let mtime_unix_ms = mtime.duration_since(std::time::UNIX_EPOCH).ok()?.as_millis() as u64;
    Some(ETag {
        size: meta.len(),
        mtime_unix_ms,
    })
}

/// Download an object to `dest_path`, journaling progress so the transfer
/// can resume after a crash or disconnect, and committing atomically via
/// rename once the whole object has landed on disk (`spec.md` §4.6
/// "Atomic commit", §4.8).
#[tracing::instrument(skip(link, journal, pool, on_progress), fields(handle = handle.raw(), total_bytes))]
pub async fn download_resumable(
    link: &Link,
    journal: &dyn JournalStore,
    device: &StableIdentity,
    handle: ObjectHandle,
    total_bytes: u64,
    dest_path: &Path,
    strategy: ReadStrategy,
    chunk_bytes: u64,
    timeout: Duration,
    pool: &BufferPool,
    mut on_progress: impl FnMut(u64),
) -> Result<PathBuf, Error> {
    let temp_path = temp_path_for(dest_path);
    let existing = journal
        .resumable_for_device(device)
        .await?
        .into_iter()
        .find(|e| e.kind == TransferKind::Read && e.local_final_path == dest_path && e.remote_handle == Some(handle.raw()));

    let id = existing.as_ref().map(|e| e.id).unwrap_or_else(Uuid::new_v4);
    let mut entry = existing.unwrap_or_else(|| JournalEntry {
        id,
        device_stable_id: device.clone(),
        kind: TransferKind::Read,
        remote_handle: Some(handle.raw()),
        remote_parent_handle: 0,
        filename: dest_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        total_bytes,
        committed_bytes: 0,
        supports_partial: strategy != ReadStrategy::WholeObject,
        local_temp_path: temp_path.clone(),
        local_final_path: dest_path.to_owned(),
        etag: None,
        state: TransferState::Active,
        updated_at_unix_ms: now_unix_ms(),
        last_error: None,
    });

    if let Some(parent) = dest_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
    }
    let mut file = tokio::fs::File::create(&temp_path).await.map_err(Error::Io)?;

    entry.state = TransferState::Active;
    entry.updated_at_unix_ms = now_unix_ms();
    log_journal_err(journal.put(entry.clone()).await);

    let written = download_to_writer(link, handle, total_bytes, strategy, chunk_bytes, timeout, pool, &mut file, |n| {
        entry.committed_bytes = n;
        on_progress(n);
    })
    .await;

    let written = match written {
        Ok(n) => n,
        Err(e) => {
            entry.state = TransferState::Paused;
            entry.last_error = Some(e.to_string());
            entry.updated_at_unix_ms = now_unix_ms();
            log_journal_err(journal.put(entry).await);
            return Err(e);
        }
    };

    if written != total_bytes {
        entry.state = TransferState::Failed;
        entry.last_error = Some(format!("expected {total_bytes} bytes, received {written}"));
        entry.updated_at_unix_ms = now_unix_ms();
        log_journal_err(journal.put(entry).await);
        return Err(Error::VerificationFailed {
            expected: total_bytes,
            actual: written,
        });
    }

    tokio::fs::rename(&temp_path, dest_path).await.map_err(Error::Io)?;
    entry.etag = etag_for(dest_path).await;
    entry.state = TransferState::Done;
    entry.updated_at_unix_ms = now_unix_ms();
    log_journal_err(journal.put(entry).await);
    log_journal_err(journal.delete(id).await);

    Ok(dest_path.to_owned())
}

/// Upload `source_path` to `parent` on `storage`, journaling progress and
/// resuming a previously-paused chunked upload when the local file's
/// [`ETag`] still matches what the journal recorded (`spec.md` §4.6,
/// §4.8).
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip(link, journal, pool, on_progress), fields(parent = parent.raw()))]
pub async fn upload_resumable(
    link: &Link,
    journal: &dyn JournalStore,
    device: &StableIdentity,
    strategy: WriteStrategy,
    supports_partial_write: bool,
    storage: StorageId,
    parent: ObjectHandle,
    source_path: &Path,
    format: ObjectFormatCode,
    stabilize: Duration,
    chunk_bytes: u64,
    timeout: Duration,
    pool: &BufferPool,
    mut on_progress: impl FnMut(u64),
) -> Result<UploadOutcome, Error> {
    let name = source_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let meta = tokio::fs::metadata(source_path).await.map_err(Error::Io)?;
    let total_bytes = meta.len();
    let current_etag = etag_for(source_path).await;

    let existing = journal
        .resumable_for_device(device)
        .await?
        .into_iter()
        .find(|e| e.kind == TransferKind::Write && e.local_final_path == source_path && e.remote_parent_handle == parent.raw() && e.etag == current_etag);

    let id = existing.as_ref().map(|e| e.id).unwrap_or_else(Uuid::new_v4);
    let mut entry = existing.unwrap_or_else(|| JournalEntry {
        id,
        device_stable_id: device.clone(),
        kind: TransferKind::Write,
        remote_handle: None,
        remote_parent_handle: parent.raw(),
        filename: name.clone(),
        total_bytes,
        committed_bytes: 0,
        supports_partial: supports_partial_write,
        local_temp_path: source_path.to_owned(),
        local_final_path: source_path.to_owned(),
        etag: current_etag,
        state: TransferState::Active,
        updated_at_unix_ms: now_unix_ms(),
        last_error: None,
    });

    let mut file = tokio::fs::File::open(source_path).await.map_err(Error::Io)?;

    entry.state = TransferState::Active;
    entry.updated_at_unix_ms = now_unix_ms();
    log_journal_err(journal.put(entry.clone()).await);

    let outcome = upload_from_reader(
        link,
        strategy,
        supports_partial_write,
        storage,
        parent,
        &name,
        format,
        total_bytes,
        stabilize,
        chunk_bytes,
        timeout,
        pool,
        &mut file,
        |n| {
            entry.committed_bytes = n;
            on_progress(n);
        },
    )
    .await;

    match outcome {
        Ok(outcome) => {
            entry.remote_handle = Some(outcome.handle.raw());
            entry.committed_bytes = outcome.bytes_sent;
            entry.state = TransferState::Done;
            entry.updated_at_unix_ms = now_unix_ms();
            log_journal_err(journal.put(entry).await);
            log_journal_err(journal.delete(id).await);
            Ok(outcome)
        }
        Err(e) => {
            entry.state = TransferState::Paused;
            entry.last_error = Some(e.to_string());
            entry.updated_at_unix_ms = now_unix_ms();
            log_journal_err(journal.put(entry).await);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournalStore;
    use crate::object::ObjectFormatCode;
    use crate::response::StandardResponseCode;
    use crate::testutil::FakeTransport;
    use num_traits::FromPrimitive;
    use std::sync::Arc;

    fn device() -> StableIdentity {
        StableIdentity::reported(0x04e8, 0x6860, "SN1".into())
    }

    #[tokio::test]
    async fn whole_object_read_rejects_a_byte_range() {
        let fake = FakeTransport::new();
        let link = Link::new(Arc::new(fake), false);
        let result = read_object(
            &link,
            ObjectHandle::new(1),
            ByteRange::Range { offset: 10, length: 5 },
            ReadStrategy::WholeObject,
            1024,
            Duration::from_secs(1),
            |_| Ok(()),
        )
        .await;
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn whole_object_read_streams_the_full_payload() {
        let fake = FakeTransport::new();
        fake.queue_data(StandardCommandCode::GetObject as u16, 1, b"hello world");
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        let link = Link::new(Arc::new(fake), false);

        let mut received = Vec::new();
        let total = read_object(&link, ObjectHandle::new(1), ByteRange::Whole, ReadStrategy::WholeObject, 1024, Duration::from_secs(1), |chunk| {
            received.extend_from_slice(chunk);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(total, 11);
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn partial64_read_issues_one_request_per_chunk() {
        let fake = FakeTransport::new();
        fake.queue_data(StandardCommandCode::GetPartialObject64 as u16, 1, b"abcd");
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        fake.queue_data(StandardCommandCode::GetPartialObject64 as u16, 2, b"ef");
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 2);
        let link = Link::new(Arc::new(fake), false);

        let mut received = Vec::new();
        let total = read_object(
            &link,
            ObjectHandle::new(1),
            ByteRange::Range { offset: 0, length: 6 },
            ReadStrategy::Partial64,
            4,
            Duration::from_secs(1),
            |chunk| {
                received.extend_from_slice(chunk);
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(total, 6);
        assert_eq!(received, b"abcdef");
    }

    #[tokio::test]
    async fn download_to_writer_pipelines_chunks_into_a_buffer() {
        let fake = FakeTransport::new();
        fake.queue_data(StandardCommandCode::GetPartialObject64 as u16, 1, b"0123");
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        fake.queue_data(StandardCommandCode::GetPartialObject64 as u16, 2, b"45");
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 2);
        let link = Link::new(Arc::new(fake), false);
        let pool = BufferPool::new(2, 4);

        let mut out = Vec::new();
        let written = download_to_writer(&link, ObjectHandle::new(1), 6, ReadStrategy::Partial64, 4, Duration::from_secs(1), &pool, &mut out, |_| {})
            .await
            .unwrap();

        assert_eq!(written, 6);
        assert_eq!(out, b"012345");
    }

    #[tokio::test]
    async fn object_info_prelude_write_sends_one_data_phase() {
        let fake = FakeTransport::new();
        fake.queue_response(StandardResponseCode::Ok as u16, vec![0x4242]);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 2);
        let link = Link::new(Arc::new(fake), false);
        let pool = BufferPool::with_defaults();

        let outcome = upload_from_reader(
            &link,
            WriteStrategy::ObjectInfoPrelude,
            false,
            StorageId::new(0x0001_0001),
            ObjectHandle::root(),
            "a.jpg",
            ObjectFormatCode::from_u16(0x3801).unwrap(),
            5,
            Duration::from_millis(0),
            1024,
            Duration::from_secs(1),
            &pool,
            std::io::Cursor::new(b"hello".to_vec()),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.handle.raw(), 0x4242);
        assert_eq!(outcome.bytes_sent, 5);
    }

    #[tokio::test]
    async fn create_folder_sends_dataset_then_empty_object() {
        let fake = FakeTransport::new();
        fake.queue_response(StandardResponseCode::Ok as u16, vec![0x10]);
        fake.queue_response_with_txid(StandardResponseCode::Ok as u16, vec![], 2);
        let link = Link::new(Arc::new(fake), false);

        let handle = create_folder(&link, StorageId::new(0x0001_0001), ObjectHandle::root(), "DCIM", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handle.raw(), 0x10);
    }

    #[tokio::test]
    async fn download_resumable_commits_and_clears_the_journal_entry() {
        let fake = FakeTransport::new();
        fake.queue_data(StandardCommandCode::GetObject as u16, 1, b"payload!");
        fake.queue_response(StandardResponseCode::Ok as u16, vec![]);
        let link = Link::new(Arc::new(fake), false);
        let journal = InMemoryJournalStore::new();
        let pool = BufferPool::with_defaults();
        let dest = std::env::temp_dir().join(format!("swiftmtp-transfer-test-{}.bin", Uuid::new_v4()));

        let path = download_resumable(
            &link,
            &journal,
            &device(),
            ObjectHandle::new(1),
            8,
            &dest,
            ReadStrategy::WholeObject,
            1024,
            Duration::from_secs(1),
            &pool,
            |_| {},
        )
        .await
        .unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"payload!");
        assert!(journal.resumable_for_device(&device()).await.unwrap().is_empty());

        let _ = tokio::fs::remove_file(&dest).await;
    }
}
