//! The resumable-transfer journal: a durable record per in-flight transfer,
//! keyed by a UUID assigned at start (`spec.md` §4.8, §6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::fingerprint::StableIdentity;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Active,
    Paused,
    Done,
    Failed,
}

/// An entry's integrity tag: local file size + mtime, used to detect
/// whether a paused transfer's local temp file is still what the journal
/// thinks it is before resuming (`spec.md` §4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ETag {
    pub size: u64,
    pub mtime_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub device_stable_id: StableIdentity,
    pub kind: TransferKind,
    pub remote_handle: Option<u32>,
    pub remote_parent_handle: u32,
    pub filename: String,
    pub total_bytes: u64,
    pub committed_bytes: u64,
    pub supports_partial: bool,
    pub local_temp_path: PathBuf,
    pub local_final_path: PathBuf,
    pub etag: Option<ETag>,
    pub state: TransferState,
    pub updated_at_unix_ms: u64,
    pub last_error: Option<String>,
}

impl JournalEntry {
    /// `true` if the transition from `from` to `self.state` is one of the
    /// allowed atomic transitions (`spec.md` §4.8 "Atomic status
    /// transitions"). Used defensively by store implementations before
    /// persisting a state change.
    pub fn is_valid_transition(from: TransferState, to: TransferState) -> bool {
        matches!(
            (from, to),
            (TransferState::Active, TransferState::Paused)
                | (TransferState::Active, TransferState::Done)
                | (TransferState::Active, TransferState::Failed)
                | (TransferState::Paused, TransferState::Active)
                | (TransferState::Paused, TransferState::Failed)
        )
    }
}

/// A durable key-value store for journal entries, keyed by UUID
/// (`spec.md` §6 "Transfer journal store"). A journal write failure must
/// never corrupt session state: callers log and continue on `Err`
/// (`spec.md` §7 "Propagation policy").
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn put(&self, entry: JournalEntry) -> Result<(), Error>;
    async fn get(&self, id: Uuid) -> Result<Option<JournalEntry>, Error>;
    async fn delete(&self, id: Uuid) -> Result<(), Error>;
    /// Entries in state `active` or `paused` for the given device, used on
    /// reconnect to decide what to resume or clean up (`spec.md` §4.8).
    async fn resumable_for_device(&self, device: &StableIdentity) -> Result<Vec<JournalEntry>, Error>;
}

/// An in-process, non-durable [`JournalStore`] — the default for tests and
/// for embedders who accept losing in-flight transfer state across
/// process restarts. A file-backed store is a thin serialization layer on
/// top of the same entry type and is left to embedders per `spec.md` §6's
/// "a flat file directory is sufficient".
#[derive(Default)]
pub struct InMemoryJournalStore {
    entries: Mutex<HashMap<Uuid, JournalEntry>>,
}

impl InMemoryJournalStore {
    pub fn new() -> InMemoryJournalStore {
        InMemoryJournalStore::default()
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn put(&self, entry: JournalEntry) -> Result<(), Error> {
        self.entries.lock().unwrap().insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JournalEntry>, Error> {
        Ok(self.entries.lock().unwrap().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), Error> {
        self.entries.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn resumable_for_device(&self, device: &StableIdentity) -> Result<Vec<JournalEntry>, Error> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| &e.device_stable_id == device)
            .filter(|e| matches!(e.state, TransferState::Active | TransferState::Paused))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Record {
    Entry(JournalEntry),
    Tombstone { id: Uuid },
}

/// A durable [`JournalStore`] backed by a single JSON-lines flat file
/// (`spec.md` §6 "a SQL table or a flat file directory is sufficient").
/// Every `put`/`delete` appends a record; readers fold the file to the
/// latest record per id, so the file only needs to be rewritten
/// (compacted) occasionally rather than on every write. A
/// `tokio::sync::Mutex` serializes access to the file handle so concurrent
/// transfers never interleave partial lines.
pub struct FileJournalStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileJournalStore {
    /// Opens (creating if absent) the journal file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<FileJournalStore, Error> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Io(e))?;
            }
        }
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::File::create(&path).await.map_err(|e| Error::Io(e))?;
        }
        Ok(FileJournalStore {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn read_records(path: &Path) -> Result<HashMap<Uuid, JournalEntry>, Error> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut live: HashMap<Uuid, JournalEntry> = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line).map_err(|e| Error::Malformed(e.to_string()))?;
            match record {
                Record::Entry(entry) => {
                    live.insert(entry.id, entry);
                }
                Record::Tombstone { id } => {
                    live.remove(&id);
                }
            }
        }
        Ok(live)
    }

    async fn append(&self, record: &Record) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        let line = serde_json::to_string(record).map_err(|e| Error::Malformed(e.to_string()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Io(e))?;
        file.write_all(line.as_bytes()).await.map_err(|e| Error::Io(e))?;
        file.write_all(b"\n").await.map_err(|e| Error::Io(e))?;
        file.flush().await.map_err(|e| Error::Io(e))?;
        Ok(())
    }
}

#[async_trait]
impl JournalStore for FileJournalStore {
    async fn put(&self, entry: JournalEntry) -> Result<(), Error> {
        self.append(&Record::Entry(entry)).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<JournalEntry>, Error> {
        let _guard = self.lock.lock().await;
        let live = FileJournalStore::read_records(&self.path).await?;
        Ok(live.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), Error> {
        self.append(&Record::Tombstone { id }).await
    }

    async fn resumable_for_device(&self, device: &StableIdentity) -> Result<Vec<JournalEntry>, Error> {
        let _guard = self.lock.lock().await;
        let live = FileJournalStore::read_records(&self.path).await?;
        Ok(live
            .into_values()
            .filter(|e| &e.device_stable_id == device)
            .filter(|e| matches!(e.state, TransferState::Active | TransferState::Paused))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::SerialKind;

    fn sample_entry(id: Uuid, device: StableIdentity, state: TransferState) -> JournalEntry {
        JournalEntry {
            id,
            device_stable_id: device,
            kind: TransferKind::Write,
            remote_handle: None,
            remote_parent_handle: 0xFFFF_FFFF,
            filename: "video.mp4".into(),
            total_bytes: 1_000_000,
            committed_bytes: 0,
            supports_partial: true,
            local_temp_path: PathBuf::from("/tmp/video.mp4.part"),
            local_final_path: PathBuf::from("/tmp/video.mp4"),
            etag: None,
            state,
            updated_at_unix_ms: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn put_and_get_round_trips() {
        let store = InMemoryJournalStore::new();
        let device = StableIdentity {
            vendor_id: 0x04e8,
            product_id: 0x6860,
            serial: SerialKind::Reported("SN1".into()),
        };
        let id = Uuid::new_v4();
        store.put(sample_entry(id, device, TransferState::Active)).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.filename, "video.mp4");
        assert_eq!(fetched.committed_bytes, 0);
    }

    #[tokio::test]
    async fn resumable_for_device_filters_by_state_and_identity() {
        let store = InMemoryJournalStore::new();
        let device_a = StableIdentity {
            vendor_id: 0x04e8,
            product_id: 0x6860,
            serial: SerialKind::Reported("SN1".into()),
        };
        let device_b = StableIdentity {
            vendor_id: 0x04e8,
            product_id: 0x6861,
            serial: SerialKind::Reported("SN2".into()),
        };

        store.put(sample_entry(Uuid::new_v4(), device_a.clone(), TransferState::Active)).await.unwrap();
        store.put(sample_entry(Uuid::new_v4(), device_a.clone(), TransferState::Done)).await.unwrap();
        store.put(sample_entry(Uuid::new_v4(), device_b, TransferState::Paused)).await.unwrap();

        let resumable = store.resumable_for_device(&device_a).await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].state, TransferState::Active);
    }

    #[tokio::test]
    async fn file_store_round_trips_and_honours_tombstones() {
        let path = std::env::temp_dir().join(format!("swiftmtp-journal-test-{}.jsonl", Uuid::new_v4()));
        let store = FileJournalStore::open(&path).await.unwrap();
        let device = StableIdentity {
            vendor_id: 0x04e8,
            product_id: 0x6860,
            serial: SerialKind::Reported("SN1".into()),
        };
        let id = Uuid::new_v4();
        store.put(sample_entry(id, device.clone(), TransferState::Active)).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.filename, "video.mp4");

        let resumable = store.resumable_for_device(&device).await.unwrap();
        assert_eq!(resumable.len(), 1);

        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn transitions_follow_the_allowed_state_machine() {
        assert!(JournalEntry::is_valid_transition(TransferState::Active, TransferState::Paused));
        assert!(JournalEntry::is_valid_transition(TransferState::Active, TransferState::Done));
        assert!(JournalEntry::is_valid_transition(TransferState::Paused, TransferState::Active));
        assert!(!JournalEntry::is_valid_transition(TransferState::Done, TransferState::Active));
        assert!(!JournalEntry::is_valid_transition(TransferState::Failed, TransferState::Active));
    }
}
