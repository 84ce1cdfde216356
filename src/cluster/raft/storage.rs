//! Raft storage over the segmented log engine.
//!
//! One [`RaftStore`] backs both halves of openraft's storage surface:
//!
//! - the Raft log lives in a segmented [`Log`] opened at an initial offset
//!   of 1 (Raft indices start at 1), each entry stored as a record with
//!   `offset = index`, `term = term`, `kind` tagging the payload variant
//!   and `value` carrying the payload bytes;
//! - the state machine applies committed append commands into the data
//!   log and snapshots/restores it through the log's raw byte stream;
//! - vote, purge and apply bookkeeping plus the membership config live in
//!   a small file-backed key/value stable store, rewritten atomically.
//!
//! Snapshot files are committed in two phases (data first, then the
//! metadata file as the commit marker) with orphaned temp files swept at
//! open.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io::{Cursor, Read};
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use openraft::storage::LogState;
use openraft::{
    BasicNode, CommittedLeaderId, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId,
    OptionalSend, RaftLogReader, RaftSnapshotBuilder, RaftStorage, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, Vote,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::Record;
use crate::cluster::raft::types::{decode_append_request, ApplyResponse, NodeId, TypeConfig};
use crate::error::{ClusterError, ClusterResult, LogResult};
use crate::storage::{Log, LogConfig};

const KEY_VOTE: &str = "vote";
const KEY_LAST_PURGED: &str = "last_purged";
const KEY_LAST_APPLIED: &str = "last_applied";
const KEY_MEMBERSHIP: &str = "membership";

/// Payload kind tags stored in each raft-log record.
const KIND_NORMAL: u32 = 0;
const KIND_BLANK: u32 = 1;
const KIND_MEMBERSHIP: u32 = 2;

type StorageResult<T> = Result<T, StorageError<NodeId>>;

fn storage_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: impl std::fmt::Display,
) -> StorageError<NodeId> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(err.to_string()))
}

/// File-backed key/value store for Raft's durable bookkeeping: term/vote,
/// purge and apply watermarks, membership config.
struct StableStore {
    path: PathBuf,
    entries: HashMap<String, Vec<u8>>,
}

impl StableStore {
    fn open(path: PathBuf) -> LogResult<Self> {
        let entries = if path.exists() {
            let bytes = std::fs::read(&path)?;
            bincode::deserialize(&bytes)
                .map_err(|e| crate::error::LogError::Codec(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(StableStore { path, entries })
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.entries.get(key)?;
        bincode::deserialize(bytes).ok()
    }

    fn set<T: Serialize>(&mut self, key: &str, value: &T) -> LogResult<()> {
        let bytes =
            bincode::serialize(value).map_err(|e| crate::error::LogError::Codec(e.to_string()))?;
        self.entries.insert(key.to_string(), bytes);
        let serialized = bincode::serialize(&self.entries)
            .map_err(|e| crate::error::LogError::Codec(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshot metadata persisted next to the snapshot data file.
#[derive(Clone, Serialize, Deserialize)]
struct SnapshotFileMeta {
    last_log_id: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot_id: String,
}

/// Combined Raft log and state machine storage.
pub struct RaftStore {
    stable: Arc<Mutex<StableStore>>,
    /// Raft's own log entries, in a segmented log at initial offset 1.
    raft_log: Arc<Log>,
    /// The data log committed entries are applied into.
    fsm_log: Arc<Log>,
    snapshot_dir: PathBuf,
}

impl Clone for RaftStore {
    fn clone(&self) -> Self {
        Self {
            stable: Arc::clone(&self.stable),
            raft_log: Arc::clone(&self.raft_log),
            fsm_log: Arc::clone(&self.fsm_log),
            snapshot_dir: self.snapshot_dir.clone(),
        }
    }
}

impl RaftStore {
    /// Open the store under `raft_dir`, laying out `stable/`, `log/` and
    /// `snapshots/` subdirectories.
    pub fn open(raft_dir: &Path, fsm_log: Arc<Log>, segment: LogConfig) -> ClusterResult<Self> {
        let stable_dir = raft_dir.join("stable");
        let log_dir = raft_dir.join("log");
        let snapshot_dir = raft_dir.join("snapshots");
        for dir in [&stable_dir, &log_dir, &snapshot_dir] {
            std::fs::create_dir_all(dir).map_err(crate::error::LogError::Io)?;
        }

        let stable = StableStore::open(stable_dir.join("state.db"))?;
        let raft_log = Log::open(
            log_dir,
            LogConfig {
                initial_offset: 1,
                ..segment
            },
        )?;

        let store = RaftStore {
            stable: Arc::new(Mutex::new(stable)),
            raft_log: Arc::new(raft_log),
            fsm_log,
            snapshot_dir,
        };
        store.cleanup_temp_files();
        Ok(store)
    }

    /// Whether any prior Raft state exists in the stable, log, or snapshot
    /// stores. Used to decide whether a bootstrap node may initialize.
    pub fn has_existing_state(&self) -> bool {
        let stable_used = !self.stable.lock().unwrap().is_empty();
        stable_used || !self.raft_log.is_empty_log() || self.meta_path().exists()
    }

    fn meta_path(&self) -> PathBuf {
        self.snapshot_dir.join("current.meta")
    }

    fn data_path(&self) -> PathBuf {
        self.snapshot_dir.join("current.snapshot")
    }

    /// Sweep `temp-*` files left behind by snapshot writes that died before
    /// their rename.
    fn cleanup_temp_files(&self) {
        let entries = match std::fs::read_dir(&self.snapshot_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("temp-") {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => info!(path = %entry.path().display(), "cleaned up orphaned snapshot temp file"),
                    Err(e) => debug!(error = %e, "failed to delete snapshot temp file"),
                }
            }
        }
    }

    /// Two-phase snapshot commit: temp files first, then rename data, then
    /// rename the metadata file as the commit marker.
    fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        data: &[u8],
    ) -> StorageResult<()> {
        let temp_data = self
            .snapshot_dir
            .join(format!("temp-{}.snapshot", meta.snapshot_id));
        let temp_meta = self
            .snapshot_dir
            .join(format!("temp-{}.meta", meta.snapshot_id));

        let file_meta = SnapshotFileMeta {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let meta_bytes = bincode::serialize(&file_meta)
            .map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        let write = |res: std::io::Result<()>| {
            res.map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))
        };
        if let Err(e) = write(std::fs::write(&temp_data, data)) {
            let _ = std::fs::remove_file(&temp_data);
            return Err(e);
        }
        if let Err(e) = write(std::fs::write(&temp_meta, &meta_bytes)) {
            let _ = std::fs::remove_file(&temp_data);
            let _ = std::fs::remove_file(&temp_meta);
            return Err(e);
        }
        write(std::fs::rename(&temp_data, self.data_path()))?;
        write(std::fs::rename(&temp_meta, self.meta_path()))?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "persisted snapshot"
        );
        Ok(())
    }

    fn load_snapshot(&self) -> StorageResult<Option<(SnapshotMeta<NodeId, BasicNode>, Vec<u8>)>> {
        let meta_bytes = match std::fs::read(self.meta_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e)),
        };
        let file_meta: SnapshotFileMeta = bincode::deserialize(&meta_bytes)
            .map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        // The metadata is the commit marker; a missing data file here means
        // a torn snapshot, which must fail loudly rather than restore empty.
        let data = std::fs::read(self.data_path())
            .map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        Ok(Some((
            SnapshotMeta {
                last_log_id: file_meta.last_log_id,
                last_membership: file_meta.last_membership,
                snapshot_id: file_meta.snapshot_id,
            },
            data,
        )))
    }

    /// Replay a snapshot byte stream into the data log.
    ///
    /// The stream is the store-file framing: `[u64 BE length][record]`.
    /// The first record decides the log's new initial offset; every record
    /// is then re-appended in order.
    fn restore_from_bytes(&self, data: &[u8]) -> ClusterResult<()> {
        let mut at = 0usize;
        let mut first = true;
        while at < data.len() {
            if at + 8 > data.len() {
                return Err(ClusterError::Raft(
                    "snapshot stream ends inside a length prefix".to_string(),
                ));
            }
            let len = u64::from_be_bytes(data[at..at + 8].try_into().unwrap()) as usize;
            at += 8;
            if at + len > data.len() {
                return Err(ClusterError::Raft(
                    "snapshot stream ends inside a record".to_string(),
                ));
            }
            let record = Record::decode(&data[at..at + len])?;
            at += len;
            if first {
                self.fsm_log.reset_to(record.offset)?;
                first = false;
            }
            self.fsm_log.append(record)?;
        }
        Ok(())
    }

    fn apply_append(&self, data: &[u8], log_id: &LogId<NodeId>) -> ClusterResult<u64> {
        let req = decode_append_request(data)?;
        let mut record = req.record;
        record.term = log_id.leader_id.term;
        Ok(self.fsm_log.append(record)?)
    }

    /// Remove every raft-log entry at or above `index` (conflict deletion).
    ///
    /// The segmented log is append-only, so the surviving prefix is read
    /// out, the log is reset, and the survivors are re-appended. This is a
    /// rare, follower-only path taken on leadership changes.
    fn truncate_raft_log_from(&self, index: u64) -> LogResult<()> {
        let lowest = self.raft_log.lowest_offset();
        let highest = self.raft_log.highest_offset();
        let mut survivors = Vec::new();
        if !self.raft_log.is_empty_log() && index > lowest {
            for off in lowest..index.min(highest + 1) {
                survivors.push(self.raft_log.read(off)?);
            }
        }
        warn!(
            from_index = index,
            surviving = survivors.len(),
            "truncating conflicting raft log suffix"
        );
        self.raft_log.reset_to(lowest.min(index))?;
        for record in survivors {
            self.raft_log.append(record)?;
        }
        Ok(())
    }
}

fn entry_to_record(entry: &Entry<TypeConfig>) -> Result<Record, bincode::Error> {
    let (kind, value) = match &entry.payload {
        EntryPayload::Blank => (KIND_BLANK, Vec::new()),
        EntryPayload::Normal(data) => (KIND_NORMAL, data.clone()),
        EntryPayload::Membership(m) => (KIND_MEMBERSHIP, bincode::serialize(m)?),
    };
    Ok(Record {
        value,
        offset: entry.log_id.index,
        term: entry.log_id.leader_id.term,
        kind,
    })
}

fn record_log_id(record: &Record) -> LogId<NodeId> {
    LogId::new(CommittedLeaderId::new(record.term, 0), record.offset)
}

fn record_to_entry(record: Record) -> Result<Entry<TypeConfig>, bincode::Error> {
    let log_id = record_log_id(&record);
    let payload = match record.kind {
        KIND_BLANK => EntryPayload::Blank,
        KIND_MEMBERSHIP => EntryPayload::Membership(bincode::deserialize(&record.value)?),
        _ => EntryPayload::Normal(record.value),
    };
    Ok(Entry { log_id, payload })
}

impl RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> StorageResult<Vec<Entry<TypeConfig>>> {
        if self.raft_log.is_empty_log() {
            return Ok(Vec::new());
        }
        let lowest = self.raft_log.lowest_offset();
        let highest = self.raft_log.highest_offset();
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => lowest,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => n + 1,
            Bound::Excluded(&n) => n,
            Bound::Unbounded => highest + 1,
        };
        let mut entries = Vec::new();
        for index in start.max(lowest)..end.min(highest + 1) {
            let record = self
                .raft_log
                .read(index)
                .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Read, e))?;
            let entry = record_to_entry(record)
                .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Read, e))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> StorageResult<()> {
        self.stable
            .lock()
            .unwrap()
            .set(KEY_VOTE, vote)
            .map_err(|e| storage_err(ErrorSubject::Vote, ErrorVerb::Write, e))
    }

    async fn read_vote(&mut self) -> StorageResult<Option<Vote<NodeId>>> {
        Ok(self.stable.lock().unwrap().get(KEY_VOTE))
    }

    async fn get_log_state(&mut self) -> StorageResult<LogState<TypeConfig>> {
        let last_purged = self.stable.lock().unwrap().get(KEY_LAST_PURGED);
        let last_log_id = if self.raft_log.is_empty_log() {
            last_purged
        } else {
            let record = self
                .raft_log
                .read(self.raft_log.highest_offset())
                .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Read, e))?;
            Some(record_log_id(&record))
        };
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        for entry in entries {
            let index = entry.log_id.index;
            // First entry decides where the raft log starts; the consensus
            // library owns index assignment.
            if self.raft_log.is_empty_log() && self.raft_log.next_offset() != index {
                self.raft_log
                    .reset_to(index)
                    .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
            }
            let record = entry_to_record(&entry)
                .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
            let assigned = self
                .raft_log
                .append(record)
                .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
            if assigned != index {
                return Err(storage_err(
                    ErrorSubject::Logs,
                    ErrorVerb::Write,
                    format!("raft log assigned offset {assigned} to entry index {index}"),
                ));
            }
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(&mut self, log_id: LogId<NodeId>) -> StorageResult<()> {
        self.truncate_raft_log_from(log_id.index)
            .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Delete, e))
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> StorageResult<()> {
        self.stable
            .lock()
            .unwrap()
            .set(KEY_LAST_PURGED, &log_id)
            .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        self.raft_log
            .truncate(log_id.index)
            .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Delete, e))
    }

    async fn last_applied_state(
        &mut self,
    ) -> StorageResult<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>)> {
        let stable = self.stable.lock().unwrap();
        Ok((
            stable.get(KEY_LAST_APPLIED),
            stable.get(KEY_MEMBERSHIP).unwrap_or_default(),
        ))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> StorageResult<Vec<ApplyResponse>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            let response = match &entry.payload {
                EntryPayload::Blank => ApplyResponse::Noop,
                EntryPayload::Membership(m) => {
                    let stored = StoredMembership::new(Some(entry.log_id), m.clone());
                    self.stable
                        .lock()
                        .unwrap()
                        .set(KEY_MEMBERSHIP, &stored)
                        .map_err(|e| {
                            storage_err(ErrorSubject::StateMachine, ErrorVerb::Write, e)
                        })?;
                    ApplyResponse::Noop
                }
                EntryPayload::Normal(data) => match self.apply_append(data, &entry.log_id) {
                    Ok(offset) => ApplyResponse::Appended { offset },
                    Err(e) => ApplyResponse::Error(e.to_string()),
                },
            };
            self.stable
                .lock()
                .unwrap()
                .set(KEY_LAST_APPLIED, &entry.log_id)
                .map_err(|e| storage_err(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;
            responses.push(response);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> StorageResult<Box<Cursor<Vec<u8>>>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> StorageResult<()> {
        let data = snapshot.into_inner();
        self.restore_from_bytes(&data)
            .map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        {
            let mut stable = self.stable.lock().unwrap();
            if let Some(last) = meta.last_log_id {
                stable
                    .set(KEY_LAST_APPLIED, &last)
                    .map_err(|e| storage_err(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;
            }
            stable
                .set(KEY_MEMBERSHIP, &meta.last_membership)
                .map_err(|e| storage_err(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;
        }
        self.persist_snapshot(meta, &data)?;
        info!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> StorageResult<Option<Snapshot<TypeConfig>>> {
        match self.load_snapshot()? {
            Some((meta, data)) => Ok(Some(Snapshot {
                meta,
                snapshot: Box::new(Cursor::new(data)),
            })),
            None => Ok(None),
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> StorageResult<Snapshot<TypeConfig>> {
        let mut data = Vec::new();
        self.fsm_log
            .reader()
            .read_to_end(&mut data)
            .map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;

        let (last_applied, membership) = {
            let stable = self.stable.lock().unwrap();
            (
                stable.get::<LogId<NodeId>>(KEY_LAST_APPLIED),
                stable
                    .get::<StoredMembership<NodeId, BasicNode>>(KEY_MEMBERSHIP)
                    .unwrap_or_default(),
            )
        };
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!(
                "snapshot-{}",
                last_applied.map(|l| l.index).unwrap_or_default()
            ),
        };
        self.persist_snapshot(&meta, &data)?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ProduceRequest;
    use crate::cluster::raft::types::encode_append_request;

    fn make_log_id(term: u64, index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn make_entry(term: u64, index: u64, payload: EntryPayload<TypeConfig>) -> Entry<TypeConfig> {
        Entry {
            log_id: make_log_id(term, index),
            payload,
        }
    }

    fn append_entry(term: u64, index: u64, value: &[u8]) -> Entry<TypeConfig> {
        let framed = encode_append_request(&ProduceRequest {
            record: Record::new(value.to_vec()),
        })
        .unwrap();
        make_entry(term, index, EntryPayload::Normal(framed))
    }

    fn test_store(dir: &Path) -> RaftStore {
        let fsm_log = Arc::new(Log::open(dir.join("log"), LogConfig::default()).unwrap());
        RaftStore::open(&dir.join("raft"), fsm_log, LogConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_store_has_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());
        assert!(!store.has_existing_state());
        assert!(store.read_vote().await.unwrap().is_none());
        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn test_vote_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vote = Vote::new(3, 42);
        {
            let mut store = test_store(dir.path());
            store.save_vote(&vote).await.unwrap();
            assert!(store.has_existing_state());
        }
        let fsm_log =
            Arc::new(Log::open(dir.path().join("log2"), LogConfig::default()).unwrap());
        let mut store =
            RaftStore::open(&dir.path().join("raft"), fsm_log, LogConfig::default()).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn test_append_and_read_log_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());

        let entries = vec![
            make_entry(1, 1, EntryPayload::Blank),
            append_entry(1, 2, b"first"),
            append_entry(1, 3, b"second"),
        ];
        store.append_to_log(entries).await.unwrap();

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 3);

        let got = store.try_get_log_entries(2..=3).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].log_id.index, 2);
        assert_eq!(got[1].log_id.index, 3);
        assert!(matches!(got[0].payload, EntryPayload::Normal(_)));
    }

    #[tokio::test]
    async fn test_append_aligns_to_first_entry_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());
        // Some consensus libraries hand out a first index other than 1;
        // the log realigns rather than faulting.
        store
            .append_to_log(vec![make_entry(1, 5, EntryPayload::Blank)])
            .await
            .unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 5);
    }

    #[tokio::test]
    async fn test_delete_conflicts_rewinds_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());
        store
            .append_to_log((1..=4).map(|i| make_entry(1, i, EntryPayload::Blank)))
            .await
            .unwrap();

        store
            .delete_conflict_logs_since(make_log_id(1, 3))
            .await
            .unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 2);

        // The rewound suffix can be replaced with entries from a new term.
        store
            .append_to_log(vec![make_entry(2, 3, EntryPayload::Blank)])
            .await
            .unwrap();
        let got = store.try_get_log_entries(3..4).await.unwrap();
        assert_eq!(got[0].log_id.leader_id.term, 2);
    }

    #[tokio::test]
    async fn test_purge_trims_whole_segments_and_remembers() {
        let dir = tempfile::tempdir().unwrap();
        let fsm_log = Arc::new(Log::open(dir.path().join("log"), LogConfig::default()).unwrap());
        // Three entries per raft-log segment.
        let segment = LogConfig {
            max_index_bytes: 3 * crate::storage::ENTRY_WIDTH,
            ..Default::default()
        };
        let mut store = RaftStore::open(&dir.path().join("raft"), fsm_log, segment).unwrap();
        store
            .append_to_log((1..=9).map(|i| make_entry(1, i, EntryPayload::Blank)))
            .await
            .unwrap();

        store.purge_logs_upto(make_log_id(1, 4)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 4);
        assert_eq!(state.last_log_id.unwrap().index, 9);
        // Entries below the first surviving segment are gone.
        assert!(store.try_get_log_entries(1..2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_appends_into_the_data_log() {
        let dir = tempfile::tempdir().unwrap();
        let fsm_log = Arc::new(Log::open(dir.path().join("log"), LogConfig::default()).unwrap());
        let mut store = RaftStore::open(
            &dir.path().join("raft"),
            Arc::clone(&fsm_log),
            LogConfig::default(),
        )
        .unwrap();

        let entries = vec![append_entry(2, 1, b"alpha"), append_entry(2, 2, b"beta")];
        let responses = store.apply_to_state_machine(&entries).await.unwrap();

        match (&responses[0], &responses[1]) {
            (ApplyResponse::Appended { offset: a }, ApplyResponse::Appended { offset: b }) => {
                assert_eq!((*a, *b), (0, 1));
            }
            other => panic!("unexpected responses: {other:?}"),
        }
        let first = fsm_log.read(0).unwrap();
        assert_eq!(first.value, b"alpha");
        assert_eq!(first.term, 2);

        let (last_applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_snapshot_build_and_install_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fsm_log = Arc::new(Log::open(dir.path().join("log"), LogConfig::default()).unwrap());
        let mut store = RaftStore::open(
            &dir.path().join("raft"),
            Arc::clone(&fsm_log),
            LogConfig::default(),
        )
        .unwrap();

        let entries: Vec<_> = (1..=3)
            .map(|i| append_entry(1, i, format!("record-{i}").as_bytes()))
            .collect();
        store.apply_to_state_machine(&entries).await.unwrap();

        let snapshot = store.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.unwrap().index, 3);

        // Install into a second node's empty store.
        let other_log =
            Arc::new(Log::open(dir.path().join("log2"), LogConfig::default()).unwrap());
        let mut other = RaftStore::open(
            &dir.path().join("raft2"),
            Arc::clone(&other_log),
            LogConfig::default(),
        )
        .unwrap();
        other
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        for i in 0..3u64 {
            assert_eq!(
                other_log.read(i).unwrap().value,
                format!("record-{}", i + 1).as_bytes()
            );
        }
        let reloaded = other.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(reloaded.meta.last_log_id.unwrap().index, 3);
    }

    #[tokio::test]
    async fn test_snapshot_restore_preserves_offsets_after_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let fsm_log = Arc::new(
            Log::open(
                dir.path().join("log"),
                LogConfig {
                    max_index_bytes: 3 * crate::storage::ENTRY_WIDTH,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let mut store = RaftStore::open(
            &dir.path().join("raft"),
            Arc::clone(&fsm_log),
            LogConfig::default(),
        )
        .unwrap();

        for _ in 0..6 {
            fsm_log.append(Record::new(b"r".to_vec())).unwrap();
        }
        fsm_log.truncate(2).unwrap();
        assert_eq!(fsm_log.lowest_offset(), 3);

        let snapshot = store.build_snapshot().await.unwrap();

        let other_log =
            Arc::new(Log::open(dir.path().join("log2"), LogConfig::default()).unwrap());
        let mut other = RaftStore::open(
            &dir.path().join("raft2"),
            Arc::clone(&other_log),
            LogConfig::default(),
        )
        .unwrap();
        other
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        // The restored log starts where the snapshot's first record did.
        assert_eq!(other_log.lowest_offset(), 3);
        assert_eq!(other_log.highest_offset(), 5);
        assert!(other_log.read(2).is_err());
        assert_eq!(other_log.read(4).unwrap().offset, 4);
    }
}
