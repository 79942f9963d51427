//! Two-store engine: the regular store holds committed records, the intents
//! store holds provisional records of open transactions.
//!
//! Each store is its own fjall keyspace with a `data` partition and a `meta`
//! partition. The meta partition keeps two frontiers:
//! - the applied frontier, written atomically with every stamped batch and
//!   used to skip log entries that were already applied
//! - the flushed frontier, written when the store is flushed

use crate::compaction_filter::{CompactionFilter, FilterDecision};
use crate::config::StorageConfig;
use crate::encoding::{Decode, Encode};
use crate::error::{Error, Result};
use crate::frontier::ConsensusFrontier;
use crate::store_iterator::StoreIterator;
use crate::write_batch::{WriteBatch, WriteOp};
use docstore_hlc::HybridTime;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};

const APPLIED_FRONTIER_KEY: &[u8] = b"applied_frontier";
const FLUSHED_FRONTIER_KEY: &[u8] = b"flushed_frontier";

/// Which of the two stores an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreType {
    Regular,
    Intents,
}

impl StoreType {
    fn dir_name(self) -> &'static str {
        match self {
            StoreType::Regular => "regular",
            StoreType::Intents => "intents",
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    Regular,
    Intents,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed,
    /// The intents store holds entries newer than the last regular flush
    /// while the regular store still has unflushed data.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontierModificationMode {
    /// The new frontier must not be below the current one.
    Update,
    /// Override unconditionally. Only for restoring into a fresh store.
    Force,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub kept: usize,
    pub discarded: usize,
    pub rewritten: usize,
}

#[derive(Debug, Default)]
struct FrontierState {
    applied: Option<ConsensusFrontier>,
    flushed: Option<ConsensusFrontier>,
    has_unflushed_data: bool,
}

/// One fjall keyspace.
struct Store {
    store_type: StoreType,
    keyspace: Keyspace,
    data: PartitionHandle,
    meta: PartitionHandle,
    persist_mode: fjall::PersistMode,
    state: Mutex<FrontierState>,
}

fn open_keyspace(
    path: &Path,
    config: &StorageConfig,
) -> Result<(Keyspace, PartitionHandle, PartitionHandle)> {
    std::fs::create_dir_all(path)?;

    let keyspace = fjall::Config::new(path)
        .cache_size(config.block_cache_size)
        .open()?;

    let meta = keyspace.open_partition(
        "meta",
        PartitionCreateOptions::default()
            .block_size(16 * 1024)
            .compression(fjall::CompressionType::None),
    )?;

    let data = keyspace.open_partition(
        "data",
        PartitionCreateOptions::default()
            .block_size(64 * 1024)
            .compression(config.compression),
    )?;

    Ok((keyspace, data, meta))
}

fn read_frontier(meta: &PartitionHandle, key: &[u8]) -> Result<Option<ConsensusFrontier>> {
    meta.get(key)?
        .map(|bytes| ConsensusFrontier::decode(&bytes))
        .transpose()
}

impl Store {
    fn open(store_type: StoreType, path: &Path, config: &StorageConfig) -> Result<Self> {
        let (keyspace, data, meta) = open_keyspace(path, config)?;

        let applied = read_frontier(&meta, APPLIED_FRONTIER_KEY)?;
        let flushed = read_frontier(&meta, FLUSHED_FRONTIER_KEY)?;
        // Ops applied after the last flush are still unflushed after a restart.
        let has_unflushed_data = match (applied, flushed) {
            (Some(applied), Some(flushed)) => applied.op_id > flushed.op_id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let state = FrontierState {
            applied,
            flushed,
            has_unflushed_data,
        };
        tracing::info!(
            "Opened {} store at {:?}, flushed frontier: {:?}",
            store_type,
            path,
            state.flushed
        );

        Ok(Self {
            store_type,
            keyspace,
            data,
            meta,
            persist_mode: config.persist_mode,
            state: Mutex::new(state),
        })
    }

    /// Apply a batch. Returns false if its frontier shows it was already
    /// applied. An engine failure here is fatal.
    fn write(&self, batch: &WriteBatch) -> bool {
        let mut state = self.state.lock();

        let mut applied = state.applied;
        if let Some(frontier) = batch.frontier() {
            if let Some(current) = &applied
                && !frontier.op_id.is_empty()
                && frontier.op_id <= current.op_id
            {
                tracing::debug!(
                    "Skipping batch for op {} in {} store, already applied up to {}",
                    frontier.op_id,
                    self.store_type,
                    current.op_id
                );
                return false;
            }
            let mut merged = applied.unwrap_or(*frontier);
            merged.update_max(frontier);
            applied = Some(merged);
        }

        let mut fjall_batch = self.keyspace.batch();
        for op in batch.ops() {
            match op {
                WriteOp::Put { key, value } => {
                    fjall_batch.insert(&self.data, key.as_slice(), value.as_slice())
                }
                WriteOp::Delete { key } => fjall_batch.remove(&self.data, key.as_slice()),
            }
        }
        if batch.frontier().is_some()
            && let Some(frontier) = &applied
        {
            match frontier.encode() {
                Ok(bytes) => fjall_batch.insert(&self.meta, APPLIED_FRONTIER_KEY, bytes),
                Err(e) => panic!("Failed to encode frontier {}: {}", frontier, e),
            }
        }

        if let Err(e) = fjall_batch.commit() {
            tracing::error!("Write to {} store failed: {}", self.store_type, e);
            panic!("Write to {} store failed: {}", self.store_type, e);
        }

        state.applied = applied;
        state.has_unflushed_data = true;
        true
    }

    fn flush(&self) -> Result<()> {
        self.keyspace.persist(self.persist_mode)?;

        let mut state = self.state.lock();
        if let Some(applied) = state.applied {
            self.meta.insert(FLUSHED_FRONTIER_KEY, applied.encode()?)?;
            self.keyspace.persist(self.persist_mode)?;
            state.flushed = Some(applied);
        }
        state.has_unflushed_data = false;
        tracing::debug!(
            "Flushed {} store, frontier: {:?}",
            self.store_type,
            state.flushed
        );
        Ok(())
    }

    fn modify_flushed_frontier(
        &self,
        frontier: ConsensusFrontier,
        mode: FrontierModificationMode,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let applied = match mode {
            FrontierModificationMode::Update => {
                if let Some(current) = &state.flushed
                    && !current.is_covered_by(&frontier)
                {
                    return Err(Error::illegal_state(format!(
                        "Flushed frontier of {} store would regress from {} to {}",
                        self.store_type, current, frontier
                    )));
                }
                let mut applied = state.applied.unwrap_or(frontier);
                applied.update_max(&frontier);
                applied
            }
            FrontierModificationMode::Force => frontier,
        };

        let encoded = frontier.encode()?;
        let mut batch = self.keyspace.batch();
        batch.insert(&self.meta, FLUSHED_FRONTIER_KEY, encoded.clone());
        batch.insert(&self.meta, APPLIED_FRONTIER_KEY, applied.encode()?);
        batch.commit()?;
        self.keyspace.persist(self.persist_mode)?;

        if mode == FrontierModificationMode::Force && cfg!(debug_assertions) {
            let stored = self.meta.get(FLUSHED_FRONTIER_KEY)?;
            if stored.as_deref() != Some(encoded.as_slice()) {
                return Err(Error::illegal_state(format!(
                    "Forced frontier {} of {} store did not read back",
                    frontier, self.store_type
                )));
            }
        }

        tracing::info!(
            "Modified flushed frontier of {} store ({:?}): {}",
            self.store_type,
            mode,
            frontier
        );
        state.flushed = Some(frontier);
        state.applied = Some(applied);
        Ok(())
    }

    fn record_history_cutoff(&self, cutoff: HybridTime) -> Result<()> {
        let mut state = self.state.lock();
        let mut applied = state.applied.unwrap_or_default();
        if applied.history_cutoff >= cutoff {
            return Ok(());
        }
        applied.history_cutoff = cutoff;
        self.meta.insert(APPLIED_FRONTIER_KEY, applied.encode()?)?;
        state.applied = Some(applied);
        Ok(())
    }

    fn iter(&self) -> StoreIterator {
        StoreIterator::new(self.data.snapshot())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key)?.map(|v| v.to_vec()))
    }

    fn compact(&self, filter: &mut dyn CompactionFilter) -> Result<CompactionStats> {
        let mut stats = CompactionStats::default();
        let mut batch = self.keyspace.batch();

        for entry in self.data.snapshot().iter() {
            let (key, value) = entry.map_err(fjall::Error::from)?;
            match filter.filter(&key, &value)? {
                FilterDecision::Keep => stats.kept += 1,
                FilterDecision::Discard => {
                    stats.discarded += 1;
                    batch.remove(&self.data, key);
                }
                FilterDecision::ChangeValue(new_value) => {
                    stats.rewritten += 1;
                    batch.insert(&self.data, key, new_value);
                }
            }
        }

        batch.commit()?;
        if let Some(cutoff) = filter.history_cutoff() {
            self.record_history_cutoff(cutoff)?;
        }
        self.keyspace.persist(self.persist_mode)?;
        Ok(stats)
    }

    /// Copy the data partition and flushed frontier into a new keyspace.
    fn export(&self, path: &Path, config: &StorageConfig) -> Result<()> {
        let (keyspace, data, meta) = open_keyspace(path, config)?;

        let mut batch = keyspace.batch();
        for entry in self.data.snapshot().iter() {
            let (key, value) = entry.map_err(fjall::Error::from)?;
            batch.insert(&data, key, value);
        }
        if let Some(frontier) = self.state.lock().flushed {
            batch.insert(&meta, FLUSHED_FRONTIER_KEY, frontier.encode()?);
        }
        batch.commit()?;
        keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Replace all data with the content of an exported keyspace and force
    /// the flushed frontier to the exported one.
    fn import(&self, path: &Path, config: &StorageConfig) -> Result<()> {
        let (_keyspace, data, meta) = open_keyspace(path, config)?;

        let mut batch = self.keyspace.batch();
        for entry in self.data.snapshot().iter() {
            let (key, _) = entry.map_err(fjall::Error::from)?;
            batch.remove(&self.data, key);
        }
        batch.commit()?;

        let mut batch = self.keyspace.batch();
        for entry in data.snapshot().iter() {
            let (key, value) = entry.map_err(fjall::Error::from)?;
            batch.insert(&self.data, key, value);
        }
        batch.commit()?;

        let frontier = read_frontier(&meta, FLUSHED_FRONTIER_KEY)?.unwrap_or_default();
        self.modify_flushed_frontier(frontier, FrontierModificationMode::Force)
    }
}

/// Owner of the regular and intents stores of one tablet.
pub struct DocDb {
    config: StorageConfig,
    regular: Store,
    intents: Store,
}

impl DocDb {
    /// Open both stores, under `data_dir` and `data_dir.intents`.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let regular = Store::open(StoreType::Regular, &config.regular_dir(), &config)?;
        let intents = Store::open(StoreType::Intents, &config.intents_dir(), &config)?;
        Ok(Self {
            config,
            regular,
            intents,
        })
    }

    fn store(&self, store_type: StoreType) -> &Store {
        match store_type {
            StoreType::Regular => &self.regular,
            StoreType::Intents => &self.intents,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Atomically apply `batch` to one store. Returns false when the batch's
    /// op id was already applied.
    pub fn write(&self, batch: &WriteBatch, target: StoreType) -> bool {
        self.store(target).write(batch)
    }

    pub fn get(&self, target: StoreType, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store(target).get(key)
    }

    pub fn new_iterator(&self, target: StoreType) -> StoreIterator {
        self.store(target).iter()
    }

    pub fn flushed_frontier(&self, target: StoreType) -> Option<ConsensusFrontier> {
        self.store(target).state.lock().flushed
    }

    pub fn applied_frontier(&self, target: StoreType) -> Option<ConsensusFrontier> {
        self.store(target).state.lock().applied
    }

    /// Whether the intents store may be flushed now.
    pub fn intents_flush_allowed(&self) -> bool {
        let regular = self.regular.state.lock();
        if !regular.has_unflushed_data {
            return true;
        }
        let intents_op = self.intents.state.lock().applied.map(|f| f.op_id);
        let regular_flushed_op = regular.flushed.map(|f| f.op_id);
        match (intents_op, regular_flushed_op) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(intents), Some(regular)) => intents <= regular,
        }
    }

    pub fn flush(&self, target: FlushTarget) -> Result<FlushOutcome> {
        match target {
            FlushTarget::Regular => {
                self.regular.flush()?;
                Ok(FlushOutcome::Flushed)
            }
            FlushTarget::Intents => {
                if !self.intents_flush_allowed() {
                    tracing::debug!("Deferring intents flush until regular store is flushed");
                    return Ok(FlushOutcome::Deferred);
                }
                self.intents.flush()?;
                Ok(FlushOutcome::Flushed)
            }
            FlushTarget::Both => {
                self.regular.flush()?;
                self.intents.flush()?;
                Ok(FlushOutcome::Flushed)
            }
        }
    }

    pub fn modify_flushed_frontier(
        &self,
        target: StoreType,
        frontier: ConsensusFrontier,
        mode: FrontierModificationMode,
    ) -> Result<()> {
        self.store(target).modify_flushed_frontier(frontier, mode)
    }

    /// Run `filter` over every record of a store in key order and apply its
    /// decisions as one batch.
    pub fn compact(
        &self,
        target: StoreType,
        filter: &mut dyn CompactionFilter,
    ) -> Result<CompactionStats> {
        let stats = self.store(target).compact(filter)?;
        tracing::info!(
            "Compacted {} store: kept {}, discarded {}, rewritten {}",
            target,
            stats.kept,
            stats.discarded,
            stats.rewritten
        );
        Ok(stats)
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> Result<PathBuf> {
        if snapshot_id.is_empty()
            || snapshot_id.contains(['/', '\\'])
            || snapshot_id.starts_with('.')
            || snapshot_id.ends_with(".tmp")
        {
            return Err(Error::InvalidArgument(format!(
                "Invalid snapshot id: {:?}",
                snapshot_id
            )));
        }
        Ok(self.config.snapshots_dir().join(snapshot_id))
    }

    /// Flush both stores and copy them to `<dir>.snapshots/<id>`, going
    /// through a `.tmp` directory so that a crash never leaves a partial
    /// snapshot under the final name.
    pub fn create_snapshot(&self, snapshot_id: &str) -> Result<PathBuf> {
        let final_dir = self.snapshot_dir(snapshot_id)?;
        if final_dir.exists() {
            return Err(Error::InvalidArgument(format!(
                "Snapshot {} already exists",
                snapshot_id
            )));
        }
        let tmp_dir = self
            .config
            .snapshots_dir()
            .join(format!("{}.tmp", snapshot_id));
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }

        self.flush(FlushTarget::Both)?;
        for store in [&self.regular, &self.intents] {
            store.export(&tmp_dir.join(store.store_type.dir_name()), &self.config)?;
        }
        std::fs::rename(&tmp_dir, &final_dir)?;

        tracing::info!("Created snapshot {} at {:?}", snapshot_id, final_dir);
        Ok(final_dir)
    }

    pub fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let dir = self.snapshot_dir(snapshot_id)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("Snapshot {}", snapshot_id)));
        }
        for store in [&self.regular, &self.intents] {
            store.import(&dir.join(store.store_type.dir_name()), &self.config)?;
        }
        tracing::info!("Restored snapshot {}", snapshot_id);
        Ok(())
    }

    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let dir = self.snapshot_dir(snapshot_id)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("Snapshot {}", snapshot_id)));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!("Deleted snapshot {}", snapshot_id);
        Ok(())
    }

    /// Ids of complete snapshots.
    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        let dir = self.config.snapshots_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".tmp") {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl Drop for DocDb {
    fn drop(&mut self) {
        // Ensure data is persisted on drop
        let _ = self.regular.keyspace.persist(fjall::PersistMode::SyncAll);
        let _ = self.intents.keyspace.persist(fjall::PersistMode::SyncAll);
    }
}
