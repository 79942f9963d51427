//! Status tablet: the authority on transaction outcomes.
//!
//! Keeps one record per transaction, assigns commit times, expires
//! transactions whose client stopped heartbeating and tells the data
//! tablets a transaction wrote to when to apply or drop its intents. Data
//! tablets registered here resolve foreign intents through it.

use crate::error::{ClientError, Result};
use crate::rpc::{AbortTransactionRequest, TransactionStatusResponse, UpdateTransactionRequest};
use docstore_common::{TransactionId, TransactionStatus};
use docstore_docdb::{Tablet, TransactionStatusResolver, TransactionStatusResult};
use docstore_hlc::{HybridTime, SharedHlcClock};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct StatusRecord {
    status: TransactionStatus,
    last_heartbeat: Instant,
    commit_ht: HybridTime,
    involved: BTreeSet<String>,
}

impl StatusRecord {
    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.status == TransactionStatus::Pending
            && now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

pub struct StatusTablet {
    tablet_id: String,
    clock: SharedHlcClock,
    expiry_timeout: Duration,
    records: Mutex<HashMap<TransactionId, StatusRecord>>,
    participants: RwLock<HashMap<String, Arc<Tablet>>>,
}

impl StatusTablet {
    pub fn new(tablet_id: impl Into<String>, clock: SharedHlcClock, expiry_timeout: Duration) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            clock,
            expiry_timeout,
            records: Mutex::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
        }
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// Make `tablet` a participant: its foreign intents resolve here and
    /// commits and aborts of transactions that wrote to it reach it.
    pub fn register_tablet(self: &Arc<Self>, tablet_id: impl Into<String>, tablet: Arc<Tablet>) {
        tablet.participant().set_resolver(self.clone());
        self.participants.write().insert(tablet_id.into(), tablet);
    }

    /// Current status of a known transaction, with expiry applied.
    pub fn status_of(&self, transaction_id: TransactionId) -> Option<TransactionStatus> {
        let records = self.records.lock();
        let record = records.get(&transaction_id)?;
        if record.is_expired(Instant::now(), self.expiry_timeout) {
            return Some(TransactionStatus::Aborted);
        }
        Some(record.status)
    }

    pub fn update(&self, request: UpdateTransactionRequest) -> Result<TransactionStatusResponse> {
        self.clock.update(request.propagated_hybrid_time);
        match request.status {
            TransactionStatus::Created => self.create(request.transaction_id),
            TransactionStatus::Pending => Ok(self.heartbeat(request)),
            TransactionStatus::Committed => Ok(self.commit(request)),
            TransactionStatus::Aborted => self.abort(AbortTransactionRequest {
                tablet_id: request.tablet_id,
                transaction_id: request.transaction_id,
                propagated_hybrid_time: request.propagated_hybrid_time,
                involved_tablets: request.involved_tablets,
            }),
        }
    }

    fn create(&self, transaction_id: TransactionId) -> Result<TransactionStatusResponse> {
        let mut records = self.records.lock();
        if records.contains_key(&transaction_id) {
            return Err(ClientError::InvalidState(format!(
                "Transaction {} already exists",
                transaction_id
            )));
        }
        records.insert(
            transaction_id,
            StatusRecord {
                status: TransactionStatus::Pending,
                last_heartbeat: Instant::now(),
                commit_ht: HybridTime::INVALID,
                involved: BTreeSet::new(),
            },
        );
        tracing::debug!("Created transaction {}", transaction_id);
        Ok(self.response(TransactionStatus::Pending, None))
    }

    fn heartbeat(&self, request: UpdateTransactionRequest) -> TransactionStatusResponse {
        let transaction_id = request.transaction_id;
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&transaction_id) else {
            return self.response(TransactionStatus::Aborted, None);
        };
        if record.is_expired(Instant::now(), self.expiry_timeout) {
            record.status = TransactionStatus::Aborted;
            drop(records);
            tracing::warn!("Transaction {} expired before heartbeat", transaction_id);
            self.remove_intents(transaction_id, &self.all_tablets());
            return self.response(TransactionStatus::Aborted, None);
        }
        match record.status {
            TransactionStatus::Pending => {
                record.last_heartbeat = Instant::now();
                record.involved.extend(request.involved_tablets);
                self.response(TransactionStatus::Pending, None)
            }
            TransactionStatus::Committed => {
                self.response(TransactionStatus::Committed, Some(record.commit_ht))
            }
            status => self.response(status, None),
        }
    }

    fn commit(&self, request: UpdateTransactionRequest) -> TransactionStatusResponse {
        let transaction_id = request.transaction_id;
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&transaction_id) else {
            tracing::warn!("Commit of unknown transaction {}", transaction_id);
            return self.response(TransactionStatus::Aborted, None);
        };
        record.involved.extend(request.involved_tablets);
        if record.is_expired(Instant::now(), self.expiry_timeout) {
            record.status = TransactionStatus::Aborted;
            drop(records);
            tracing::warn!("Transaction {} expired before commit", transaction_id);
            self.remove_intents(transaction_id, &self.all_tablets());
            return self.response(TransactionStatus::Aborted, None);
        }
        match record.status {
            TransactionStatus::Committed => {
                return self.response(TransactionStatus::Committed, Some(record.commit_ht));
            }
            TransactionStatus::Aborted => return self.response(TransactionStatus::Aborted, None),
            TransactionStatus::Created | TransactionStatus::Pending => {}
        }

        // Assigned under the records lock, after every pending status time
        // handed out so far.
        let commit_ht = self.clock.now();
        record.status = TransactionStatus::Committed;
        record.commit_ht = commit_ht;
        let involved = record.involved.clone();
        drop(records);

        tracing::debug!(
            "Committed transaction {} at {} on {} tablets",
            transaction_id,
            commit_ht,
            involved.len()
        );
        self.apply_intents(transaction_id, commit_ht, &involved);
        self.response(TransactionStatus::Committed, Some(commit_ht))
    }

    /// Abort a transaction unless it already committed.
    pub fn abort(&self, request: AbortTransactionRequest) -> Result<TransactionStatusResponse> {
        self.clock.update(request.propagated_hybrid_time);
        let transaction_id = request.transaction_id;
        let mut records = self.records.lock();
        let involved = match records.get_mut(&transaction_id) {
            Some(record) if record.status == TransactionStatus::Committed => {
                return Ok(self.response(TransactionStatus::Committed, Some(record.commit_ht)));
            }
            Some(record) => {
                record.status = TransactionStatus::Aborted;
                record.involved.extend(request.involved_tablets);
                record.involved.clone()
            }
            None => request.involved_tablets.into_iter().collect(),
        };
        drop(records);

        tracing::debug!("Aborted transaction {}", transaction_id);
        self.remove_intents(transaction_id, &involved);
        Ok(self.response(TransactionStatus::Aborted, None))
    }

    /// Status as seen at `read_ht`. A pending answer carries a time at or
    /// above `read_ht` that the transaction cannot commit at or before.
    pub fn status_at(&self, transaction_id: TransactionId, read_ht: HybridTime) -> TransactionStatusResult {
        self.clock.update(read_ht);
        let records = self.records.lock();
        let Some(record) = records.get(&transaction_id) else {
            return TransactionStatusResult::aborted();
        };
        if record.is_expired(Instant::now(), self.expiry_timeout) {
            return TransactionStatusResult::aborted();
        }
        match record.status {
            TransactionStatus::Committed => TransactionStatusResult::committed(record.commit_ht),
            TransactionStatus::Aborted => TransactionStatusResult::aborted(),
            TransactionStatus::Created | TransactionStatus::Pending => {
                TransactionStatusResult::pending(self.clock.now())
            }
        }
    }

    pub fn status_response(
        &self,
        transaction_id: TransactionId,
        propagated_hybrid_time: HybridTime,
    ) -> TransactionStatusResponse {
        let result = self.status_at(transaction_id, propagated_hybrid_time);
        let commit_ht = (result.status == TransactionStatus::Committed).then_some(result.status_time);
        self.response(result.status, commit_ht)
    }

    /// Abort every pending transaction that missed its heartbeats and drop
    /// its intents. Returns how many were expired.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<TransactionId> = {
            let mut records = self.records.lock();
            records
                .iter_mut()
                .filter(|(_, record)| record.is_expired(now, self.expiry_timeout))
                .map(|(id, record)| {
                    record.status = TransactionStatus::Aborted;
                    *id
                })
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }
        let tablets = self.all_tablets();
        for transaction_id in &expired {
            tracing::warn!("Transaction {} expired, aborting", transaction_id);
            self.remove_intents(*transaction_id, &tablets);
        }
        expired.len()
    }

    /// Run `expire_stale` every `period` until the status tablet is dropped.
    pub fn spawn_expiry_task(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let status_tablet = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(status_tablet) = status_tablet.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || status_tablet.expire_stale()).await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!("Expired {} transactions", expired),
                    Err(e) => tracing::warn!("Expiry pass failed: {}", e),
                }
            }
        })
    }

    /// Writes of an expired transaction may not have been reported yet, so
    /// its cleanup goes to every participant.
    fn all_tablets(&self) -> BTreeSet<String> {
        self.participants.read().keys().cloned().collect()
    }

    fn participant(&self, tablet_id: &str) -> Option<Arc<Tablet>> {
        let tablet = self.participants.read().get(tablet_id).cloned();
        if tablet.is_none() {
            tracing::warn!("Transaction touched unregistered tablet {}", tablet_id);
        }
        tablet
    }

    /// Failures are only logged: readers still resolve the intents here
    /// and the intents stay until a later apply.
    fn apply_intents(&self, transaction_id: TransactionId, commit_ht: HybridTime, involved: &BTreeSet<String>) {
        for tablet_id in involved {
            let Some(tablet) = self.participant(tablet_id) else {
                continue;
            };
            tablet.participant().notify_committed(transaction_id, commit_ht);
            match tablet.apply_transaction(transaction_id, commit_ht) {
                Ok(applied) => tracing::debug!(
                    "Applied {} intents of {} on {}",
                    applied,
                    transaction_id,
                    tablet_id
                ),
                Err(e) => tracing::warn!(
                    "Failed to apply transaction {} on {}: {}",
                    transaction_id,
                    tablet_id,
                    e
                ),
            }
        }
    }

    fn remove_intents(&self, transaction_id: TransactionId, involved: &BTreeSet<String>) {
        for tablet_id in involved {
            let Some(tablet) = self.participant(tablet_id) else {
                continue;
            };
            tablet.participant().notify_aborted(transaction_id);
            if let Err(e) = tablet.remove_transaction_intents(transaction_id) {
                tracing::warn!(
                    "Failed to remove intents of {} on {}: {}",
                    transaction_id,
                    tablet_id,
                    e
                );
            }
        }
    }

    fn response(&self, status: TransactionStatus, commit_hybrid_time: Option<HybridTime>) -> TransactionStatusResponse {
        TransactionStatusResponse {
            status,
            propagated_hybrid_time: self.clock.now(),
            commit_hybrid_time,
        }
    }
}

impl TransactionStatusResolver for StatusTablet {
    fn get_status(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> docstore_docdb::Result<TransactionStatusResult> {
        Ok(self.status_at(transaction_id, read_ht))
    }
}
