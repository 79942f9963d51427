//! Client side of one distributed transaction.
//!
//! A transaction is a small state machine driven by its own calls and by a
//! background heartbeat task:
//!
//! ```text
//! Created -> AwaitingStatusTablet -> Ready -> Committing -> Committed
//!                       |              |            |
//!                       +--------------+--> Aborting / Aborted
//! ```
//!
//! While `Ready`, the heartbeat task keeps the status record alive. If the
//! status tablet reports the transaction aborted, or no heartbeat gets
//! through within the expiry timeout, the task moves it to `Aborted`.

use crate::config::TransactionConfig;
use crate::error::{ClientError, Result};
use crate::rpc::{AbortTransactionRequest, TransactionRpc, UpdateTransactionRequest};
use docstore_common::{IsolationLevel, TransactionId, TransactionMetadata, TransactionStatus};
use docstore_docdb::{DocOperation, ReadOptions, SubDocKey, SubDocument, Tablet, WriteRequest, WriteResponse};
use docstore_hlc::{HybridTime, SharedHlcClock};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    AwaitingStatusTablet,
    Ready,
    Committing,
    Aborting,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// An open transaction. Dropping it stops the heartbeats; the status
/// tablet then expires it unless it was committed or aborted.
pub struct Transaction {
    metadata: TransactionMetadata,
    state: Arc<Mutex<TransactionState>>,
    /// Data tablets written to, reported with every heartbeat and at commit.
    involved: Arc<Mutex<BTreeSet<String>>>,
    rpc: Arc<dyn TransactionRpc>,
    clock: SharedHlcClock,
    config: TransactionConfig,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Transaction {
    /// Register a new transaction with its status tablet and start
    /// heartbeating it.
    pub async fn begin(
        rpc: Arc<dyn TransactionRpc>,
        clock: SharedHlcClock,
        config: TransactionConfig,
    ) -> Result<Self> {
        if !config.isolation.is_transactional() {
            return Err(ClientError::InvalidState(format!(
                "Cannot begin a transaction with isolation {:?}",
                config.isolation
            )));
        }

        let transaction_id = TransactionId::new();
        let priority = config
            .priority
            .unwrap_or_else(|| priority_from_id(transaction_id));
        let metadata = TransactionMetadata::new(
            transaction_id,
            config.isolation,
            config.status_tablet.clone(),
            priority,
            clock.now(),
        );
        let transaction = Self {
            metadata,
            state: Arc::new(Mutex::new(TransactionState::Created)),
            involved: Arc::new(Mutex::new(BTreeSet::new())),
            rpc,
            clock,
            config,
            heartbeat: Mutex::new(None),
        };

        transaction.transition(TransactionState::Created, TransactionState::AwaitingStatusTablet)?;
        let response = transaction
            .rpc
            .update_transaction(transaction.update_request(TransactionStatus::Created))
            .await;
        match response {
            Ok(response) if response.status == TransactionStatus::Pending => {
                transaction.clock.update(response.propagated_hybrid_time);
            }
            Ok(response) => {
                transaction.set_state(TransactionState::Aborted);
                tracing::warn!(
                    "Status tablet answered {:?} when creating {}",
                    response.status,
                    transaction_id
                );
                return Err(ClientError::Aborted(transaction_id));
            }
            Err(e) => {
                transaction.set_state(TransactionState::Aborted);
                return Err(e);
            }
        }

        transaction.transition(TransactionState::AwaitingStatusTablet, TransactionState::Ready)?;
        transaction.start_heartbeat();
        tracing::debug!("Transaction {} ready", transaction_id);
        Ok(transaction)
    }

    pub fn id(&self) -> TransactionId {
        self.metadata.transaction_id
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.metadata
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn involved_tablets(&self) -> Vec<String> {
        self.involved.lock().iter().cloned().collect()
    }

    /// Write `operations` as intents of this transaction on `tablet`.
    pub async fn write(
        &self,
        tablet_id: &str,
        tablet: Arc<Tablet>,
        operations: Vec<DocOperation>,
    ) -> Result<WriteResponse> {
        self.submit(tablet_id, tablet, WriteRequest::new(operations, self.deadline()))
            .await
    }

    /// Like `write`, also locking `read_paths` against concurrent writers.
    /// Serializable transactions only.
    pub async fn write_with_read_paths(
        &self,
        tablet_id: &str,
        tablet: Arc<Tablet>,
        operations: Vec<DocOperation>,
        read_paths: Vec<SubDocKey>,
    ) -> Result<WriteResponse> {
        let request = WriteRequest::new(operations, self.deadline()).with_read_paths(read_paths);
        self.submit(tablet_id, tablet, request).await
    }

    async fn submit(&self, tablet_id: &str, tablet: Arc<Tablet>, request: WriteRequest) -> Result<WriteResponse> {
        self.ensure_ready("write")?;
        self.involved.lock().insert(tablet_id.to_string());

        let mut request = request.in_transaction(self.metadata.clone());
        if self.metadata.isolation == IsolationLevel::Snapshot {
            request = request.with_read_time(self.metadata.start_time);
        }
        let response = tokio::task::spawn_blocking(move || tablet.write(request)).await??;
        self.clock.update(response.hybrid_time);
        Ok(response)
    }

    /// Read `key` on `tablet`, including this transaction's own writes.
    /// Snapshot transactions read as of their start time.
    pub async fn read(&self, tablet: Arc<Tablet>, key: SubDocKey) -> Result<Option<SubDocument>> {
        self.ensure_ready("read")?;
        let mut options = ReadOptions::new(self.deadline()).in_transaction(self.id());
        if self.metadata.isolation == IsolationLevel::Snapshot {
            options = options.at(self.metadata.start_time);
        }
        let response = tokio::task::spawn_blocking(move || tablet.read(&key, options)).await??;
        self.clock.update(response.read_time);
        Ok(response.document)
    }

    /// Commit and return the commit time. Intents on every involved tablet
    /// are applied at that time before this returns.
    pub async fn commit(&self) -> Result<HybridTime> {
        self.transition(TransactionState::Ready, TransactionState::Committing)?;
        self.stop_heartbeat();

        let response = self
            .rpc
            .update_transaction(self.update_request(TransactionStatus::Committed))
            .await;
        match response {
            Ok(response) => {
                self.clock.update(response.propagated_hybrid_time);
                match (response.status, response.commit_hybrid_time) {
                    (TransactionStatus::Committed, Some(commit_ht)) => {
                        self.set_state(TransactionState::Committed);
                        tracing::debug!("Transaction {} committed at {}", self.id(), commit_ht);
                        Ok(commit_ht)
                    }
                    (status, _) => {
                        self.set_state(TransactionState::Aborted);
                        tracing::info!("Commit of {} answered {:?}", self.id(), status);
                        Err(ClientError::Aborted(self.id()))
                    }
                }
            }
            Err(e) => {
                // Outcome unknown: settle it by aborting, which reports a
                // commit that already happened.
                tracing::warn!("Commit of {} failed: {}", self.id(), e);
                self.set_state(TransactionState::Aborting);
                match self.send_abort().await {
                    Ok(Some(commit_ht)) => {
                        self.set_state(TransactionState::Committed);
                        Ok(commit_ht)
                    }
                    Ok(None) => {
                        self.set_state(TransactionState::Aborted);
                        Err(e)
                    }
                    Err(abort_error) => {
                        tracing::warn!("Abort of {} failed: {}", self.id(), abort_error);
                        self.set_state(TransactionState::Aborted);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Abort and drop all intents. Aborting an aborted transaction is a
    /// no-op.
    pub async fn abort(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                TransactionState::Aborted => return Ok(()),
                TransactionState::Committed | TransactionState::Committing => {
                    return Err(ClientError::InvalidState(format!(
                        "Cannot abort transaction in state {:?}",
                        *state
                    )));
                }
                _ => *state = TransactionState::Aborting,
            }
        }
        self.stop_heartbeat();

        match self.send_abort().await {
            Ok(Some(_)) => {
                self.set_state(TransactionState::Committed);
                Err(ClientError::InvalidState(format!(
                    "Transaction {} already committed",
                    self.id()
                )))
            }
            Ok(None) => {
                self.set_state(TransactionState::Aborted);
                tracing::debug!("Transaction {} aborted", self.id());
                Ok(())
            }
            Err(e) => {
                // The status tablet expires it anyway.
                self.set_state(TransactionState::Aborted);
                Err(e)
            }
        }
    }

    /// Returns the commit time if the status tablet reports a commit.
    async fn send_abort(&self) -> Result<Option<HybridTime>> {
        let response = self
            .rpc
            .abort_transaction(AbortTransactionRequest {
                tablet_id: self.metadata.status_tablet.clone(),
                transaction_id: self.id(),
                propagated_hybrid_time: self.clock.now(),
                involved_tablets: self.involved_tablets(),
            })
            .await?;
        self.clock.update(response.propagated_hybrid_time);
        Ok(match response.status {
            TransactionStatus::Committed => response.commit_hybrid_time,
            _ => None,
        })
    }

    fn update_request(&self, status: TransactionStatus) -> UpdateTransactionRequest {
        UpdateTransactionRequest {
            tablet_id: self.metadata.status_tablet.clone(),
            transaction_id: self.id(),
            status,
            propagated_hybrid_time: self.clock.now(),
            involved_tablets: self.involved_tablets(),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.operation_timeout
    }

    fn ensure_ready(&self, operation: &str) -> Result<()> {
        match *self.state.lock() {
            TransactionState::Ready => Ok(()),
            TransactionState::Aborted => Err(ClientError::Aborted(self.id())),
            state => Err(ClientError::InvalidState(format!(
                "Cannot {} in state {:?}",
                operation, state
            ))),
        }
    }

    fn transition(&self, from: TransactionState, to: TransactionState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            if *state == TransactionState::Aborted {
                return Err(ClientError::Aborted(self.id()));
            }
            return Err(ClientError::InvalidState(format!(
                "Cannot move from {:?} to {:?}, transaction is {:?}",
                from, to, *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: TransactionState) {
        *self.state.lock() = to;
    }

    fn start_heartbeat(&self) {
        let heartbeat = Heartbeat {
            state: self.state.clone(),
            involved: self.involved.clone(),
            rpc: self.rpc.clone(),
            clock: self.clock.clone(),
            transaction_id: self.id(),
            status_tablet: self.metadata.status_tablet.clone(),
        };
        let handle = heartbeat.spawn(self.config.heartbeat_interval, self.config.expiry_timeout);
        *self.heartbeat.lock() = Some(handle);
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

/// State the heartbeat task shares with its transaction.
struct Heartbeat {
    state: Arc<Mutex<TransactionState>>,
    involved: Arc<Mutex<BTreeSet<String>>>,
    rpc: Arc<dyn TransactionRpc>,
    clock: SharedHlcClock,
    transaction_id: TransactionId,
    status_tablet: String,
}

impl Heartbeat {
    fn spawn(self, period: Duration, expiry: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            let mut last_success = tokio::time::Instant::now();

            loop {
                interval.tick().await;
                if *self.state.lock() != TransactionState::Ready {
                    break;
                }

                let request = UpdateTransactionRequest {
                    tablet_id: self.status_tablet.clone(),
                    transaction_id: self.transaction_id,
                    status: TransactionStatus::Pending,
                    propagated_hybrid_time: self.clock.now(),
                    involved_tablets: self.involved.lock().iter().cloned().collect(),
                };
                match self.rpc.update_transaction(request).await {
                    Ok(response) if response.status == TransactionStatus::Pending => {
                        self.clock.update(response.propagated_hybrid_time);
                        last_success = tokio::time::Instant::now();
                    }
                    Ok(response) => {
                        tracing::warn!(
                            "Transaction {} is {:?} at its status tablet",
                            self.transaction_id,
                            response.status
                        );
                        self.abort_locally();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to send heartbeat for {}: {}", self.transaction_id, e);
                        if last_success.elapsed() > expiry {
                            tracing::warn!(
                                "No heartbeat for {} within {:?}, aborting",
                                self.transaction_id,
                                expiry
                            );
                            self.abort_locally();
                            break;
                        }
                    }
                }
            }
        })
    }

    fn abort_locally(&self) {
        let mut state = self.state.lock();
        if *state == TransactionState::Ready {
            *state = TransactionState::Aborted;
        }
    }
}

/// Priority from the random bits of a v7 id.
fn priority_from_id(transaction_id: TransactionId) -> u64 {
    let bytes = transaction_id.to_bytes();
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[8..]);
    u64::from_be_bytes(low)
}
