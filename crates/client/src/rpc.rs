//! RPC contract between transaction clients and status tablets.

use crate::error::{ClientError, Result};
use crate::status_tablet::StatusTablet;
use async_trait::async_trait;
use docstore_common::{TransactionId, TransactionStatus};
use docstore_hlc::HybridTime;
use std::sync::Arc;

/// Create, heartbeat or commit a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTransactionRequest {
    pub tablet_id: String,
    pub transaction_id: TransactionId,
    /// `Created`, `Pending` (heartbeat) or `Committed`.
    pub status: TransactionStatus,
    pub propagated_hybrid_time: HybridTime,
    /// Data tablets the transaction has written to so far.
    pub involved_tablets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortTransactionRequest {
    pub tablet_id: String,
    pub transaction_id: TransactionId,
    pub propagated_hybrid_time: HybridTime,
    pub involved_tablets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatusResponse {
    pub status: TransactionStatus,
    pub propagated_hybrid_time: HybridTime,
    /// Set once the transaction is committed.
    pub commit_hybrid_time: Option<HybridTime>,
}

#[async_trait]
pub trait TransactionRpc: Send + Sync {
    async fn update_transaction(&self, request: UpdateTransactionRequest) -> Result<TransactionStatusResponse>;

    async fn abort_transaction(&self, request: AbortTransactionRequest) -> Result<TransactionStatusResponse>;

    async fn get_transaction_status(
        &self,
        tablet_id: &str,
        transaction_id: TransactionId,
        propagated_hybrid_time: HybridTime,
    ) -> Result<TransactionStatusResponse>;
}

/// Calls into a status tablet of this process. Updates may apply or remove
/// intents on data tablets, so they run on the blocking pool.
pub struct LocalTransactionRpc {
    status_tablet: Arc<StatusTablet>,
}

impl LocalTransactionRpc {
    pub fn new(status_tablet: Arc<StatusTablet>) -> Self {
        Self { status_tablet }
    }

    fn tablet_for(&self, tablet_id: &str) -> Result<Arc<StatusTablet>> {
        if self.status_tablet.tablet_id() != tablet_id {
            return Err(ClientError::TabletNotFound(tablet_id.to_string()));
        }
        Ok(self.status_tablet.clone())
    }
}

#[async_trait]
impl TransactionRpc for LocalTransactionRpc {
    async fn update_transaction(&self, request: UpdateTransactionRequest) -> Result<TransactionStatusResponse> {
        let status_tablet = self.tablet_for(&request.tablet_id)?;
        tokio::task::spawn_blocking(move || status_tablet.update(request)).await?
    }

    async fn abort_transaction(&self, request: AbortTransactionRequest) -> Result<TransactionStatusResponse> {
        let status_tablet = self.tablet_for(&request.tablet_id)?;
        tokio::task::spawn_blocking(move || status_tablet.abort(request)).await?
    }

    async fn get_transaction_status(
        &self,
        tablet_id: &str,
        transaction_id: TransactionId,
        propagated_hybrid_time: HybridTime,
    ) -> Result<TransactionStatusResponse> {
        let status_tablet = self.tablet_for(tablet_id)?;
        Ok(status_tablet.status_response(transaction_id, propagated_hybrid_time))
    }
}
