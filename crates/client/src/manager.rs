//! Entry point for starting transactions.

use crate::config::TransactionConfig;
use crate::error::Result;
use crate::rpc::TransactionRpc;
use crate::transaction::Transaction;
use docstore_common::IsolationLevel;
use docstore_hlc::SharedHlcClock;
use std::sync::Arc;

/// Starts transactions against one status tablet with shared settings.
pub struct TransactionManager {
    rpc: Arc<dyn TransactionRpc>,
    clock: SharedHlcClock,
    config: TransactionConfig,
}

impl TransactionManager {
    pub fn new(rpc: Arc<dyn TransactionRpc>, clock: SharedHlcClock, config: TransactionConfig) -> Self {
        Self { rpc, clock, config }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedHlcClock {
        &self.clock
    }

    /// Begin a transaction with the configured isolation level.
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.rpc.clone(), self.clock.clone(), self.config.clone()).await
    }

    pub async fn begin_with(&self, isolation: IsolationLevel) -> Result<Transaction> {
        let config = self.config.clone().with_isolation(isolation);
        Transaction::begin(self.rpc.clone(), self.clock.clone(), config).await
    }
}
