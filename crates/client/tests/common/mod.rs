//! Common test utilities for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use docstore_client::{
    AbortTransactionRequest, ClientError, LocalTransactionRpc, Result, StatusTablet,
    TransactionConfig, TransactionManager, TransactionRpc, TransactionStatusResponse,
    UpdateTransactionRequest,
};
use docstore_common::{TransactionId, TransactionStatus};
use docstore_docdb::{
    DocDbConfig, DocKey, DocOperation, PrimitiveValue, ReadOptions, StorageConfig, SubDocKey,
    Tablet, Value, WriteRequest,
};
use docstore_hlc::{HlcClock, HybridTime, SharedHlcClock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const STATUS_TABLET: &str = "status";

/// A status tablet and two data tablets sharing one clock.
pub struct Cluster {
    _dir: TempDir,
    pub clock: SharedHlcClock,
    pub status: Arc<StatusTablet>,
    pub tablets: Vec<Arc<Tablet>>,
    pub rpc: Arc<FlakyRpc>,
    pub manager: TransactionManager,
}

impl Cluster {
    pub fn start(config: TransactionConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let clock: SharedHlcClock = Arc::new(HlcClock::system());
        let status = Arc::new(StatusTablet::new(
            STATUS_TABLET,
            clock.clone(),
            config.expiry_timeout,
        ));

        let mut tablets = Vec::new();
        for index in 0..2 {
            let tablet = Arc::new(
                Tablet::open_local(
                    StorageConfig::new(dir.path().join(tablet_id(index))),
                    DocDbConfig::default().with_lock_wait_timeout(Duration::from_millis(50)),
                    clock.clone(),
                )
                .unwrap(),
            );
            status.register_tablet(tablet_id(index), tablet.clone());
            tablets.push(tablet);
        }

        let rpc = Arc::new(FlakyRpc::new(LocalTransactionRpc::new(status.clone())));
        let manager = TransactionManager::new(
            rpc.clone(),
            clock.clone(),
            config.with_status_tablet(STATUS_TABLET),
        );
        Self {
            _dir: dir,
            clock,
            status,
            tablets,
            rpc,
            manager,
        }
    }

    pub fn tablet(&self, index: usize) -> Arc<Tablet> {
        self.tablets[index].clone()
    }

    /// Latest committed value of an integer field.
    pub fn read(&self, index: usize, key: &SubDocKey) -> Option<i64> {
        self.tablets[index]
            .read(key, ReadOptions::new(deadline()))
            .unwrap()
            .document
            .and_then(|doc| doc.as_primitive().and_then(PrimitiveValue::as_i64))
    }

    /// Non-transactional write.
    pub fn put(&self, index: usize, key: &SubDocKey, value: i64) -> docstore_docdb::Result<()> {
        self.tablets[index]
            .write(WriteRequest::new(vec![put(key, value)], deadline()))
            .map(|_| ())
    }

    pub fn unresolved(&self, index: usize) -> Vec<TransactionId> {
        self.tablets[index]
            .participant()
            .transactions_with_intents()
            .unwrap()
    }
}

/// Passes calls through, failing heartbeats on demand.
pub struct FlakyRpc {
    inner: LocalTransactionRpc,
    fail_heartbeats: AtomicBool,
}

impl FlakyRpc {
    pub fn new(inner: LocalTransactionRpc) -> Self {
        Self {
            inner,
            fail_heartbeats: AtomicBool::new(false),
        }
    }

    pub fn fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionRpc for FlakyRpc {
    async fn update_transaction(&self, request: UpdateTransactionRequest) -> Result<TransactionStatusResponse> {
        if request.status == TransactionStatus::Pending && self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(ClientError::Rpc("status tablet unreachable".to_string()));
        }
        self.inner.update_transaction(request).await
    }

    async fn abort_transaction(&self, request: AbortTransactionRequest) -> Result<TransactionStatusResponse> {
        self.inner.abort_transaction(request).await
    }

    async fn get_transaction_status(
        &self,
        tablet_id: &str,
        transaction_id: TransactionId,
        propagated_hybrid_time: HybridTime,
    ) -> Result<TransactionStatusResponse> {
        self.inner
            .get_transaction_status(tablet_id, transaction_id, propagated_hybrid_time)
            .await
    }
}

pub fn tablet_id(index: usize) -> String {
    format!("tablet-{}", index)
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

pub fn field(doc: &str, name: &str) -> SubDocKey {
    SubDocKey::new(
        DocKey::from_range(vec![PrimitiveValue::string(doc)]),
        vec![PrimitiveValue::string(name)],
    )
}

pub fn put(key: &SubDocKey, value: i64) -> DocOperation {
    DocOperation::Put {
        key: key.clone(),
        value: Value::new(PrimitiveValue::Int64(value)),
    }
}

pub fn as_int(document: Option<docstore_docdb::SubDocument>) -> Option<i64> {
    document.and_then(|doc| doc.as_primitive().and_then(PrimitiveValue::as_i64))
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let until = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < until {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
