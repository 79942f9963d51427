//! Logical writes of one operation batch and their materialization as
//! either committed records or transaction intents.

use crate::doc_key::SubDocKey;
use crate::encoding::Encode;
use crate::error::{Error, Result};
use crate::intent::{
    IntentType, IntentTypeSet, IntentValue, encode_intent_key, reverse_index_key,
    transaction_metadata_key,
};
use crate::value::Value;
use crate::write_batch::WriteBatch;
use docstore_common::TransactionMetadata;
use docstore_hlc::{DocHybridTime, HybridTime};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone)]
pub struct DocWriteBatch {
    writes: Vec<(SubDocKey, Value)>,
    read_paths: Vec<SubDocKey>,
}

impl DocWriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, key: SubDocKey, value: Value) {
        self.writes.push((key, value));
    }

    pub fn delete(&mut self, key: SubDocKey) {
        self.writes.push((key, Value::tombstone()));
    }

    /// Path read by a serializable transaction, locked with a read intent.
    pub fn add_read_path(&mut self, key: SubDocKey) {
        self.read_paths.push(key);
    }

    pub fn writes(&self) -> &[(SubDocKey, Value)] {
        &self.writes
    }

    pub fn read_paths(&self) -> &[SubDocKey] {
        &self.read_paths
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.read_paths.is_empty()
    }

    pub fn clear(&mut self) {
        self.writes.clear();
        self.read_paths.clear();
    }

    /// Number of intent records `to_intents_batch` produces, and therefore
    /// of write ids it consumes.
    pub fn intent_count(&self) -> Result<u32> {
        let mut ancestors = BTreeSet::new();
        for key in self.writes.iter().map(|(key, _)| key).chain(&self.read_paths) {
            ancestors.extend(key.encoded_ancestors()?);
        }
        write_id_of(self.writes.len() + self.read_paths.len() + ancestors.len())
    }

    /// Committed records at `ht`, write ids in operation order.
    pub fn to_regular_batch(&self, ht: HybridTime) -> Result<WriteBatch> {
        let mut batch = WriteBatch::new();
        for (write_id, (key, value)) in self.writes.iter().enumerate() {
            let doc_ht = DocHybridTime::new(ht, write_id_of(write_id)?);
            batch.put(key.clone().with_ht(doc_ht).encode()?, value.encode()?);
        }
        Ok(batch)
    }

    /// Intents at `ht` for the transaction in `metadata`: a strong intent
    /// with the value for each write, strong read intents for read paths,
    /// weak intents on all ancestors, a reverse index entry per intent and
    /// the metadata record. Write ids start at `first_write_id`; returns the
    /// batch and the next unused write id.
    pub fn to_intents_batch(
        &self,
        metadata: &TransactionMetadata,
        ht: HybridTime,
        first_write_id: u32,
    ) -> Result<(WriteBatch, u32)> {
        let transaction_id = metadata.transaction_id;
        let mut batch = WriteBatch::new();
        let mut write_id = first_write_id;

        let mut put_intent = |batch: &mut WriteBatch,
                              path: &[u8],
                              types: IntentTypeSet,
                              value: Vec<u8>|
         -> Result<()> {
            let doc_ht = DocHybridTime::new(ht, write_id);
            let intent_key = encode_intent_key(path, types, doc_ht);
            let intent = IntentValue {
                transaction_id,
                write_id,
                value,
            };
            batch.put(intent_key.clone(), intent.encode()?);
            batch.put(reverse_index_key(transaction_id, doc_ht), intent_key);
            write_id = write_id
                .checked_add(1)
                .ok_or_else(|| Error::InvalidArgument("Write id space exhausted".into()))?;
            Ok(())
        };

        let mut weak: BTreeMap<Vec<u8>, IntentTypeSet> = BTreeMap::new();
        let strong_write = IntentTypeSet::single(IntentType::StrongWrite);
        for (key, value) in &self.writes {
            put_intent(&mut batch, &key.encode_without_ht()?, strong_write, value.encode()?)?;
            for ancestor in key.encoded_ancestors()? {
                let types = weak.entry(ancestor).or_insert(IntentTypeSet::EMPTY);
                *types = types.union(strong_write.to_weak());
            }
        }

        let strong_read = IntentTypeSet::single(IntentType::StrongRead);
        for key in &self.read_paths {
            put_intent(&mut batch, &key.encode_without_ht()?, strong_read, Vec::new())?;
            for ancestor in key.encoded_ancestors()? {
                let types = weak.entry(ancestor).or_insert(IntentTypeSet::EMPTY);
                *types = types.union(strong_read.to_weak());
            }
        }

        for (path, types) in &weak {
            put_intent(&mut batch, path, *types, Vec::new())?;
        }

        let metadata_bytes = metadata.to_bytes().map_err(Error::InvalidArgument)?;
        batch.put(transaction_metadata_key(transaction_id), metadata_bytes);
        Ok((batch, write_id))
    }
}

fn write_id_of(index: usize) -> Result<u32> {
    u32::try_from(index).map_err(|_| Error::InvalidArgument("Too many writes in one batch".into()))
}
