//! Document write operations.

use crate::doc_key::SubDocKey;
use crate::doc_reader::ReadContext;
use crate::doc_write_batch::DocWriteBatch;
use crate::error::{Error, Result};
use crate::intent::{IntentType, IntentTypeSet};
use crate::lock_manager::{LockBatchEntry, path_lock_entries};
use crate::primitive_value::PrimitiveValue;
use crate::sub_document::SubDocument;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum DocOperation {
    /// Replace the sub-document at `key`.
    Put { key: SubDocKey, value: Value },
    /// Delete the sub-document at `key` and everything below it.
    Delete { key: SubDocKey },
    /// Add `delta` to the integer at `key`; absent counts as zero.
    Increment { key: SubDocKey, delta: i64 },
    /// Write `value` only if nothing is visible at `key`.
    PutIfAbsent { key: SubDocKey, value: Value },
}

/// Outcome of one applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationResult {
    /// False when a conditional operation found its condition unmet.
    pub applied: bool,
}

impl DocOperation {
    pub fn key(&self) -> &SubDocKey {
        match self {
            DocOperation::Put { key, .. }
            | DocOperation::Delete { key }
            | DocOperation::Increment { key, .. }
            | DocOperation::PutIfAbsent { key, .. } => key,
        }
    }

    /// Whether applying the operation reads the current value.
    pub fn requires_read(&self) -> bool {
        matches!(
            self,
            DocOperation::Increment { .. } | DocOperation::PutIfAbsent { .. }
        )
    }

    fn strong_intents(&self) -> IntentTypeSet {
        let mut types = IntentTypeSet::single(IntentType::StrongWrite);
        if self.requires_read() {
            types.insert(IntentType::StrongRead);
        }
        types
    }

    /// Locks the operation needs: strong on its path, weak on ancestors.
    pub fn lock_entries(&self) -> Result<Vec<LockBatchEntry>> {
        path_lock_entries(self.key(), self.strong_intents())
    }

    /// Add the operation's writes to `batch`, reading through `read` when
    /// needed.
    pub fn apply(&self, read: &mut ReadContext<'_>, batch: &mut DocWriteBatch) -> Result<OperationResult> {
        match self {
            DocOperation::Put { key, value } => {
                if key.subkeys.is_empty() && !value.is_tombstone() && !is_object(value) {
                    return Err(Error::InvalidArgument(format!(
                        "Document {} can only hold an object",
                        key.doc_key
                    )));
                }
                batch.set_value(key.clone(), value.clone());
            }
            DocOperation::Delete { key } => batch.delete(key.clone()),
            DocOperation::Increment { key, delta } => {
                match read.get_sub_document(key)? {
                    None => {}
                    Some(SubDocument::Primitive(current)) if current.as_i64().is_some() => {}
                    Some(other) => {
                        return Err(Error::InvalidArgument(format!(
                            "Cannot increment non-integer value {} at {}",
                            other, key
                        )));
                    }
                }
                batch.set_value(key.clone(), Value::increment(*delta));
            }
            DocOperation::PutIfAbsent { key, value } => {
                if read.get_sub_document(key)?.is_some() {
                    return Ok(OperationResult { applied: false });
                }
                batch.set_value(key.clone(), value.clone());
            }
        }
        Ok(OperationResult { applied: true })
    }
}

fn is_object(value: &Value) -> bool {
    matches!(value.primitive, PrimitiveValue::Object)
}
