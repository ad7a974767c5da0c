//! Engine errors. Apart from [`EngineError::ShuttingDown`], every variant
//! is fatal to the dispatcher: losing a committed write is worse than
//! crashing.

use std::fmt;

use cairn_core::{CodecError, TxnId, VarUuid};

use crate::storage::StorageError;

#[derive(Debug)]
pub enum EngineError {
    Codec(CodecError),
    Storage(StorageError),
    /// A Var record pointed at transaction bytes that are not on disk.
    MissingTxnBytes { txn_id: TxnId },
    /// An outcome was delivered to a variable its transaction never
    /// named.
    ActionMissing { var: VarUuid, txn_id: TxnId },
    /// Global completion arrived for a transaction this variable holds no
    /// frame state for.
    UnknownTxn { var: VarUuid, txn_id: TxnId },
    /// The dispatcher has been cancelled.
    ShuttingDown,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Codec(e) => write!(f, "codec failure: {e}"),
            EngineError::Storage(e) => write!(f, "storage failure: {e}"),
            EngineError::MissingTxnBytes { txn_id } => {
                write!(f, "transaction bytes for {txn_id} missing from disk")
            }
            EngineError::ActionMissing { var, txn_id } => {
                write!(f, "{txn_id} delivered to {var} but names no action for it")
            }
            EngineError::UnknownTxn { var, txn_id } => {
                write!(f, "{var} has no frame state for {txn_id}")
            }
            EngineError::ShuttingDown => write!(f, "dispatcher is shutting down"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Codec(e) => Some(e),
            EngineError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for EngineError {
    fn from(e: CodecError) -> Self {
        EngineError::Codec(e)
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e)
    }
}
