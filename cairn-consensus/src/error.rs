//! Consensus-layer errors. Every variant is a protocol violation or an
//! internal invariant failure; none are recovered silently.

use std::fmt;

use cairn_core::{TxnId, VarUuid};

#[derive(Debug)]
pub enum ConsensusError {
    /// A ballot arrived for a variable the transaction does not name.
    UnknownVar { txn_id: TxnId, var: VarUuid },
    /// A persisted accumulator did not have every variable complete.
    InstanceCountMismatch {
        txn_id: TxnId,
        expected: usize,
        found: usize,
    },
    /// A committing outcome's combined clock had fewer entries than the
    /// transaction has variables.
    ShortCombinedClock {
        txn_id: TxnId,
        vars: usize,
        clock_len: usize,
    },
    /// A read-only bad read witnessed clock element zero: there is no
    /// version before the first.
    BadReadClockUnderflow { var: VarUuid, txn_id: TxnId },
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::UnknownVar { txn_id, var } => {
                write!(f, "{txn_id}: ballot for unknown variable {var}")
            }
            ConsensusError::InstanceCountMismatch {
                txn_id,
                expected,
                found,
            } => write!(
                f,
                "{txn_id}: expected {expected} persisted instances, found {found}"
            ),
            ConsensusError::ShortCombinedClock {
                txn_id,
                vars,
                clock_len,
            } => write!(
                f,
                "{txn_id}: outcome clock too short: {clock_len} entries for {vars} vars"
            ),
            ConsensusError::BadReadClockUnderflow { var, txn_id } => write!(
                f,
                "bad read of {var} in {txn_id} witnessed clock element zero"
            ),
        }
    }
}

impl std::error::Error for ConsensusError {}
