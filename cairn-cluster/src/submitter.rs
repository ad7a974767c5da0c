//! The transaction-submission seam. The local submission front-end lives
//! outside the core; this is the interface the topology writer drives it
//! through.

use std::fmt;

use cairn_core::{BootCount, Outcome, RmId, Txn, TxnId};

#[derive(Debug)]
pub enum SubmitError {
    /// Not enough of the named active set was reachable.
    Disconnected,
    Internal(String),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Disconnected => write!(f, "active replica managers unreachable"),
            SubmitError::Internal(e) => write!(f, "submission failed: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Runs transactions on behalf of this process and reports local
/// identity.
pub trait TxnSubmitter: Clone + Send + Sync + 'static {
    fn rm_id(&self) -> RmId;
    fn boot_count(&self) -> BootCount;
    /// A fresh transaction id stamped with this submitter's identity.
    fn fresh_txn_id(&self) -> TxnId;

    /// Submit and wait for the disseminated outcome.
    fn run_transaction(
        &self,
        txn: Txn,
        active: &[RmId],
    ) -> impl Future<Output = Result<Outcome, SubmitError>> + Send;
}
