//! Transaction outcomes and rerun hints.

use serde::{Deserialize, Serialize};

use crate::ballot::VoteKind;
use crate::clock::VectorClock;
use crate::ids::{RmId, TxnId, VarUuid};
use crate::txn::{Action, Txn};

/// One accepted paxos instance, named in the outcome manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedInstance {
    pub rm_id: RmId,
    pub vote: VoteKind,
}

/// Per-variable manifest entry: which instances were accepted, in
/// [`RmId`] order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeVar {
    pub var: VarUuid,
    pub accepted_instances: Vec<AcceptedInstance>,
}

/// Repair hint for one witnessed transaction: what the resubmitting
/// client must re-read before trying again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub txn_id: TxnId,
    pub actions: Vec<Action>,
    pub clock: VectorClock,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortKind {
    /// Deadlock: try the same transaction again.
    Resubmit,
    /// Bad reads: re-read the listed versions first.
    Rerun(Vec<Update>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Commit { clock: VectorClock },
    Abort(AbortKind),
}

/// The decided fate of a transaction, disseminated to every participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub txn_id: TxnId,
    /// Variables in sorted order, each instance list in [`RmId`] order.
    pub id: Vec<OutcomeVar>,
    /// The full transaction body on commit, the deflated body on abort.
    pub txn: Txn,
    pub decision: Decision,
}

impl Outcome {
    #[must_use]
    pub fn committed(&self) -> bool {
        matches!(self.decision, Decision::Commit { .. })
    }

    #[must_use]
    pub fn commit_clock(&self) -> Option<&VectorClock> {
        match &self.decision {
            Decision::Commit { clock } => Some(clock),
            Decision::Abort(_) => None,
        }
    }
}
