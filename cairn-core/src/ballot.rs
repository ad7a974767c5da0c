//! Ballots: one replica manager's vote for one variable in one
//! transaction.

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::ids::{TxnId, VarUuid};
use crate::txn::Action;

/// The bare vote, as carried in outcome manifests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteKind {
    Commit,
    AbortBadRead,
    AbortDeadlock,
}

/// The reason payload of a bad-read vote: the transaction the voter saw
/// last write the variable, and its actions as witnessed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadReadWitness {
    pub txn_id: TxnId,
    pub actions: Vec<Action>,
}

/// A vote with its reason payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    AbortBadRead(BadReadWitness),
    /// A deadlock abort synthesised by an abort proposer carries an empty
    /// clock on its ballot; one voted by a variable carries that
    /// variable's clock.
    AbortDeadlock,
}

impl Vote {
    #[must_use]
    pub fn kind(&self) -> VoteKind {
        match self {
            Vote::Commit => VoteKind::Commit,
            Vote::AbortBadRead(_) => VoteKind::AbortBadRead,
            Vote::AbortDeadlock => VoteKind::AbortDeadlock,
        }
    }
}

/// One accepted per-(rm, var) vote with its clock and the transactions
/// subscribing through it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub var: VarUuid,
    pub vote: Vote,
    pub clock: VectorClock,
    pub subscribers: Vec<TxnId>,
}

impl Ballot {
    #[must_use]
    pub fn commit(var: VarUuid, clock: VectorClock, subscribers: Vec<TxnId>) -> Self {
        Self {
            var,
            vote: Vote::Commit,
            clock,
            subscribers,
        }
    }

    #[must_use]
    pub fn bad_read(var: VarUuid, clock: VectorClock, witness: BadReadWitness) -> Self {
        Self {
            var,
            vote: Vote::AbortBadRead(witness),
            clock,
            subscribers: Vec::new(),
        }
    }

    #[must_use]
    pub fn deadlock(var: VarUuid, clock: VectorClock) -> Self {
        Self {
            var,
            vote: Vote::AbortDeadlock,
            clock,
            subscribers: Vec::new(),
        }
    }

    #[must_use]
    pub fn aborted(&self) -> bool {
        !matches!(self.vote, Vote::Commit)
    }

    #[must_use]
    pub fn kind(&self) -> VoteKind {
        self.vote.kind()
    }
}
