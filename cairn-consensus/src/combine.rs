//! Reduction of the per-rm ballots for one variable into a single
//! outcome ballot.

use cairn_core::{Ballot, TxnId, VarUuid, Vote, VoteKind, VectorClockMut};

use crate::accumulator::RmBallot;
use crate::bad_reads::BadReads;
use crate::error::ConsensusError;

/// Running state of one variable's reduction. Starts as a commit with an
/// empty clock; each rm ballot is folded in, in [`RmId`](cairn_core::RmId)
/// order.
pub(crate) struct BallotReducer {
    var: VarUuid,
    vote: Vote,
    clock: VectorClockMut,
    subscribers: Vec<TxnId>,
}

impl BallotReducer {
    pub(crate) fn new(var: VarUuid) -> Self {
        Self {
            var,
            vote: Vote::Commit,
            clock: VectorClockMut::new(),
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn combine(
        &mut self,
        rm_bal: &RmBallot,
        bad_reads: &mut BadReads,
    ) -> Result<(), ConsensusError> {
        let new = &rm_bal.ballot;

        if let Vote::AbortBadRead(witness) = &new.vote {
            bad_reads.combine(witness, &new.clock)?;
        }

        let cur_kind = self.vote.kind();
        let new_kind = new.kind();
        let own = self.var;

        if cur_kind == VoteKind::Commit && new_kind == VoteKind::Commit {
            self.clock.merge_max(&new.clock);
            self.subscribers.extend(new.subscribers.iter().copied());
        } else if cur_kind == VoteKind::AbortDeadlock && self.clock.is_empty() {
            // Already holding a synthetic abort: nothing trumps it.
        } else if new_kind == VoteKind::AbortDeadlock && new.clock.is_empty() {
            // Synthesised by an abort proposer; trumps everything.
            self.vote = Vote::AbortDeadlock;
            self.clock = new.clock.to_mut();
            self.subscribers.clear();
        } else if cur_kind == VoteKind::Commit {
            // First abort wins over the provisional commit.
            self.vote = new.vote.clone();
            self.clock = new.clock.to_mut();
            self.subscribers.clear();
        } else if new_kind == VoteKind::Commit {
            // Already aborting; a commit vote cannot rescue it.
        } else if new_kind == VoteKind::AbortDeadlock && cur_kind == VoteKind::AbortDeadlock {
            self.clock.merge_max(&new.clock);
        } else if new_kind == VoteKind::AbortDeadlock && cur_kind == VoteKind::AbortBadRead {
            if new.clock.at(&own) < self.clock.at(&own) {
                // The deadlock is strictly in the past of the bad read.
                self.clock.merge_max(&new.clock);
            } else {
                self.vote = Vote::AbortDeadlock;
                self.clock.merge_max(&new.clock);
            }
        } else if cur_kind == VoteKind::AbortBadRead {
            // Both bad reads.
            self.clock.merge_max(&new.clock);
        } else if new.clock.at(&own) > self.clock.at(&own) {
            // cur deadlock, new bad read strictly in its future.
            self.vote = new.vote.clone();
            self.clock.merge_max(&new.clock);
        } else {
            // cur deadlock, new bad read not ahead of it.
            self.clock.merge_max(&new.clock);
        }

        Ok(())
    }

    pub(crate) fn into_ballot(self) -> Ballot {
        Ballot {
            var: self.var,
            vote: self.vote,
            clock: self.clock.freeze(),
            subscribers: self.subscribers,
        }
    }
}
