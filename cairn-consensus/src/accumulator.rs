//! The per-transaction ballot accumulator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cairn_core::{
    AbortKind, AcceptedInstance, Ballot, Decision, Outcome, OutcomeVar, RmId, Status,
    StatusConsumer, Txn, TxnId, VarUuid, VectorClockMut, VoteKind,
};

use crate::bad_reads::BadReads;
use crate::combine::BallotReducer;
use crate::error::ConsensusError;

/// One accepted instance as tracked inside the accumulator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RmBallot {
    pub instance_rm: RmId,
    pub round_number: u64,
    pub ballot: Ballot,
}

#[derive(Debug)]
struct VarBallot {
    var: VarUuid,
    rm_to_ballot: Vec<RmBallot>,
    /// Required ballot count: the number of active allocations whose
    /// action indices name this variable.
    voters: usize,
    result: Option<Ballot>,
}

impl VarBallot {
    fn complete(&self) -> bool {
        self.voters > 0 && self.rm_to_ballot.len() >= self.voters
    }

    /// Reduce the rm ballots to this variable's outcome ballot, folding
    /// commits into the combined clock and subscriber set and bad reads
    /// into the table.
    fn calculate_result(
        &mut self,
        bad_reads: &mut BadReads,
        combined: &mut VectorClockMut,
        subscribers: &mut BTreeSet<TxnId>,
    ) -> Result<(), ConsensusError> {
        let mut reducer = BallotReducer::new(self.var);
        for rm_bal in &self.rm_to_ballot {
            reducer.combine(rm_bal, bad_reads)?;
        }
        let result = reducer.into_ballot();
        if !result.aborted() {
            combined.merge_max(&result.clock);
            subscribers.extend(result.subscribers.iter().copied());
        }
        self.result = Some(result);
        Ok(())
    }
}

/// Persisted form of one complete variable: its accepted instances and
/// the reduced result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancesForVar {
    pub var: VarUuid,
    pub instances: Vec<PersistedInstance>,
    pub result: Ballot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedInstance {
    pub rm_id: RmId,
    pub round_number: u64,
    pub ballot: Ballot,
}

/// Aggregates per-(rm, var) accepted ballots for one transaction into an
/// outcome. There is one accumulator per transaction; all calls for that
/// transaction are serialised by its owning dispatcher.
#[derive(Debug)]
pub struct BallotAccumulator {
    txn_id: TxnId,
    txn: Txn,
    var_ballots: BTreeMap<VarUuid, VarBallot>,
    outcome: Option<Arc<Outcome>>,
    subscribers: Vec<TxnId>,
    incomplete_vars: usize,
    dirty: bool,
}

impl BallotAccumulator {
    #[must_use]
    pub fn new(txn_id: TxnId, txn: Txn) -> Self {
        let mut voters_by_index = vec![0usize; txn.actions.len()];
        for alloc in &txn.allocations {
            // Active allocations precede passive; the first passive one
            // ends the voter count.
            if !alloc.active.is_active() {
                break;
            }
            for index in &alloc.action_indices {
                if let Some(count) = voters_by_index.get_mut(usize::from(*index)) {
                    *count += 1;
                }
            }
        }

        let var_ballots = txn
            .actions
            .iter()
            .zip(voters_by_index)
            .map(|(action, voters)| {
                (
                    action.var,
                    VarBallot {
                        var: action.var,
                        rm_to_ballot: Vec::new(),
                        voters,
                        result: None,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        let incomplete_vars = var_ballots.len();
        Self {
            txn_id,
            txn,
            var_ballots,
            outcome: None,
            subscribers: Vec::new(),
            incomplete_vars,
            dirty: false,
        }
    }

    /// Restore an accumulator from its persisted instances. Everything
    /// that went to disk must have been complete.
    pub fn from_persisted(
        txn_id: TxnId,
        txn: Txn,
        outcome: Outcome,
        subscribers: Vec<TxnId>,
        instances: Vec<InstancesForVar>,
    ) -> Result<Self, ConsensusError> {
        let mut ba = Self::new(txn_id, txn);
        if ba.incomplete_vars != instances.len() {
            return Err(ConsensusError::InstanceCountMismatch {
                txn_id,
                expected: ba.incomplete_vars,
                found: instances.len(),
            });
        }
        ba.incomplete_vars = 0;

        for per_var in instances {
            let vb = ba
                .var_ballots
                .get_mut(&per_var.var)
                .ok_or(ConsensusError::UnknownVar {
                    txn_id,
                    var: per_var.var,
                })?;
            vb.rm_to_ballot = per_var
                .instances
                .into_iter()
                .map(|instance| RmBallot {
                    instance_rm: instance.rm_id,
                    round_number: instance.round_number,
                    ballot: instance.ballot,
                })
                .collect();
            vb.result = Some(per_var.result);
        }

        ba.outcome = Some(Arc::new(outcome));
        ba.subscribers = subscribers;
        Ok(ba)
    }

    #[must_use]
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    #[must_use]
    pub fn txn(&self) -> &Txn {
        &self.txn
    }

    #[must_use]
    pub fn incomplete_vars(&self) -> usize {
        self.incomplete_vars
    }

    /// Record one accepted ballot. An entry for the same instance rm is
    /// overwritten (a higher paxos round resubmitted); a fresh entry that
    /// completes the variable's quorum decrements the incomplete count.
    pub fn ballot_received(
        &mut self,
        instance_rm: RmId,
        round_number: u64,
        ballot: Ballot,
        txn: &Txn,
    ) -> Result<Option<(Arc<Outcome>, Vec<TxnId>)>, ConsensusError> {
        self.txn.combine(txn);

        let txn_id = self.txn_id;
        let var = ballot.var;
        let vb = self
            .var_ballots
            .get_mut(&var)
            .ok_or(ConsensusError::UnknownVar { txn_id, var })?;

        match vb
            .rm_to_ballot
            .iter_mut()
            .find(|rm_bal| rm_bal.instance_rm == instance_rm)
        {
            Some(rm_bal) => {
                rm_bal.ballot = ballot;
                rm_bal.round_number = round_number;
            }
            None => {
                vb.rm_to_ballot.push(RmBallot {
                    instance_rm,
                    round_number,
                    ballot,
                });
                if vb.rm_to_ballot.len() == vb.voters {
                    self.incomplete_vars -= 1;
                }
                if vb.rm_to_ballot.len() >= vb.voters {
                    vb.rm_to_ballot.sort_by_key(|rm_bal| rm_bal.instance_rm);
                }
            }
        }

        if vb.complete() {
            vb.result = None;
            self.dirty = true;
        }

        self.determine_outcome()
    }

    /// Collapse the complete per-variable ballots into the transaction
    /// outcome. A no-op while any variable lacks its quorum: with fewer
    /// than f+1 ballots for a var, a slow learner could issue a phantom
    /// bad read from a stale view.
    pub fn determine_outcome(
        &mut self,
    ) -> Result<Option<(Arc<Outcome>, Vec<TxnId>)>, ConsensusError> {
        if !(self.dirty && self.incomplete_vars == 0) {
            return Ok(self
                .outcome
                .clone()
                .map(|outcome| (outcome, self.subscribers.clone())));
        }
        self.dirty = false;
        debug!(txn = %self.txn_id, "determining outcome");

        let mut combined = VectorClockMut::new();
        let mut commit_subscribers = BTreeSet::new();
        let mut bad_reads = BadReads::new();
        let mut aborted = false;
        let mut deadlock = false;

        for vb in self.var_ballots.values_mut() {
            if vb.result.is_none() {
                vb.calculate_result(&mut bad_reads, &mut combined, &mut commit_subscribers)?;
            } else if let Some(result) = &vb.result {
                if !result.aborted() {
                    combined.merge_max(&result.clock);
                    commit_subscribers.extend(result.subscribers.iter().copied());
                }
            }
            if let Some(result) = &vb.result {
                aborted = aborted || result.aborted();
                deadlock = deadlock || result.kind() == VoteKind::AbortDeadlock;
            }
        }

        // The manifest: variables sorted, instances in rm order.
        let id = self
            .var_ballots
            .values()
            .map(|vb| OutcomeVar {
                var: vb.var,
                accepted_instances: vb
                    .rm_to_ballot
                    .iter()
                    .map(|rm_bal| AcceptedInstance {
                        rm_id: rm_bal.instance_rm,
                        vote: rm_bal.ballot.kind(),
                    })
                    .collect(),
            })
            .collect();

        let (txn, decision, subscribers) = if aborted {
            let kind = if deadlock {
                AbortKind::Resubmit
            } else {
                AbortKind::Rerun(bad_reads.to_updates())
            };
            (self.txn.deflated(), Decision::Abort(kind), Vec::new())
        } else {
            let combined = combined.freeze();
            if self.var_ballots.len() > combined.len() {
                return Err(ConsensusError::ShortCombinedClock {
                    txn_id: self.txn_id,
                    vars: self.var_ballots.len(),
                    clock_len: combined.len(),
                });
            }
            (
                self.txn.clone(),
                Decision::Commit { clock: combined },
                commit_subscribers.into_iter().collect(),
            )
        };

        let candidate = Outcome {
            txn_id: self.txn_id,
            id,
            txn,
            decision,
        };

        match &self.outcome {
            // Once decided, late ballots may refresh the per-rm map for
            // the persisted manifest but never change the emitted
            // outcome.
            Some(existing) if **existing == candidate => {}
            Some(existing) => {
                warn!(
                    txn = %self.txn_id,
                    committed = existing.committed(),
                    "late ballots re-derived a different outcome; keeping the decided one"
                );
            }
            None => {
                self.outcome = Some(Arc::new(candidate));
                self.subscribers = subscribers;
            }
        }

        Ok(self
            .outcome
            .clone()
            .map(|outcome| (outcome, self.subscribers.clone())))
    }

    /// Everything needed to rebuild this accumulator from disk. Only
    /// complete variables are emitted; the persistence contract is that
    /// accumulators only go to disk once every variable is complete.
    #[must_use]
    pub fn instances_for_persist(&self) -> Vec<InstancesForVar> {
        self.var_ballots
            .values()
            .filter_map(|vb| {
                vb.result.as_ref().map(|result| InstancesForVar {
                    var: vb.var,
                    instances: vb
                        .rm_to_ballot
                        .iter()
                        .map(|rm_bal| PersistedInstance {
                            rm_id: rm_bal.instance_rm,
                            round_number: rm_bal.round_number,
                            ballot: rm_bal.ballot.clone(),
                        })
                        .collect(),
                    result: result.clone(),
                })
            })
            .collect()
    }
}

impl Status for BallotAccumulator {
    fn status(&self, sc: &mut StatusConsumer) {
        sc.emit(format!("Ballot accumulator for {}", self.txn_id));
        sc.emit(format!("- incomplete var count: {}", self.incomplete_vars));
    }
}
