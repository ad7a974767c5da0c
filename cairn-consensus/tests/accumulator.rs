//! Accumulator behaviour over whole transactions: quorum gating, outcome
//! classification, late ballots and persistence.

use std::sync::Arc;

use bytes::Bytes;
use cairn_consensus::{BallotAccumulator, ConsensusError};
use cairn_core::{
    AbortKind, Action, ActionKind, Allocation, BadReadWitness, Ballot, BootCount, Decision,
    Outcome, RmId, Txn, TxnId, VarUuid, VectorClock, VoteKind,
};

fn var(n: u8) -> VarUuid {
    VarUuid::from_bytes([n; 16])
}

fn txn_id(n: u64) -> TxnId {
    TxnId::new(n, 0, RmId(1))
}

fn clock(entries: &[(VarUuid, u64)]) -> VectorClock {
    entries.iter().copied().collect()
}

fn write_action(v: VarUuid) -> Action {
    Action {
        var: v,
        kind: ActionKind::Write {
            value: Bytes::from_static(b"payload"),
            references: vec![],
        },
    }
}

/// A txn over the given vars, allocated to the given rms, every rm
/// naming every action.
fn txn_over(vars: &[VarUuid], active: &[RmId], passive: &[RmId], f_inc: u8) -> Txn {
    let actions = vars.iter().copied().map(write_action).collect::<Vec<_>>();
    let indices = (0..vars.len()).map(|i| u16::try_from(i).unwrap()).collect::<Vec<_>>();
    let mut allocations = Vec::new();
    for rm in active {
        allocations.push(Allocation {
            rm_id: *rm,
            active: BootCount(1),
            action_indices: indices.clone(),
        });
    }
    for rm in passive {
        allocations.push(Allocation {
            rm_id: *rm,
            active: BootCount::PASSIVE,
            action_indices: indices.clone(),
        });
    }
    Txn {
        submitter: RmId(1),
        submitter_boot_count: BootCount(1),
        actions,
        allocations,
        f_inc,
        topology_version: 0,
        subscribe: false,
    }
}

fn witness(n: u64, v: VarUuid) -> BadReadWitness {
    BadReadWitness {
        txn_id: txn_id(n),
        actions: vec![Action {
            var: v,
            kind: ActionKind::Missing,
        }],
    }
}

#[test]
fn two_rm_commit_merges_clocks_and_subscribers() {
    let (a, b) = (var(1), var(2));
    let (rm1, rm2) = (RmId(1), RmId(2));
    let txn = txn_over(&[a, b], &[rm1, rm2], &[], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    let full = clock(&[(a, 3), (b, 1)]);
    let other = clock(&[(a, 2), (b, 2)]);
    assert!(ba
        .ballot_received(rm1, 0, Ballot::commit(a, full.clone(), vec![txn_id(10)]), &txn)
        .unwrap()
        .is_none());
    assert!(ba
        .ballot_received(rm1, 0, Ballot::commit(b, full.clone(), vec![]), &txn)
        .unwrap()
        .is_none());
    assert!(ba
        .ballot_received(rm2, 0, Ballot::commit(a, other.clone(), vec![txn_id(11)]), &txn)
        .unwrap()
        .is_none());
    let (outcome, subscribers) = ba
        .ballot_received(rm2, 0, Ballot::commit(b, other, vec![txn_id(10)]), &txn)
        .unwrap()
        .expect("quorum for every var");

    let Decision::Commit { clock: combined } = &outcome.decision else {
        panic!("expected commit, got {:?}", outcome.decision);
    };
    assert_eq!(combined.at(&a), 3);
    assert_eq!(combined.at(&b), 2);
    assert_eq!(subscribers, vec![txn_id(10), txn_id(11)]);
    assert_eq!(outcome.txn, txn);

    // Manifest: vars sorted, instances in rm order.
    assert_eq!(outcome.id.len(), 2);
    assert!(outcome.id[0].var < outcome.id[1].var);
    for outcome_var in &outcome.id {
        let rms = outcome_var
            .accepted_instances
            .iter()
            .map(|instance| instance.rm_id)
            .collect::<Vec<_>>();
        assert_eq!(rms, vec![rm1, rm2]);
        assert!(outcome_var
            .accepted_instances
            .iter()
            .all(|instance| instance.vote == VoteKind::Commit));
    }
}

#[test]
fn commit_clock_covers_every_var_at_least_at_its_ballot_max() {
    let (a, b) = (var(1), var(2));
    let (rm1, rm2) = (RmId(1), RmId(2));
    let txn = txn_over(&[a, b], &[rm1, rm2], &[], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    let clocks = [clock(&[(a, 5), (b, 2)]), clock(&[(a, 1), (b, 7)])];
    for (rm, ballot_clock) in [rm1, rm2].into_iter().zip(&clocks) {
        for v in [a, b] {
            ba.ballot_received(rm, 0, Ballot::commit(v, ballot_clock.clone(), vec![]), &txn)
                .unwrap();
        }
    }
    let (outcome, _) = ba.determine_outcome().unwrap().unwrap();
    let combined = outcome.commit_clock().unwrap();
    assert!(combined.len() >= 2);
    for v in [a, b] {
        let max = clocks.iter().map(|c| c.at(&v)).max().unwrap();
        assert!(combined.at(&v) >= max);
    }
}

#[test]
fn synthetic_deadlock_aborts_with_resubmit() {
    let a = var(1);
    let (rm1, rm2) = (RmId(1), RmId(2));
    let txn = txn_over(&[a], &[rm1, rm2], &[], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    ba.ballot_received(rm1, 0, Ballot::commit(a, clock(&[(a, 3)]), vec![txn_id(10)]), &txn)
        .unwrap();
    let (outcome, subscribers) = ba
        .ballot_received(rm2, 0, Ballot::deadlock(a, VectorClock::new()), &txn)
        .unwrap()
        .expect("complete");

    assert_eq!(outcome.decision, Decision::Abort(AbortKind::Resubmit));
    assert!(subscribers.is_empty());
    // Abort outcomes carry the deflated body.
    assert_eq!(outcome.txn, txn.deflated());
}

#[test]
fn bad_read_aborts_with_rerun_updates() {
    let a = var(1);
    let (rm1, rm2) = (RmId(1), RmId(2));
    let txn = txn_over(&[a], &[rm1, rm2], &[], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    ba.ballot_received(rm1, 0, Ballot::commit(a, clock(&[(a, 3)]), vec![]), &txn)
        .unwrap();
    let (outcome, _) = ba
        .ballot_received(
            rm2,
            0,
            Ballot::bad_read(a, clock(&[(a, 4)]), witness(42, a)),
            &txn,
        )
        .unwrap()
        .expect("complete");

    let Decision::Abort(AbortKind::Rerun(updates)) = &outcome.decision else {
        panic!("expected rerun, got {:?}", outcome.decision);
    };
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].txn_id, txn_id(42));
    assert_eq!(updates[0].clock.at(&a), 4);
}

#[test]
fn single_rm_quorum_is_immediate() {
    let a = var(1);
    let rm1 = RmId(1);
    let txn = txn_over(&[a], &[rm1], &[], 1);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    let decided = ba
        .ballot_received(rm1, 0, Ballot::commit(a, clock(&[(a, 1)]), vec![]), &txn)
        .unwrap();
    assert!(decided.is_some());
}

#[test]
fn passive_allocations_do_not_count_as_voters() {
    let a = var(1);
    let (rm1, rm2, rm3) = (RmId(1), RmId(2), RmId(3));
    let txn = txn_over(&[a], &[rm1, rm2], &[rm3], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    ba.ballot_received(rm1, 0, Ballot::commit(a, clock(&[(a, 1)]), vec![]), &txn)
        .unwrap();
    let decided = ba
        .ballot_received(rm2, 0, Ballot::commit(a, clock(&[(a, 1)]), vec![]), &txn)
        .unwrap();
    assert!(decided.is_some(), "two active voters are the whole quorum");
}

#[test]
fn var_with_no_active_allocation_never_completes() {
    let a = var(1);
    let rm1 = RmId(1);
    // Only a passive allocation names the action: voters == 0.
    let txn = txn_over(&[a], &[], &[rm1], 1);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());
    assert_eq!(ba.incomplete_vars(), 1);

    for round in 0..3 {
        let decided = ba
            .ballot_received(rm1, round, Ballot::commit(a, clock(&[(a, 1)]), vec![]), &txn)
            .unwrap();
        assert!(decided.is_none());
    }
    assert_eq!(ba.incomplete_vars(), 1);
}

#[test]
fn unknown_var_is_a_protocol_violation() {
    let a = var(1);
    let rm1 = RmId(1);
    let txn = txn_over(&[a], &[rm1], &[], 1);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());
    let err = ba
        .ballot_received(rm1, 0, Ballot::commit(var(9), VectorClock::new(), vec![]), &txn)
        .unwrap_err();
    assert!(matches!(err, ConsensusError::UnknownVar { .. }));
}

#[test]
fn repeated_determination_returns_the_same_outcome_object() {
    let a = var(1);
    let rm1 = RmId(1);
    let txn = txn_over(&[a], &[rm1], &[], 1);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    let (first, _) = ba
        .ballot_received(rm1, 0, Ballot::commit(a, clock(&[(a, 1)]), vec![]), &txn)
        .unwrap()
        .unwrap();
    let (second, _) = ba.determine_outcome().unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn late_ballot_after_quorum_leaves_the_outcome_unchanged() {
    let a = var(1);
    let (rm1, rm2, rm3) = (RmId(1), RmId(2), RmId(3));
    let txn = txn_over(&[a], &[rm1, rm2], &[rm3], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    ba.ballot_received(rm1, 0, Ballot::commit(a, clock(&[(a, 2)]), vec![]), &txn)
        .unwrap();
    let (first, _) = ba
        .ballot_received(rm2, 0, Ballot::commit(a, clock(&[(a, 2)]), vec![]), &txn)
        .unwrap()
        .unwrap();

    // A higher-round ballot from a non-quorum rm refines the per-rm map
    // but must not contradict the decided outcome.
    let (second, _) = ba
        .ballot_received(rm3, 1, Ballot::commit(a, clock(&[(a, 2)]), vec![]), &txn)
        .unwrap()
        .unwrap();
    assert_eq!(*first, *second);

    // Even a contradictory late ballot cannot flip the decision.
    let (third, _) = ba
        .ballot_received(rm3, 2, Ballot::deadlock(a, VectorClock::new()), &txn)
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&first, &third));
    assert!(third.committed());
}

#[test]
fn same_rm_resubmission_overwrites_its_ballot() {
    let a = var(1);
    let (rm1, rm2) = (RmId(1), RmId(2));
    let txn = txn_over(&[a], &[rm1, rm2], &[], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    // rm1 votes twice before quorum: only the later round counts.
    ba.ballot_received(rm1, 0, Ballot::commit(a, clock(&[(a, 1)]), vec![]), &txn)
        .unwrap();
    ba.ballot_received(
        rm1,
        1,
        Ballot::bad_read(a, clock(&[(a, 2)]), witness(7, a)),
        &txn,
    )
    .unwrap();
    let (outcome, _) = ba
        .ballot_received(rm2, 0, Ballot::commit(a, clock(&[(a, 1)]), vec![]), &txn)
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome.decision,
        Decision::Abort(AbortKind::Rerun(_))
    ));
}

#[test]
fn persist_then_restore_reduces_to_the_original_outcome() {
    let (a, b) = (var(1), var(2));
    let (rm1, rm2) = (RmId(1), RmId(2));
    let txn = txn_over(&[a, b], &[rm1, rm2], &[], 2);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());

    for rm in [rm1, rm2] {
        for v in [a, b] {
            ba.ballot_received(
                rm,
                0,
                Ballot::commit(v, clock(&[(a, 2), (b, 3)]), vec![txn_id(10)]),
                &txn,
            )
            .unwrap();
        }
    }
    let (outcome, subscribers) = ba.determine_outcome().unwrap().unwrap();

    let instances = ba.instances_for_persist();
    assert_eq!(instances.len(), 2);

    let mut restored = BallotAccumulator::from_persisted(
        txn_id(1),
        txn.clone(),
        Outcome::clone(&outcome),
        subscribers.clone(),
        instances,
    )
    .unwrap();
    assert_eq!(restored.incomplete_vars(), 0);
    let (re_outcome, re_subscribers) = restored.determine_outcome().unwrap().unwrap();
    assert_eq!(*re_outcome, *outcome);
    assert_eq!(re_subscribers, subscribers);
}

#[test]
fn restore_with_missing_instances_is_rejected() {
    let (a, b) = (var(1), var(2));
    let rm1 = RmId(1);
    let txn = txn_over(&[a, b], &[rm1], &[], 1);
    let mut ba = BallotAccumulator::new(txn_id(1), txn.clone());
    for v in [a, b] {
        ba.ballot_received(rm1, 0, Ballot::commit(v, clock(&[(a, 1), (b, 1)]), vec![]), &txn)
            .unwrap();
    }
    let (outcome, subscribers) = ba.determine_outcome().unwrap().unwrap();
    let mut instances = ba.instances_for_persist();
    instances.pop();

    let err = BallotAccumulator::from_persisted(
        txn_id(1),
        txn,
        Outcome::clone(&outcome),
        subscribers,
        instances,
    )
    .unwrap_err();
    assert!(matches!(err, ConsensusError::InstanceCountMismatch { .. }));
}
