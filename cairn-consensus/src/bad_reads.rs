//! The bad-reads table: for every variable an aborting transaction read
//! stale, the single best description of what the rerun must repair.

use std::collections::BTreeMap;

use cairn_core::{
    Action, ActionKind, BadReadWitness, TxnId, Update, VarUuid, VectorClock, VectorClockMut,
};

use crate::error::ConsensusError;

/// Map from variable to the best bad-read description seen so far.
#[derive(Debug, Default)]
pub(crate) struct BadReads {
    entries: BTreeMap<VarUuid, BadReadAction>,
}

/// One candidate repair. For a pure read, `txn_id` is the version read
/// and `clock_elem` is one less than the witness's own slot; for any
/// write, they are the witness's own id and slot.
#[derive(Debug)]
struct BadReadAction {
    var: VarUuid,
    txn_id: TxnId,
    clock_elem: u64,
    action: Action,
}

impl BadReads {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fold one bad-read witness into the table.
    pub(crate) fn combine(
        &mut self,
        witness: &BadReadWitness,
        clock: &VectorClock,
    ) -> Result<(), ConsensusError> {
        for action in &witness.actions {
            let var = action.var;
            let clock_elem = clock.at(&var);

            if let Some(existing) = self.entries.get_mut(&var) {
                existing.combine(action, witness.txn_id, clock_elem)?;
            } else if let ActionKind::Read { version } = action.kind {
                let clock_elem = read_elem(clock_elem, var, witness.txn_id)?;
                self.entries.insert(
                    var,
                    BadReadAction {
                        var,
                        txn_id: version,
                        clock_elem,
                        action: action.clone(),
                    },
                );
            } else {
                // Anything that is not a pure read altered the frame txn
                // id, with or without an embedded value, so it is treated
                // as a write.
                self.entries.insert(
                    var,
                    BadReadAction {
                        var,
                        txn_id: witness.txn_id,
                        clock_elem,
                        action: action.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Serialise for a rerun abort: group by transaction, emit one
    /// [`Update`] per group with a clock naming only the involved vars.
    pub(crate) fn to_updates(&self) -> Vec<Update> {
        let mut by_txn: BTreeMap<TxnId, Vec<&BadReadAction>> = BTreeMap::new();
        for bra in self.entries.values() {
            by_txn.entry(bra.txn_id).or_default().push(bra);
        }

        by_txn
            .into_iter()
            .map(|(txn_id, bras)| {
                let mut clock = VectorClockMut::new();
                let actions = bras
                    .into_iter()
                    .map(|bra| {
                        clock.set_max(bra.var, bra.clock_elem);
                        let kind = match &bra.action.kind {
                            ActionKind::Read { .. } | ActionKind::Missing => ActionKind::Missing,
                            ActionKind::Write { value, references }
                            | ActionKind::ReadWrite {
                                value, references, ..
                            }
                            | ActionKind::Create { value, references } => ActionKind::Write {
                                value: value.clone(),
                                references: references.clone(),
                            },
                        };
                        Action { var: bra.var, kind }
                    })
                    .collect();
                Update {
                    txn_id,
                    actions,
                    clock: clock.freeze(),
                }
            })
            .collect()
    }
}

fn read_elem(clock_elem: u64, var: VarUuid, txn_id: TxnId) -> Result<u64, ConsensusError> {
    clock_elem
        .checked_sub(1)
        .ok_or(ConsensusError::BadReadClockUnderflow { var, txn_id })
}

impl BadReadAction {
    fn set(&mut self, action: &Action, txn_id: TxnId, clock_elem: u64) {
        self.txn_id = txn_id;
        self.clock_elem = clock_elem;
        self.action = action.clone();
    }

    /// Order-tiebreak between the existing entry and an incoming
    /// candidate; keeps whichever describes the later state.
    fn combine(
        &mut self,
        new_action: &Action,
        new_txn_id: TxnId,
        clock_elem: u64,
    ) -> Result<(), ConsensusError> {
        match (self.action.is_read_only(), &new_action.kind) {
            (true, ActionKind::Read { version }) => {
                // Both reads: order by (elem, version read).
                let elem = read_elem(clock_elem, self.var, new_txn_id)?;
                if elem > self.clock_elem || (elem == self.clock_elem && *version > self.txn_id) {
                    self.set(new_action, *version, elem);
                }
            }
            (false, ActionKind::Read { version }) => {
                // Existing write, new read. A read of our own write keeps
                // the write: the write carries the value.
                let elem = read_elem(clock_elem, self.var, new_txn_id)?;
                if *version != self.txn_id
                    && (elem > self.clock_elem
                        || (elem == self.clock_elem && *version > self.txn_id))
                {
                    self.set(new_action, *version, elem);
                }
            }
            (true, _) => {
                // Existing read, new write. A write of the version we read
                // is better than the read of it; so is any later write.
                if new_txn_id == self.txn_id || clock_elem > self.clock_elem {
                    self.set(new_action, new_txn_id, clock_elem);
                }
            }
            (false, _) => {
                // Both writes in some form: order by (elem, txn id).
                if clock_elem > self.clock_elem
                    || (clock_elem == self.clock_elem && new_txn_id > self.txn_id)
                {
                    self.set(new_action, new_txn_id, clock_elem);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::RmId;

    fn var(n: u8) -> VarUuid {
        VarUuid::from_bytes([n; 16])
    }

    fn txn(n: u64) -> TxnId {
        TxnId::new(n, 0, RmId(1))
    }

    fn read(v: VarUuid, version: TxnId) -> Action {
        Action {
            var: v,
            kind: ActionKind::Read { version },
        }
    }

    fn write(v: VarUuid) -> Action {
        Action {
            var: v,
            kind: ActionKind::Write {
                value: bytes::Bytes::from_static(b"w"),
                references: vec![],
            },
        }
    }

    fn clock(entries: &[(VarUuid, u64)]) -> VectorClock {
        entries.iter().copied().collect()
    }

    #[test]
    fn read_witness_points_one_version_back() {
        let mut br = BadReads::new();
        let witness = BadReadWitness {
            txn_id: txn(9),
            actions: vec![read(var(1), txn(5))],
        };
        br.combine(&witness, &clock(&[(var(1), 3)])).unwrap();
        let updates = br.to_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].txn_id, txn(5));
        assert_eq!(updates[0].clock.at(&var(1)), 2);
        assert_eq!(updates[0].actions[0].kind, ActionKind::Missing);
    }

    #[test]
    fn read_witness_at_elem_zero_is_a_hard_error() {
        let mut br = BadReads::new();
        let witness = BadReadWitness {
            txn_id: txn(9),
            actions: vec![read(var(1), txn(5))],
        };
        let err = br.combine(&witness, &VectorClock::new()).unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::BadReadClockUnderflow { .. }
        ));
    }

    #[test]
    fn write_of_the_read_version_replaces_the_read() {
        let mut br = BadReads::new();
        br.combine(
            &BadReadWitness {
                txn_id: txn(9),
                actions: vec![read(var(1), txn(5))],
            },
            &clock(&[(var(1), 3)]),
        )
        .unwrap();
        // The write is txn 5 itself, at the same logical slot.
        br.combine(
            &BadReadWitness {
                txn_id: txn(5),
                actions: vec![write(var(1))],
            },
            &clock(&[(var(1), 2)]),
        )
        .unwrap();
        let updates = br.to_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].txn_id, txn(5));
        assert!(matches!(
            updates[0].actions[0].kind,
            ActionKind::Write { .. }
        ));
    }

    #[test]
    fn later_writes_displace_earlier_ones() {
        let mut br = BadReads::new();
        br.combine(
            &BadReadWitness {
                txn_id: txn(5),
                actions: vec![write(var(1))],
            },
            &clock(&[(var(1), 2)]),
        )
        .unwrap();
        br.combine(
            &BadReadWitness {
                txn_id: txn(6),
                actions: vec![write(var(1))],
            },
            &clock(&[(var(1), 3)]),
        )
        .unwrap();
        let updates = br.to_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].txn_id, txn(6));
        assert_eq!(updates[0].clock.at(&var(1)), 3);
    }

    #[test]
    fn read_of_the_recorded_write_is_ignored() {
        let mut br = BadReads::new();
        br.combine(
            &BadReadWitness {
                txn_id: txn(5),
                actions: vec![write(var(1))],
            },
            &clock(&[(var(1), 2)]),
        )
        .unwrap();
        br.combine(
            &BadReadWitness {
                txn_id: txn(8),
                actions: vec![read(var(1), txn(5))],
            },
            &clock(&[(var(1), 3)]),
        )
        .unwrap();
        let updates = br.to_updates();
        assert_eq!(updates[0].txn_id, txn(5));
        assert!(matches!(
            updates[0].actions[0].kind,
            ActionKind::Write { .. }
        ));
    }

    #[test]
    fn updates_group_by_witnessed_txn() {
        let mut br = BadReads::new();
        br.combine(
            &BadReadWitness {
                txn_id: txn(5),
                actions: vec![write(var(1)), write(var(2))],
            },
            &clock(&[(var(1), 2), (var(2), 4)]),
        )
        .unwrap();
        br.combine(
            &BadReadWitness {
                txn_id: txn(6),
                actions: vec![write(var(3))],
            },
            &clock(&[(var(3), 1)]),
        )
        .unwrap();
        let updates = br.to_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].txn_id, txn(5));
        assert_eq!(updates[0].actions.len(), 2);
        assert_eq!(updates[0].clock.at(&var(1)), 2);
        assert_eq!(updates[0].clock.at(&var(2)), 4);
        assert_eq!(updates[1].txn_id, txn(6));
    }
}
