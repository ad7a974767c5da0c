//! One replicated variable.
//!
//! All methods here are entered serially by the shard that owns the
//! variable's uuid. Persistence suspends: the storage write completes on
//! another task and re-enters the shard through an apply-to-self message
//! that revalidates the variable's generation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use cairn_core::{
    ActionKind, ClientId, Positions, Status, StatusConsumer, Txn, TxnId, VarRecord, VarUuid, codec,
};

use crate::error::EngineError;
use crate::frame::{FrameId, FrameStack};
use crate::manager::{LocalAction, OutcomeDelivery, VarEvent, VarMsg};
use crate::poisson::Poisson;
use crate::storage::Storage;

/// The single-slot persistence state: one write in flight at most, and an
/// explicit record of what to do when it lands. A newer write intent
/// overwrites an older one.
enum WriteSlot {
    Idle,
    Busy(AfterWrite),
}

enum AfterWrite {
    MakeInactive,
    Rewrite {
        frame: FrameId,
        txn: Arc<Txn>,
        positions: Option<Positions>,
    },
}

pub(crate) struct Var<S: Storage> {
    uuid: VarUuid,
    positions: Option<Positions>,
    stack: FrameStack,
    cur_frame_on_disk: Option<FrameId>,
    write_slot: WriteSlot,
    subscribers: HashSet<ClientId>,
    pub(crate) poisson: Poisson,
    storage: Arc<S>,
    shard: mpsc::UnboundedSender<VarMsg<S>>,
    pub(crate) generation: u64,
}

impl<S: Storage> Var<S> {
    pub(crate) fn new_fresh(
        uuid: VarUuid,
        storage: Arc<S>,
        shard: mpsc::UnboundedSender<VarMsg<S>>,
        generation: u64,
    ) -> Self {
        Self {
            uuid,
            positions: None,
            stack: FrameStack::genesis(uuid),
            cur_frame_on_disk: None,
            write_slot: WriteSlot::Idle,
            subscribers: HashSet::new(),
            poisson: Poisson::new(),
            storage,
            shard,
            generation,
        }
    }

    pub(crate) fn restored(
        record: VarRecord,
        txn: Arc<Txn>,
        storage: Arc<S>,
        shard: mpsc::UnboundedSender<VarMsg<S>>,
        generation: u64,
    ) -> Self {
        debug!(var = %record.id, txn = %record.write_txn_id, "restored");
        let stack = FrameStack::restored(
            record.id,
            record.write_txn_id,
            txn,
            record.write_txn_clock,
            record.writes_clock,
        );
        let on_disk = stack.cur();
        Self {
            uuid: record.id,
            positions: (!record.positions.is_empty()).then_some(record.positions),
            stack,
            cur_frame_on_disk: Some(on_disk),
            write_slot: WriteSlot::Idle,
            subscribers: HashSet::new(),
            poisson: Poisson::new(),
            storage,
            shard,
            generation,
        }
    }

    pub(crate) fn receive_txn(&mut self, action: LocalAction, now: Instant) {
        debug!(var = %self.uuid, txn = %action.txn_id, "receive txn");
        self.poisson.add(now);

        if action.txn.subscribe {
            self.subscribers.insert(action.txn_id.client_id());
        }

        let subscribe = action.txn.subscribe;
        let ballot = match &action.action.kind {
            ActionKind::Read { version } => self.stack.add_read(action.txn_id, *version, subscribe),
            ActionKind::ReadWrite { version, .. } => {
                self.stack.add_read_write(action.txn_id, *version, subscribe)
            }
            _ => self.stack.add_write(action.txn_id, subscribe),
        };
        let _ = action.events.send(VarEvent::Voted {
            var: self.uuid,
            txn_id: action.txn_id,
            ballot,
        });
    }

    pub(crate) fn receive_txn_outcome(
        &mut self,
        delivery: OutcomeDelivery,
        now: Instant,
    ) -> Result<(), EngineError> {
        debug!(var = %self.uuid, txn = %delivery.txn_id, committed = delivery.committed, "receive outcome");
        self.poisson.add(now);

        let action = delivery
            .txn
            .action_for(&self.uuid)
            .ok_or(EngineError::ActionMissing {
                var: self.uuid,
                txn_id: delivery.txn_id,
            })?
            .clone();

        if !self.stack.has_pending(delivery.txn_id) {
            // Two-phase delivery: the frame state for this action is gone
            // (or never existed on this replica), so this is a learning
            // message.
            let learnt = if !delivery.committed {
                false
            } else if action.is_write() {
                match delivery
                    .clock
                    .as_ref()
                    .and_then(|clock| self.stack.write_learnt(delivery.txn_id, &delivery.txn, clock))
                {
                    Some(frame) => {
                        self.set_cur_frame(frame, &delivery);
                        true
                    }
                    None => false,
                }
            } else {
                self.stack
                    .read_learnt(delivery.txn_id, action.read_version())
            };
            if !learnt {
                self.locally_complete(&delivery);
                self.maybe_make_inactive();
            }
            return Ok(());
        }

        if delivery.committed {
            if action.is_write() {
                if let Some(clock) = &delivery.clock {
                    if let Some(frame) =
                        self.stack.write_committed(delivery.txn_id, &delivery.txn, clock)
                    {
                        self.set_cur_frame(frame, &delivery);
                    }
                }
            } else {
                self.stack.read_committed(delivery.txn_id);
            }
        } else if action.is_write() {
            self.stack.write_aborted(delivery.txn_id);
        } else {
            self.stack.read_aborted(delivery.txn_id);
        }

        self.locally_complete(&delivery);
        self.maybe_make_inactive();
        Ok(())
    }

    fn locally_complete(&self, delivery: &OutcomeDelivery) {
        if let Some(events) = &delivery.events {
            let _ = events.send(VarEvent::LocallyComplete {
                var: self.uuid,
                txn_id: delivery.txn_id,
            });
        }
    }

    fn set_cur_frame(&mut self, frame: FrameId, delivery: &OutcomeDelivery) {
        debug!(var = %self.uuid, txn = %delivery.txn_id, "set current frame");
        if let Some(positions) = &delivery.positions {
            self.positions = Some(positions.clone());
        }
        self.maybe_write_frame(frame, delivery.txn.clone(), delivery.positions.clone());
    }

    /// Strict one-in-flight persistence. While a write is in flight the
    /// latest intent waits in the slot; when the write lands the stored
    /// continuation runs on this variable's shard.
    fn maybe_write_frame(&mut self, frame: FrameId, txn: Arc<Txn>, positions: Option<Positions>) {
        if let WriteSlot::Busy(_) = self.write_slot {
            self.write_slot = WriteSlot::Busy(AfterWrite::Rewrite {
                frame,
                txn,
                positions,
            });
            return;
        }

        let Some(write_txn_id) = self.stack.frame_txn_id(frame) else {
            return;
        };
        self.write_slot = WriteSlot::Busy(AfterWrite::MakeInactive);

        let record = VarRecord {
            id: self.uuid,
            positions: self.positions.clone().unwrap_or_default(),
            write_txn_id,
            write_txn_clock: self.stack.frame_txn_clock(frame).clone(),
            writes_clock: self.stack.frame_writes_clock(frame).clone(),
        };
        let (var_bytes, txn_bytes) = match (codec::encode(&record), codec::encode(txn.as_ref())) {
            (Ok(var_bytes), Ok(txn_bytes)) => (var_bytes, txn_bytes),
            (Err(e), _) | (_, Err(e)) => {
                let _ = self.shard.send(VarMsg::StorageFatal {
                    var: self.uuid,
                    error: e.into(),
                });
                return;
            }
        };
        let previous = self
            .cur_frame_on_disk
            .and_then(|on_disk| self.stack.frame_txn_id(on_disk))
            .filter(|previous| *previous != write_txn_id);

        let uuid = self.uuid;
        let generation = self.generation;
        let shard = self.shard.clone();
        let future = self.storage.read_write(move |batch| {
            batch.put_txn(write_txn_id, txn_bytes);
            batch.put_var(uuid, var_bytes);
            if let Some(previous) = previous {
                batch.delete_txn(previous);
            }
        });
        tokio::spawn(async move {
            match future.await {
                Ok(()) => {
                    let _ = shard.send(VarMsg::Apply {
                        var: uuid,
                        generation,
                        thunk: Box::new(move |var| var.frame_written(frame, write_txn_id)),
                    });
                }
                Err(error) => {
                    let _ = shard.send(VarMsg::StorageFatal {
                        var: uuid,
                        error: error.into(),
                    });
                }
            }
        });
    }

    fn frame_written(&mut self, frame: FrameId, write_txn_id: TxnId) {
        debug!(var = %self.uuid, txn = %write_txn_id, "written to disk");
        self.cur_frame_on_disk = Some(frame);
        self.stack.mark_descendents_on_disk(frame);
        match std::mem::replace(&mut self.write_slot, WriteSlot::Idle) {
            WriteSlot::Busy(AfterWrite::Rewrite {
                frame,
                txn,
                positions,
            }) => self.maybe_write_frame(frame, txn, positions),
            WriteSlot::Busy(AfterWrite::MakeInactive) | WriteSlot::Idle => {
                self.maybe_make_inactive();
            }
        }
    }

    pub(crate) fn txn_globally_complete(
        &mut self,
        txn_id: TxnId,
        now: Instant,
    ) -> Result<(), EngineError> {
        debug!(var = %self.uuid, txn = %txn_id, "txn globally complete");
        self.poisson.add(now);
        if self.stack.globally_complete(txn_id) {
            self.maybe_make_inactive();
            Ok(())
        } else {
            Err(EngineError::UnknownTxn {
                var: self.uuid,
                txn_id,
            })
        }
    }

    pub(crate) fn maybe_make_inactive(&self) {
        if self.is_idle() {
            let _ = self.shard.send(VarMsg::VarIdle {
                var: self.uuid,
                generation: self.generation,
            });
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.subscribers.is_empty()
            && matches!(self.write_slot, WriteSlot::Idle)
            && self.stack.cur_is_idle()
    }

    pub(crate) fn is_on_disk(&self) -> bool {
        matches!(self.write_slot, WriteSlot::Idle)
            && self.cur_frame_on_disk == Some(self.stack.cur())
            && self.stack.cur_is_empty()
    }
}

impl<S: Storage> Status for Var<S> {
    fn status(&self, sc: &mut StatusConsumer) {
        sc.emit(format!("{}", self.uuid));
        match &self.positions {
            None => sc.emit("- positions: unknown"),
            Some(positions) => sc.emit(format!("- positions: {:?}", positions.0)),
        }
        sc.emit(format!(
            "- frame: number {} ({} deep, txn {:?})",
            self.stack.frame_number(),
            self.stack.depth(),
            self.stack.frame_txn_id(self.stack.cur()),
        ));
        sc.emit(format!("- subscribers: {}", self.subscribers.len()));
        sc.emit(format!(
            "- arrival rate: {:.3}/s",
            self.poisson.rate(Instant::now())
        ));
        sc.emit(format!("- idle: {}", self.is_idle()));
        sc.emit(format!("- on disk: {}", self.is_on_disk()));
    }
}
