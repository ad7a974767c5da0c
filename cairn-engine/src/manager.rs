//! The variable manager: a sharded executor keyed by variable uuid.
//!
//! Each shard is one task owning a map of variables; it drains its queue
//! serially, so per-variable method entry is serialised by construction.
//! Completion callbacks from storage re-enter through [`VarMsg::Apply`]
//! with the generation they were created under: a mismatch means the
//! variable was evicted (and possibly recreated) in the meantime, and the
//! thunk degrades to an inactivity check or is dropped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use cairn_core::{
    Action, Ballot, Positions, Status, StatusConsumer, Txn, TxnId, VarRecord, VarUuid, VectorClock,
    codec,
};

use crate::error::EngineError;
use crate::storage::Storage;
use crate::var::Var;

/// An idle variable is only evicted when a fresh arrival within this
/// horizon looks unlikely.
const EVICTION_HORIZON: Duration = Duration::from_millis(500);
const EVICTION_THRESHOLD: f64 = 0.5;

/// What the engine reports back toward the submitter-side machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarEvent {
    Voted {
        var: VarUuid,
        txn_id: TxnId,
        ballot: Ballot,
    },
    LocallyComplete {
        var: VarUuid,
        txn_id: TxnId,
    },
}

/// One transaction's action on one variable, as dispatched to the
/// variable's shard.
#[derive(Debug)]
pub struct LocalAction {
    pub txn_id: TxnId,
    pub txn: Arc<Txn>,
    /// The action naming this variable.
    pub action: Action,
    pub events: mpsc::UnboundedSender<VarEvent>,
}

/// A transaction outcome as delivered to one variable.
#[derive(Debug)]
pub struct OutcomeDelivery {
    pub txn_id: TxnId,
    pub txn: Arc<Txn>,
    pub committed: bool,
    /// The combined commit clock; absent on abort.
    pub clock: Option<VectorClock>,
    pub positions: Option<Positions>,
    /// Present when this replica voted and owes completion events.
    pub events: Option<mpsc::UnboundedSender<VarEvent>>,
}

pub(crate) type Thunk<S> = Box<dyn FnOnce(&mut Var<S>) + Send>;

pub(crate) enum VarMsg<S: Storage> {
    ReceiveTxn(LocalAction),
    ReceiveOutcome {
        var: VarUuid,
        delivery: OutcomeDelivery,
    },
    GloballyComplete {
        var: VarUuid,
        txn_id: TxnId,
    },
    Apply {
        var: VarUuid,
        generation: u64,
        thunk: Thunk<S>,
    },
    VarIdle {
        var: VarUuid,
        generation: u64,
    },
    StorageFatal {
        var: VarUuid,
        error: EngineError,
    },
    Status {
        sc: StatusConsumer,
        reply: oneshot::Sender<StatusConsumer>,
    },
}

struct VarShard<S: Storage> {
    storage: Arc<S>,
    vars: HashMap<VarUuid, Var<S>>,
    self_tx: mpsc::UnboundedSender<VarMsg<S>>,
    next_generation: u64,
    cancel: CancellationToken,
}

impl<S: Storage> VarShard<S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<VarMsg<S>>) {
        loop {
            let msg = tokio::select! {
                () = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(e) = self.handle(msg) {
                // Losing a commit is worse than stopping: storage and
                // protocol failures take the whole dispatcher down.
                error!(error = %e, "variable shard failed; cancelling dispatcher");
                self.cancel.cancel();
                break;
            }
        }
    }

    fn handle(&mut self, msg: VarMsg<S>) -> Result<(), EngineError> {
        match msg {
            VarMsg::ReceiveTxn(action) => {
                let var = self.var_mut(action.action.var)?;
                var.receive_txn(action, Instant::now());
                Ok(())
            }
            VarMsg::ReceiveOutcome { var, delivery } => self
                .var_mut(var)?
                .receive_txn_outcome(delivery, Instant::now()),
            VarMsg::GloballyComplete { var, txn_id } => match self.vars.get_mut(&var) {
                Some(v) => v.txn_globally_complete(txn_id, Instant::now()),
                None => Err(EngineError::UnknownTxn { var, txn_id }),
            },
            VarMsg::Apply {
                var,
                generation,
                thunk,
            } => {
                match self.vars.get_mut(&var) {
                    Some(v) if v.generation == generation => thunk(v),
                    Some(v) => {
                        // The instance this continuation targeted is gone.
                        debug!(var = %var, "stale continuation; checking inactivity instead");
                        v.maybe_make_inactive();
                    }
                    None => debug!(var = %var, "continuation for evicted variable dropped"),
                }
                Ok(())
            }
            VarMsg::VarIdle { var, generation } => {
                if let Some(v) = self.vars.get(&var) {
                    if v.generation == generation
                        && v.is_idle()
                        && v.is_on_disk()
                        && v.poisson.p_arrival_before(EVICTION_HORIZON, Instant::now())
                            < EVICTION_THRESHOLD
                    {
                        debug!(var = %var, "evicting idle variable");
                        self.vars.remove(&var);
                    }
                }
                Ok(())
            }
            VarMsg::StorageFatal { var, error } => {
                error!(var = %var, error = %error, "fatal storage failure");
                Err(error)
            }
            VarMsg::Status { mut sc, reply } => {
                for v in self.vars.values() {
                    v.status(&mut sc);
                }
                let _ = reply.send(sc);
                Ok(())
            }
        }
    }

    fn var_mut(&mut self, uuid: VarUuid) -> Result<&mut Var<S>, EngineError> {
        match self.vars.entry(uuid) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let generation = self.next_generation;
                self.next_generation += 1;
                let var = Self::load_or_create(&self.storage, &self.self_tx, uuid, generation)?;
                Ok(entry.insert(var))
            }
        }
    }

    /// Restore from the Var record and its frame transaction when
    /// present, else start a fresh variable.
    fn load_or_create(
        storage: &Arc<S>,
        self_tx: &mpsc::UnboundedSender<VarMsg<S>>,
        uuid: VarUuid,
        generation: u64,
    ) -> Result<Var<S>, EngineError> {
        let loaded = storage.snapshot(|snap| {
            snap.var_record(&uuid).map(|record_bytes| {
                let record: VarRecord = codec::decode(&record_bytes)?;
                let txn_bytes = snap.txn_bytes(&record.write_txn_id).ok_or(
                    EngineError::MissingTxnBytes {
                        txn_id: record.write_txn_id,
                    },
                )?;
                let txn: Txn = codec::decode(&txn_bytes)?;
                Ok::<_, EngineError>((record, Arc::new(txn)))
            })
        })?;
        match loaded {
            Some(result) => {
                let (record, txn) = result?;
                Ok(Var::restored(
                    record,
                    txn,
                    storage.clone(),
                    self_tx.clone(),
                    generation,
                ))
            }
            None => Ok(Var::new_fresh(
                uuid,
                storage.clone(),
                self_tx.clone(),
                generation,
            )),
        }
    }
}

/// The engine's front door: routes every message for a variable to the
/// one shard that owns it.
pub struct VarDispatcher<S: Storage> {
    shards: Vec<mpsc::UnboundedSender<VarMsg<S>>>,
    hasher: RandomState,
    cancel: CancellationToken,
}

impl<S: Storage> VarDispatcher<S> {
    /// Spawns the shard tasks; needs a tokio runtime.
    #[must_use]
    pub fn new(storage: Arc<S>, num_shards: usize) -> Self {
        let cancel = CancellationToken::new();
        let shards = (0..num_shards.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                let shard = VarShard {
                    storage: storage.clone(),
                    vars: HashMap::new(),
                    self_tx: tx.clone(),
                    next_generation: 0,
                    cancel: cancel.clone(),
                };
                tokio::spawn(shard.run(rx));
                tx
            })
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
            cancel,
        }
    }

    fn shard_for(&self, var: &VarUuid) -> &mpsc::UnboundedSender<VarMsg<S>> {
        let hash = self.hasher.hash_one(var);
        let index = usize::try_from(hash).unwrap_or(usize::MAX) % self.shards.len();
        &self.shards[index]
    }

    fn send(&self, var: &VarUuid, msg: VarMsg<S>) -> Result<(), EngineError> {
        self.shard_for(var)
            .send(msg)
            .map_err(|_| EngineError::ShuttingDown)
    }

    pub fn receive_txn(&self, action: LocalAction) -> Result<(), EngineError> {
        let var = action.action.var;
        self.send(&var, VarMsg::ReceiveTxn(action))
    }

    pub fn receive_outcome(
        &self,
        var: VarUuid,
        delivery: OutcomeDelivery,
    ) -> Result<(), EngineError> {
        self.send(&var, VarMsg::ReceiveOutcome { var, delivery })
    }

    pub fn txn_globally_complete(&self, var: VarUuid, txn_id: TxnId) -> Result<(), EngineError> {
        self.send(&var, VarMsg::GloballyComplete { var, txn_id })
    }

    /// Status of every live variable, across all shards.
    pub async fn status(&self) -> StatusConsumer {
        let mut sc = StatusConsumer::new();
        sc.emit("variables:");
        let replies: Vec<_> = self
            .shards
            .iter()
            .filter_map(|shard| {
                let (reply, rx) = oneshot::channel();
                shard
                    .send(VarMsg::Status {
                        sc: sc.fork(),
                        reply,
                    })
                    .ok()
                    .map(|()| rx)
            })
            .collect();
        for child in join_all(replies).await.into_iter().flatten() {
            sc.join(child);
        }
        sc
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
