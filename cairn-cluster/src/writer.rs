//! The topology writer: a one-shot state machine that commits the
//! initial or updated cluster membership into the topology variable,
//! through the same transaction path as any other write.

use std::collections::HashMap;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use cairn_core::{
    AbortKind, Action, ActionKind, Allocation, BootCount, Decision, Positions, ROOT_VAR_UUID,
    RmId, Status, StatusConsumer, TOPOLOGY_VAR_UUID, Txn, VarIdPos,
};

use crate::connection::{
    ConnectionEvent, ConnectionPublisher, Conns, MembershipSubscriber, SubscriberAction,
};
use crate::submitter::TxnSubmitter;
use crate::topology::{RootVar, Topology};

/// How a topology write run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// Committed (by us, or by a peer whose committed topology already
    /// includes us).
    Written(Topology),
    /// Aborted; register a fresh writer with this payload.
    Restart(Topology),
}

#[derive(Debug)]
pub enum TopologyError {
    Serialize,
    Deserialize,
    Submit,
    UnexpectedUpdateCount(usize),
    UnexpectedActionCount(usize),
    MissingTopologyAction,
    NonWriteTopologyAction,
    WrongReferenceCount(usize),
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyError::Serialize => write!(f, "failed to serialise topology"),
            TopologyError::Deserialize => write!(f, "failed to deserialise topology"),
            TopologyError::Submit => write!(f, "topology transaction submission failed"),
            TopologyError::UnexpectedUpdateCount(n) => {
                write!(f, "topology readwrite gave {n} updates (1 expected)")
            }
            TopologyError::UnexpectedActionCount(n) => {
                write!(f, "topology readwrite gave {n} update actions (1 or 2 expected)")
            }
            TopologyError::MissingTopologyAction => {
                write!(f, "no action for the topology variable in the rerun update")
            }
            TopologyError::NonWriteTopologyAction => {
                write!(f, "topology readwrite gave a non-write action")
            }
            TopologyError::WrongReferenceCount(n) => {
                write!(f, "topology write carried {n} references (at most 1 expected)")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Subscribes to membership events and, once enough of the active set is
/// reachable, runs the topology transaction in its own task.
pub struct TopologyWriter<S: TxnSubmitter> {
    to_write: Topology,
    submitter: S,
    events: mpsc::UnboundedSender<TopologyEvent>,
    finished: bool,
}

impl<S: TxnSubmitter> TopologyWriter<S> {
    #[must_use]
    pub fn new(
        topology: Topology,
        submitter: S,
        events: mpsc::UnboundedSender<TopologyEvent>,
    ) -> Self {
        Self {
            to_write: topology,
            submitter,
            events,
            finished: false,
        }
    }

    /// Register a writer with the publisher. Restart events are handled
    /// by registering again with the event's payload.
    pub fn register(
        publisher: &mut ConnectionPublisher,
        topology: Topology,
        submitter: S,
        events: mpsc::UnboundedSender<TopologyEvent>,
    ) {
        publisher.add_subscriber(Box::new(Self::new(topology, submitter, events)));
    }

    fn maybe_start_write(&mut self, conns: &Conns) -> SubscriberAction {
        if self.finished {
            return SubscriberAction::Deregister;
        }
        let mut to_write = self.to_write.clone();
        let f_inc = to_write.f_inc();
        let self_rm = self.submitter.rm_id();

        let (active, passive) = if to_write.all_rms.is_empty() {
            // Bootstrap from empty: the connected set becomes the
            // membership, all active.
            if conns.len() < f_inc {
                return SubscriberAction::Retain;
            }
            let mut rms: Vec<RmId> = conns.keys().copied().collect();
            rms.sort_unstable();
            to_write.all_rms.clone_from(&rms);
            (rms, Vec::new())
        } else {
            let found_self = to_write.contains(self_rm);
            if !found_self {
                to_write.all_rms.push(self_rm);
            }
            let mut active = Vec::with_capacity(f_inc);
            let mut passive = Vec::new();
            // Prefer self active when self is already in the topology.
            if found_self {
                active.push(self_rm);
            } else {
                passive.push(self_rm);
            }
            for rm in &to_write.all_rms {
                if *rm == self_rm {
                    continue;
                }
                if conns.contains_key(rm) && active.len() < f_inc {
                    active.push(*rm);
                } else {
                    passive.push(*rm);
                }
            }
            if active.len() < f_inc {
                return SubscriberAction::Retain;
            }
            (active, passive)
        };

        self.finished = true;
        debug!(?active, ?passive, "starting topology write");
        let boot_counts: HashMap<RmId, BootCount> = conns
            .iter()
            .map(|(rm, conn)| (*rm, conn.boot_count()))
            .collect();
        let submitter = self.submitter.clone();
        let events = self.events.clone();
        // We are on the connection manager's path here; the write runs in
        // its own task.
        tokio::spawn(async move {
            let run = run_write(to_write, f_inc, active, passive, boot_counts, submitter, events);
            if let Err(report) = run.await {
                error!(error = ?report, "topology write failed");
            }
        });
        SubscriberAction::Deregister
    }
}

impl<S: TxnSubmitter> Status for TopologyWriter<S> {
    fn status(&self, sc: &mut StatusConsumer) {
        sc.emit(format!(
            "topology writer: version {}, hosts {:?}",
            self.to_write.version, self.to_write.hosts
        ));
        sc.emit(format!("- members: {:?}", self.to_write.all_rms));
        sc.emit(format!("- finished: {}", self.finished));
    }
}

impl<S: TxnSubmitter> MembershipSubscriber for TopologyWriter<S> {
    fn on_event(&mut self, event: ConnectionEvent<'_>) -> SubscriberAction {
        match event {
            ConnectionEvent::Connected(conns)
            | ConnectionEvent::Established { conns, .. } => self.maybe_start_write(conns),
            ConnectionEvent::Lost { .. } => SubscriberAction::Retain,
        }
    }
}

fn build_txn<S: TxnSubmitter>(
    submitter: &S,
    actions: Vec<Action>,
    f_inc: usize,
    active: &[RmId],
    passive: &[RmId],
    boot_counts: &HashMap<RmId, BootCount>,
    topology_version: u32,
) -> Txn {
    let indices: Vec<u16> = (0..actions.len())
        .map(|i| u16::try_from(i).unwrap_or(u16::MAX))
        .collect();
    let mut allocations = Vec::with_capacity(active.len() + passive.len());
    for rm in active {
        let boot = if *rm == submitter.rm_id() {
            submitter.boot_count()
        } else {
            boot_counts.get(rm).copied().unwrap_or(BootCount(1))
        };
        allocations.push(Allocation {
            rm_id: *rm,
            active: boot,
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
        submitter: submitter.rm_id(),
        submitter_boot_count: submitter.boot_count(),
        actions,
        allocations,
        f_inc: u8::try_from(f_inc).unwrap_or(u8::MAX),
        topology_version,
        subscribe: false,
    }
}

/// Create the root object when the topology has none yet. An abort means
/// a peer created it first; either way it exists afterwards.
async fn ensure_root<S: TxnSubmitter>(
    topology: &mut Topology,
    f_inc: usize,
    active: &[RmId],
    passive: &[RmId],
    boot_counts: &HashMap<RmId, BootCount>,
    submitter: &S,
) -> Result<(), Report<TopologyError>> {
    if topology.root.uuid.is_some() {
        return Ok(());
    }
    let positions = Positions(
        (0..topology.all_rms.len())
            .map(|i| u8::try_from(i).unwrap_or(u8::MAX))
            .collect(),
    );
    let action = Action {
        var: ROOT_VAR_UUID,
        kind: ActionKind::Create {
            value: Bytes::new(),
            references: vec![],
        },
    };
    let txn = build_txn(
        submitter,
        vec![action],
        f_inc,
        active,
        passive,
        boot_counts,
        topology.version,
    );
    let outcome = submitter
        .run_transaction(txn, active)
        .await
        .change_context(TopologyError::Submit)?;
    debug!(committed = outcome.committed(), "root creation ran");
    topology.root = RootVar {
        uuid: Some(ROOT_VAR_UUID),
        positions: Some(positions),
    };
    Ok(())
}

async fn run_write<S: TxnSubmitter>(
    mut topology: Topology,
    f_inc: usize,
    active: Vec<RmId>,
    passive: Vec<RmId>,
    boot_counts: HashMap<RmId, BootCount>,
    submitter: S,
    events: mpsc::UnboundedSender<TopologyEvent>,
) -> Result<(), Report<TopologyError>> {
    ensure_root(&mut topology, f_inc, &active, &passive, &boot_counts, &submitter).await?;
    let original = topology.clone();

    let value = topology
        .serialize()
        .change_context(TopologyError::Serialize)?;
    let references = topology
        .root
        .uuid
        .map(|id| VarIdPos {
            id,
            positions: topology.root.positions.clone().unwrap_or_default(),
        })
        .into_iter()
        .collect();
    let action = Action {
        var: TOPOLOGY_VAR_UUID,
        kind: ActionKind::ReadWrite {
            version: topology.db_version,
            value,
            references,
        },
    };
    let txn = build_txn(
        &submitter,
        vec![action],
        f_inc,
        &active,
        &passive,
        &boot_counts,
        topology.version,
    );
    let outcome = submitter
        .run_transaction(txn, &active)
        .await
        .change_context(TopologyError::Submit)?;

    match outcome.decision {
        Decision::Commit { .. } => {
            topology.db_version = outcome.txn_id;
            debug!(db_version = %topology.db_version, "topology txn committed");
            let _ = events.send(TopologyEvent::Written(topology));
            Ok(())
        }
        Decision::Abort(AbortKind::Resubmit) => {
            debug!(txn = %outcome.txn_id, "topology txn aborted; resubmitting");
            let _ = events.send(TopologyEvent::Restart(original));
            Ok(())
        }
        Decision::Abort(AbortKind::Rerun(updates)) => {
            if updates.len() != 1 {
                return Err(Report::new(TopologyError::UnexpectedUpdateCount(
                    updates.len(),
                )));
            }
            let update = &updates[0];
            // One action, or two when root creation rode along; only the
            // topology variable's action is interpreted.
            if update.actions.len() != 1 && update.actions.len() != 2 {
                return Err(Report::new(TopologyError::UnexpectedActionCount(
                    update.actions.len(),
                )));
            }
            let action = update
                .actions
                .iter()
                .find(|action| action.var == TOPOLOGY_VAR_UUID)
                .ok_or_else(|| Report::new(TopologyError::MissingTopologyAction))?;
            let ActionKind::Write { value, references } = &action.kind else {
                return Err(Report::new(TopologyError::NonWriteTopologyAction));
            };
            let root = match references.len() {
                0 => None,
                1 => Some(&references[0]),
                n => return Err(Report::new(TopologyError::WrongReferenceCount(n))),
            };
            let mut parsed = Topology::deserialize(update.txn_id, root, value)
                .change_context(TopologyError::Deserialize)?;
            if parsed.root.uuid.is_none() {
                parsed.root = topology.root.clone();
            }
            if parsed.contains(submitter.rm_id()) {
                debug!("topology txn aborted, but found self in the committed topology");
                let _ = events.send(TopologyEvent::Written(parsed));
            } else {
                let _ = events.send(TopologyEvent::Restart(parsed));
            }
            Ok(())
        }
    }
}
