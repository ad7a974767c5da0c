//! The frame stack of one variable.
//!
//! Each frame is one committed or proposed state, tied to the transaction
//! that wrote it. Exactly one frame is current; prior frames survive as
//! ancestors until their transaction is globally complete and a
//! descendent has been persisted. Frames are arena-allocated in a
//! per-variable vector and linked by index: the chain is a relation, not
//! an ownership claim.

use std::collections::BTreeSet;
use std::sync::Arc;

use cairn_core::{BadReadWitness, Ballot, Txn, TxnId, VarUuid, VectorClock};

pub(crate) type FrameId = usize;

#[derive(Debug)]
struct FrameNode {
    parent: Option<FrameId>,
    child: Option<FrameId>,
    /// The writing transaction. The genesis frame of a fresh variable has
    /// none.
    txn_id: Option<TxnId>,
    txn: Option<Arc<Txn>>,
    /// Vector clock at this frame's write.
    txn_clock: VectorClock,
    /// Last-written clock element per var touched by this chain.
    writes_clock: VectorClock,
    /// Reads voted against this frame, awaiting their outcome.
    reads: BTreeSet<TxnId>,
    /// Writes proposed on this frame, awaiting their outcome. At most one
    /// of them commits into a child frame.
    writes: BTreeSet<TxnId>,
    /// Reads whose outcome committed, awaiting global completion.
    committed_reads: BTreeSet<TxnId>,
    descendent_on_disk: bool,
    globally_complete: bool,
}

impl FrameNode {
    fn new(
        parent: Option<FrameId>,
        txn_id: Option<TxnId>,
        txn: Option<Arc<Txn>>,
        txn_clock: VectorClock,
        writes_clock: VectorClock,
        globally_complete: bool,
    ) -> Self {
        Self {
            parent,
            child: None,
            txn_id,
            txn,
            txn_clock,
            writes_clock,
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            committed_reads: BTreeSet::new(),
            descendent_on_disk: false,
            globally_complete,
        }
    }

    fn is_idle(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    fn removable(&self) -> bool {
        self.globally_complete
            && self.descendent_on_disk
            && self.is_idle()
            && self.committed_reads.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct FrameStack {
    var: VarUuid,
    nodes: Vec<FrameNode>,
    free: Vec<FrameId>,
    cur: FrameId,
}

impl FrameStack {
    /// Stack for a variable that has never been written: no transaction,
    /// clocks at one.
    pub(crate) fn genesis(var: VarUuid) -> Self {
        let clock: VectorClock = [(var, 1)].into_iter().collect();
        let node = FrameNode::new(None, None, None, clock.clone(), clock, true);
        Self {
            var,
            nodes: vec![node],
            free: Vec::new(),
            cur: 0,
        }
    }

    /// Stack rebuilt from a persisted Var record. The base frame's write
    /// was durable before shutdown, so it counts as globally complete.
    pub(crate) fn restored(
        var: VarUuid,
        txn_id: TxnId,
        txn: Arc<Txn>,
        txn_clock: VectorClock,
        writes_clock: VectorClock,
    ) -> Self {
        let node = FrameNode::new(None, Some(txn_id), Some(txn), txn_clock, writes_clock, true);
        Self {
            var,
            nodes: vec![node],
            free: Vec::new(),
            cur: 0,
        }
    }

    pub(crate) fn cur(&self) -> FrameId {
        self.cur
    }

    pub(crate) fn frame_txn_id(&self, frame: FrameId) -> Option<TxnId> {
        self.nodes[frame].txn_id
    }

    pub(crate) fn frame_txn_clock(&self, frame: FrameId) -> &VectorClock {
        &self.nodes[frame].txn_clock
    }

    pub(crate) fn frame_writes_clock(&self, frame: FrameId) -> &VectorClock {
        &self.nodes[frame].writes_clock
    }

    /// The current frame's number for this variable.
    pub(crate) fn frame_number(&self) -> u64 {
        self.nodes[self.cur].txn_clock.at(&self.var)
    }

    pub(crate) fn cur_is_idle(&self) -> bool {
        self.nodes[self.cur].is_idle()
    }

    /// No pending work at all: nothing voting, nothing awaiting global
    /// completion, every ancestor pruned.
    pub(crate) fn cur_is_empty(&self) -> bool {
        let node = &self.nodes[self.cur];
        node.is_idle() && node.committed_reads.is_empty() && node.parent.is_none()
    }

    fn subs(subscribe: bool, txn_id: TxnId) -> Vec<TxnId> {
        if subscribe { vec![txn_id] } else { Vec::new() }
    }

    /// Vote on a pure read of `version`: commit when it read this frame's
    /// transaction, bad read otherwise, with this frame as the witness.
    pub(crate) fn add_read(&mut self, txn_id: TxnId, version: TxnId, subscribe: bool) -> Ballot {
        let var = self.var;
        let node = &mut self.nodes[self.cur];
        node.reads.insert(txn_id);
        let subscribers = Self::subs(subscribe, txn_id);
        match (&node.txn_id, &node.txn) {
            (Some(frame_txn), _) if *frame_txn == version => {
                Ballot::commit(var, node.txn_clock.clone(), subscribers)
            }
            (Some(frame_txn), Some(frame_body)) => Ballot::bad_read(
                var,
                node.txn_clock.clone(),
                BadReadWitness {
                    txn_id: *frame_txn,
                    actions: frame_body.actions.clone(),
                },
            ),
            // Nothing has ever been written here: no version to witness.
            _ => Ballot::deadlock(var, node.txn_clock.clone()),
        }
    }

    /// Vote on a write: commit with the frame clock max-merged with the
    /// writes clock and the local slot bumped past this frame.
    pub(crate) fn add_write(&mut self, txn_id: TxnId, subscribe: bool) -> Ballot {
        let var = self.var;
        let node = &mut self.nodes[self.cur];
        node.writes.insert(txn_id);
        let mut clock = node.txn_clock.to_mut();
        clock.merge_max(&node.writes_clock);
        clock.bump(var, 1);
        Ballot::commit(var, clock.freeze(), Self::subs(subscribe, txn_id))
    }

    /// Vote on a read-write: the read part gates the vote, the write part
    /// shapes the clock.
    pub(crate) fn add_read_write(
        &mut self,
        txn_id: TxnId,
        version: TxnId,
        subscribe: bool,
    ) -> Ballot {
        let var = self.var;
        let node = &mut self.nodes[self.cur];
        node.writes.insert(txn_id);
        match (&node.txn_id, &node.txn) {
            (Some(frame_txn), _) if *frame_txn == version => {
                let mut clock = node.txn_clock.to_mut();
                clock.merge_max(&node.writes_clock);
                clock.bump(var, 1);
                Ballot::commit(var, clock.freeze(), Self::subs(subscribe, txn_id))
            }
            (Some(frame_txn), Some(frame_body)) => Ballot::bad_read(
                var,
                node.txn_clock.clone(),
                BadReadWitness {
                    txn_id: *frame_txn,
                    actions: frame_body.actions.clone(),
                },
            ),
            _ => Ballot::deadlock(var, node.txn_clock.clone()),
        }
    }

    fn find_pending_write(&self, txn_id: TxnId) -> Option<FrameId> {
        self.chain().find(|frame| self.nodes[*frame].writes.contains(&txn_id))
    }

    fn find_pending_read(&self, txn_id: TxnId) -> Option<FrameId> {
        self.chain().find(|frame| self.nodes[*frame].reads.contains(&txn_id))
    }

    pub(crate) fn has_pending(&self, txn_id: TxnId) -> bool {
        self.find_pending_write(txn_id).is_some() || self.find_pending_read(txn_id).is_some()
    }

    /// Walk the chain from the current frame to the root.
    fn chain(&self) -> impl Iterator<Item = FrameId> {
        let mut cursor = Some(self.cur);
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.nodes[id].parent;
            Some(id)
        })
    }

    /// Commit the write that owns `txn_id`. Returns the new current frame
    /// if the outcome advances this variable.
    pub(crate) fn write_committed(
        &mut self,
        txn_id: TxnId,
        txn: &Arc<Txn>,
        outcome_clock: &VectorClock,
    ) -> Option<FrameId> {
        if let Some(owner) = self.find_pending_write(txn_id) {
            self.nodes[owner].writes.remove(&txn_id);
        }
        self.advance(txn_id, txn, outcome_clock)
    }

    /// Learn a write this variable never voted on. Returns the new
    /// current frame, or `None` when there is nothing to learn.
    pub(crate) fn write_learnt(
        &mut self,
        txn_id: TxnId,
        txn: &Arc<Txn>,
        outcome_clock: &VectorClock,
    ) -> Option<FrameId> {
        self.advance(txn_id, txn, outcome_clock)
    }

    fn advance(
        &mut self,
        txn_id: TxnId,
        txn: &Arc<Txn>,
        outcome_clock: &VectorClock,
    ) -> Option<FrameId> {
        if outcome_clock.at(&self.var) <= self.frame_number() {
            return None;
        }
        let mut writes_clock = self.nodes[self.cur].writes_clock.to_mut();
        for action in &txn.actions {
            if action.is_write() {
                writes_clock.set_max(action.var, outcome_clock.at(&action.var));
            }
        }
        let node = FrameNode::new(
            Some(self.cur),
            Some(txn_id),
            Some(txn.clone()),
            outcome_clock.clone(),
            writes_clock.freeze(),
            false,
        );
        let id = self.alloc(node);
        self.nodes[self.cur].child = Some(id);
        self.cur = id;
        Some(id)
    }

    pub(crate) fn read_committed(&mut self, txn_id: TxnId) -> bool {
        if let Some(owner) = self.find_pending_read(txn_id) {
            self.nodes[owner].reads.remove(&txn_id);
            self.nodes[owner].committed_reads.insert(txn_id);
            true
        } else {
            false
        }
    }

    /// Learn a read this variable never voted on: only a read of the
    /// current frame is worth recording.
    pub(crate) fn read_learnt(&mut self, txn_id: TxnId, version: Option<TxnId>) -> bool {
        let node = &mut self.nodes[self.cur];
        if version.is_some() && version == node.txn_id {
            node.committed_reads.insert(txn_id);
            true
        } else {
            false
        }
    }

    pub(crate) fn write_aborted(&mut self, txn_id: TxnId) -> bool {
        if let Some(owner) = self.find_pending_write(txn_id) {
            self.nodes[owner].writes.remove(&txn_id);
            true
        } else {
            false
        }
    }

    pub(crate) fn read_aborted(&mut self, txn_id: TxnId) -> bool {
        if let Some(owner) = self.find_pending_read(txn_id) {
            self.nodes[owner].reads.remove(&txn_id);
            true
        } else {
            false
        }
    }

    /// Mark the frame written by `txn_id` globally complete, or pop the
    /// committed read it tracks. False if this variable holds no state
    /// for the transaction.
    pub(crate) fn globally_complete(&mut self, txn_id: TxnId) -> bool {
        let written = self
            .chain()
            .find(|frame| self.nodes[*frame].txn_id == Some(txn_id));
        if let Some(frame) = written {
            self.nodes[frame].globally_complete = true;
            self.prune();
            return true;
        }
        let read = self
            .chain()
            .find(|frame| self.nodes[*frame].committed_reads.contains(&txn_id));
        if let Some(frame) = read {
            self.nodes[frame].committed_reads.remove(&txn_id);
            self.prune();
            return true;
        }
        false
    }

    /// Persistence of `from` makes every ancestor's state redundant on
    /// disk. Stops at the first ancestor already marked.
    pub(crate) fn mark_descendents_on_disk(&mut self, from: FrameId) {
        let mut cursor = self.nodes[from].parent;
        while let Some(id) = cursor {
            let node = &mut self.nodes[id];
            if node.descendent_on_disk {
                break;
            }
            node.descendent_on_disk = true;
            cursor = node.parent;
        }
        self.prune();
    }

    fn prune(&mut self) {
        let ancestors: Vec<FrameId> = self.chain().skip(1).collect();
        for id in ancestors {
            if self.nodes[id].removable() {
                self.retire(id);
            }
        }
    }

    fn retire(&mut self, id: FrameId) {
        let parent = self.nodes[id].parent;
        let child = self.nodes[id].child;
        if let Some(p) = parent {
            self.nodes[p].child = child;
        }
        if let Some(c) = child {
            self.nodes[c].parent = parent;
        }
        let node = &mut self.nodes[id];
        node.txn = None;
        node.parent = None;
        node.child = None;
        self.free.push(id);
    }

    fn alloc(&mut self, node: FrameNode) -> FrameId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = node;
            id
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    /// Frames still in the chain, current included.
    pub(crate) fn depth(&self) -> usize {
        self.chain().count()
    }
}
