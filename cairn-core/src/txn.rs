//! Transaction wire records: actions, allocations and the Var record.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::ids::{BootCount, Positions, RmId, TxnId, VarUuid};

/// Reference to another variable, with its placement hint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarIdPos {
    pub id: VarUuid,
    pub positions: Positions,
}

/// What a transaction does to one variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Read of a specific version (the txn id of the write last observed).
    Read { version: TxnId },
    /// Plain overwrite.
    Write {
        value: Bytes,
        references: Vec<VarIdPos>,
    },
    /// Read-then-write against a specific version.
    ReadWrite {
        version: TxnId,
        value: Bytes,
        references: Vec<VarIdPos>,
    },
    /// Bring a new variable into existence.
    Create {
        value: Bytes,
        references: Vec<VarIdPos>,
    },
    /// Value-less write: the variable changed but the value was stripped
    /// (deflated transaction bodies and rerun hints).
    Missing,
}

/// One per-variable action within a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub var: VarUuid,
    pub kind: ActionKind,
}

impl Action {
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::Read { .. } | ActionKind::ReadWrite { .. }
        )
    }

    /// Anything that is not a pure read alters the variable's frame, so
    /// it counts as a write whether or not a value is embedded.
    #[must_use]
    pub fn is_write(&self) -> bool {
        !self.is_read_only()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, ActionKind::Read { .. })
    }

    #[must_use]
    pub fn is_write_with_value(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::Write { .. } | ActionKind::ReadWrite { .. } | ActionKind::Create { .. }
        )
    }

    /// The version a read-bearing action claims to have observed.
    #[must_use]
    pub fn read_version(&self) -> Option<TxnId> {
        match self.kind {
            ActionKind::Read { version } | ActionKind::ReadWrite { version, .. } => Some(version),
            _ => None,
        }
    }

    #[must_use]
    pub fn deflated(&self) -> Action {
        let kind = match &self.kind {
            ActionKind::Read { version } => ActionKind::Read { version: *version },
            _ => ActionKind::Missing,
        };
        Action {
            var: self.var,
            kind,
        }
    }
}

/// Assignment of a replica manager to a transaction. Active allocations
/// (non-zero boot count) precede passive ones in the allocation list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub rm_id: RmId,
    pub active: BootCount,
    pub action_indices: Vec<u16>,
}

/// A transaction as submitted and disseminated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    pub submitter: RmId,
    pub submitter_boot_count: BootCount,
    pub actions: Vec<Action>,
    pub allocations: Vec<Allocation>,
    pub f_inc: u8,
    pub topology_version: u32,
    /// The submitter wants to be entered in the subscriber set of the
    /// variables this transaction touches.
    pub subscribe: bool,
}

impl Txn {
    /// A copy with every value-carrying action stripped to
    /// [`ActionKind::Missing`]; pure reads survive. Abort outcomes carry
    /// the deflated body.
    #[must_use]
    pub fn deflated(&self) -> Txn {
        Txn {
            actions: self.actions.iter().map(Action::deflated).collect(),
            allocations: self.allocations.clone(),
            ..*self
        }
    }

    /// Merge another copy of the same transaction into this one,
    /// preferring value-carrying actions over deflated ones.
    pub fn combine(&mut self, other: &Txn) {
        for (mine, theirs) in self.actions.iter_mut().zip(&other.actions) {
            if matches!(mine.kind, ActionKind::Missing)
                && !matches!(theirs.kind, ActionKind::Missing)
            {
                *mine = theirs.clone();
            }
        }
        if self.allocations.is_empty() {
            self.allocations = other.allocations.clone();
        }
    }

    #[must_use]
    pub fn action_for(&self, var: &VarUuid) -> Option<&Action> {
        self.actions.iter().find(|action| action.var == *var)
    }
}

/// The persisted state of one variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRecord {
    pub id: VarUuid,
    pub positions: Positions,
    pub write_txn_id: TxnId,
    pub write_txn_clock: VectorClock,
    pub writes_clock: VectorClock,
}
