//! Cairn Core - shared types for the replicated object store
//!
//! This crate provides the common types used by the per-variable
//! transaction engine, the ballot accumulator and the cluster layer:
//! fixed-width identifiers, vector clocks, ballots, the wire records of
//! the transaction protocol, and the postcard codec they travel through.

#![warn(clippy::pedantic)]

pub mod ballot;
pub mod clock;
pub mod codec;
pub mod ids;
pub mod outcome;
pub mod status;
pub mod txn;

pub use ballot::{BadReadWitness, Ballot, Vote, VoteKind};
pub use clock::{VectorClock, VectorClockMut};
pub use codec::{CodecError, decode, encode};
pub use ids::{
    BootCount, ClientId, Positions, ROOT_VAR_UUID, RmId, TOPOLOGY_VAR_UUID, TxnId, VarUuid,
};
pub use outcome::{AbortKind, AcceptedInstance, Decision, Outcome, OutcomeVar, Update};
pub use status::{Status, StatusConsumer};
pub use txn::{Action, ActionKind, Allocation, Txn, VarIdPos, VarRecord};
