//! Ballot accumulation for the cairn replicated object store.
//!
//! One [`BallotAccumulator`] exists per transaction on the submitter
//! side. The remaining paxos instance namespace under a transaction is
//! `(rm, var)`: for each variable the accumulator expects accepted
//! ballots from `voters` distinct replica managers (the number of active
//! allocations naming that variable), reduces them to a single
//! per-variable ballot, and collapses the per-variable ballots into the
//! transaction outcome - a commit with the merged vector clock, or an
//! abort classified as resubmit (deadlock) or rerun (bad reads, with the
//! repair hints the client needs).

#![warn(clippy::pedantic)]

mod accumulator;
mod bad_reads;
mod combine;
mod error;

pub use accumulator::{BallotAccumulator, InstancesForVar, PersistedInstance, RmBallot};
pub use error::ConsensusError;
