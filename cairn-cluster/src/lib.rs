//! Cluster-facing pieces of the cairn replicated object store: the
//! membership interfaces the core consumes, the best-effort senders, and
//! the topology writer that bootstraps cluster membership through the
//! normal transaction path.

#![warn(clippy::pedantic)]

mod connection;
mod senders;
mod submitter;
mod topology;
mod writer;

pub use connection::{
    ConnectionEvent, ConnectionPublisher, Conns, MembershipSubscriber, ServerConnection,
    SubscriberAction,
};
pub use senders::Sender;
pub use submitter::{SubmitError, TxnSubmitter};
pub use topology::Topology;
pub use writer::{TopologyError, TopologyEvent, TopologyWriter};
