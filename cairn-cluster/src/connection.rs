//! The membership interfaces the core consumes. The connection manager
//! itself lives outside the core; these are the seams it exposes.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use cairn_core::{BootCount, RmId};

/// An established connection to a peer replica manager.
pub trait ServerConnection: Send + Sync {
    /// Best-effort delivery of one message.
    fn send(&self, msg: Bytes);
    /// The peer's boot count, as learnt during the handshake.
    fn boot_count(&self) -> BootCount;
}

pub type Conns = HashMap<RmId, Arc<dyn ServerConnection>>;

/// The capability set every membership subscriber is driven by.
pub enum ConnectionEvent<'a> {
    /// Initial delivery of the current connection set, on registration.
    Connected(&'a Conns),
    /// A peer (re)connected.
    Established { rm_id: RmId, conns: &'a Conns },
    /// A peer went away.
    Lost { rm_id: RmId, conns: &'a Conns },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberAction {
    Retain,
    Deregister,
}

pub trait MembershipSubscriber: Send {
    fn on_event(&mut self, event: ConnectionEvent<'_>) -> SubscriberAction;
}

/// Owns the subscriber list and fans membership events out. A subscriber
/// registering is immediately given the current connection set.
#[derive(Default)]
pub struct ConnectionPublisher {
    conns: Conns,
    subscribers: Vec<Box<dyn MembershipSubscriber>>,
}

impl ConnectionPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn conns(&self) -> &Conns {
        &self.conns
    }

    pub fn add_subscriber(&mut self, mut subscriber: Box<dyn MembershipSubscriber>) {
        if subscriber.on_event(ConnectionEvent::Connected(&self.conns))
            == SubscriberAction::Retain
        {
            self.subscribers.push(subscriber);
        }
    }

    pub fn connection_established(&mut self, rm_id: RmId, conn: Arc<dyn ServerConnection>) {
        self.conns.insert(rm_id, conn);
        let conns = &self.conns;
        self.subscribers
            .retain_mut(|subscriber| {
                subscriber.on_event(ConnectionEvent::Established { rm_id, conns })
                    == SubscriberAction::Retain
            });
    }

    pub fn connection_lost(&mut self, rm_id: RmId) {
        self.conns.remove(&rm_id);
        let conns = &self.conns;
        self.subscribers
            .retain_mut(|subscriber| {
                subscriber.on_event(ConnectionEvent::Lost { rm_id, conns })
                    == SubscriberAction::Retain
            });
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
