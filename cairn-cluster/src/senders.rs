//! Best-effort, membership-aware delivery primitives.
//!
//! The three variants differ only in how they react to connect events:
//! one-shot delivery that deregisters once every recipient has been
//! reached, repeated delivery to named recipients on every (re)connect,
//! and repeated delivery to everyone.

use std::collections::HashSet;

use bytes::Bytes;
use cairn_core::RmId;
use tracing::debug;

use crate::connection::{ConnectionEvent, Conns, MembershipSubscriber, SubscriberAction};

pub enum Sender {
    /// Deliver once per recipient, then deregister.
    OneShot { msg: Bytes, remaining: HashSet<RmId> },
    /// Deliver to each named recipient every time it (re)connects.
    Repeating { msg: Bytes, recipients: Vec<RmId> },
    /// Deliver to every connection on every connect event.
    RepeatingAll { msg: Bytes },
}

impl Sender {
    #[must_use]
    pub fn one_shot(msg: Bytes, recipients: impl IntoIterator<Item = RmId>) -> Self {
        let remaining: HashSet<RmId> = recipients.into_iter().collect();
        debug!(recipients = ?remaining, "adding one-shot sender");
        Sender::OneShot { msg, remaining }
    }

    #[must_use]
    pub fn repeating(msg: Bytes, recipients: impl IntoIterator<Item = RmId>) -> Self {
        Sender::Repeating {
            msg,
            recipients: recipients.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn repeating_all(msg: Bytes) -> Self {
        Sender::RepeatingAll { msg }
    }
}

impl MembershipSubscriber for Sender {
    fn on_event(&mut self, event: ConnectionEvent<'_>) -> SubscriberAction {
        match self {
            Sender::OneShot { msg, remaining } => match event {
                ConnectionEvent::Connected(conns) => {
                    remaining.retain(|recipient| match conns.get(recipient) {
                        Some(conn) => {
                            conn.send(msg.clone());
                            false
                        }
                        None => true,
                    });
                    one_shot_action(remaining)
                }
                ConnectionEvent::Established { rm_id, conns } => {
                    if remaining.remove(&rm_id) {
                        if let Some(conn) = conns.get(&rm_id) {
                            conn.send(msg.clone());
                        }
                    }
                    one_shot_action(remaining)
                }
                ConnectionEvent::Lost { .. } => SubscriberAction::Retain,
            },
            Sender::Repeating { msg, recipients } => match event {
                ConnectionEvent::Connected(conns) => {
                    for recipient in recipients.iter() {
                        if let Some(conn) = conns.get(recipient) {
                            conn.send(msg.clone());
                        }
                    }
                    SubscriberAction::Retain
                }
                ConnectionEvent::Established { rm_id, conns } => {
                    if recipients.contains(&rm_id) {
                        if let Some(conn) = conns.get(&rm_id) {
                            conn.send(msg.clone());
                        }
                    }
                    SubscriberAction::Retain
                }
                ConnectionEvent::Lost { .. } => SubscriberAction::Retain,
            },
            Sender::RepeatingAll { msg } => match event {
                ConnectionEvent::Connected(conns) => {
                    for conn in conns.values() {
                        conn.send(msg.clone());
                    }
                    SubscriberAction::Retain
                }
                ConnectionEvent::Established { rm_id, conns } => {
                    if let Some(conn) = conns.get(&rm_id) {
                        conn.send(msg.clone());
                    }
                    SubscriberAction::Retain
                }
                ConnectionEvent::Lost { .. } => SubscriberAction::Retain,
            },
        }
    }
}

fn one_shot_action(remaining: &HashSet<RmId>) -> SubscriberAction {
    if remaining.is_empty() {
        debug!("removing one-shot sender");
        SubscriberAction::Deregister
    } else {
        SubscriberAction::Retain
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use cairn_core::BootCount;

    use super::*;
    use crate::connection::{ConnectionPublisher, ServerConnection};

    #[derive(Default)]
    struct RecordingConn {
        sent: Mutex<Vec<Bytes>>,
    }

    impl ServerConnection for RecordingConn {
        fn send(&self, msg: Bytes) {
            self.sent.lock().unwrap().push(msg);
        }

        fn boot_count(&self) -> BootCount {
            BootCount(1)
        }
    }

    fn conn() -> Arc<RecordingConn> {
        Arc::new(RecordingConn::default())
    }

    fn sent(conn: &RecordingConn) -> usize {
        conn.sent.lock().unwrap().len()
    }

    #[test]
    fn one_shot_delivers_once_and_deregisters() {
        let mut publisher = ConnectionPublisher::new();
        let c1 = conn();
        publisher.connection_established(RmId(1), c1.clone());

        let msg = Bytes::from_static(b"hello");
        publisher.add_subscriber(Box::new(Sender::one_shot(msg, [RmId(1), RmId(2)])));
        assert_eq!(sent(&c1), 1);
        assert_eq!(publisher.subscriber_count(), 1);

        // rm2 arrives: delivered, then the sender is gone.
        let c2 = conn();
        publisher.connection_established(RmId(2), c2.clone());
        assert_eq!(sent(&c2), 1);
        assert_eq!(publisher.subscriber_count(), 0);

        // A reconnect delivers nothing further.
        publisher.connection_lost(RmId(2));
        publisher.connection_established(RmId(2), c2.clone());
        assert_eq!(sent(&c2), 1);
    }

    #[test]
    fn repeating_sender_redelivers_on_each_reconnect() {
        let mut publisher = ConnectionPublisher::new();
        let c1 = conn();
        publisher.connection_established(RmId(1), c1.clone());
        publisher.add_subscriber(Box::new(Sender::repeating(
            Bytes::from_static(b"again"),
            [RmId(1)],
        )));
        assert_eq!(sent(&c1), 1);

        publisher.connection_lost(RmId(1));
        publisher.connection_established(RmId(1), c1.clone());
        assert_eq!(sent(&c1), 2);

        // Unnamed peers are ignored.
        let c2 = conn();
        publisher.connection_established(RmId(2), c2.clone());
        assert_eq!(sent(&c2), 0);
    }

    #[test]
    fn repeating_all_sender_reaches_every_connection() {
        let mut publisher = ConnectionPublisher::new();
        let (c1, c2) = (conn(), conn());
        publisher.connection_established(RmId(1), c1.clone());
        publisher.add_subscriber(Box::new(Sender::repeating_all(Bytes::from_static(b"all"))));
        assert_eq!(sent(&c1), 1);

        publisher.connection_established(RmId(2), c2.clone());
        assert_eq!(sent(&c2), 1);
        assert_eq!(sent(&c1), 1);
    }
}
