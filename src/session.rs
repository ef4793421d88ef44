//! Plumbing shared by the device sessions.
//!
//! Each session owns a [`Broker`] with three disjoint topics: device frames
//! flow out through `rx`, opaque client commands flow in through `tx`, and
//! status changes reach every subscriber through `rx-broadcast`.

use bytes::Bytes;

use crate::broker::Broker;
use crate::protocol::Message;

/// Frames received from the device.
pub const TOPIC_RX: &str = "rx";

/// Opaque commands on their way to the device.
pub const TOPIC_TX: &str = "tx";

/// Messages addressed to every subscriber of the session.
pub const TOPIC_BROADCAST: &str = "rx-broadcast";

/// A topic nothing publishes to. The Senso data channel subscribes here so
/// it never sees outbound traffic; only the control channel transmits.
pub const TOPIC_NO_TX: &str = "no-tx";

/// What travels over a session's topics.
///
/// Frames are [`Bytes`] so fanning one out to many subscribers never copies
/// the frame body.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A complete binary frame, in either direction.
    Frame(Bytes),

    /// A protocol message for subscribers.
    Message(Message),
}

/// The broker type used by device sessions.
pub type SessionBroker = Broker<Payload>;

/// Publish a status change to every subscriber of the session.
pub fn broadcast(broker: &SessionBroker, message: Message) {
    broker.try_publish(TOPIC_BROADCAST, Payload::Message(message));
}
