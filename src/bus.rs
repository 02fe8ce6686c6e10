//! Publish/subscribe message bus.
//!
//! One broadcast channel per [`Channel`]: a channel per team, one shared
//! cross-team channel and one coordination channel. Delivery is
//! at-least-once to whoever is subscribed when a message is published and
//! ordered per sender within a channel. Publishing to a channel nobody
//! listens on is not an error.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::{TeamId, WorkerId};
use crate::tlog_debug;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Team(TeamId),
    CrossTeam,
    Coordination,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Team(team) => write!(f, "team:{}", team),
            Channel::CrossTeam => f.write_str("cross_team"),
            Channel::Coordination => f.write_str("coordination"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A worker was pulled away from pairing for the cycle.
    Interruption { worker: WorkerId, reason: String },
    /// A worker moved between teams.
    Transfer {
        worker: WorkerId,
        from: TeamId,
        to: TeamId,
        returning: bool,
    },
    /// Summary of a coordination pass.
    CoordinationSummary {
        borrows: usize,
        returns: usize,
        notes: Vec<String>,
    },
    /// A coordination pass that fell back to taking no action. Returns
    /// that were due still happened.
    CoordinationSkipped {
        returns: usize,
        timed_out: bool,
        reason: String,
    },
    Text { body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: Channel,
    pub sender: String,
    pub cycle: u32,
    pub payload: Payload,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(channel: Channel, sender: &str, cycle: u32, payload: Payload) -> Self {
        Self {
            channel,
            sender: sender.to_string(),
            cycle,
            payload,
            sent_at: Utc::now(),
        }
    }
}

pub struct MessageBus {
    capacity: usize,
    senders: Mutex<HashMap<Channel, broadcast::Sender<Message>>>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &Channel) -> broadcast::Sender<Message> {
        let mut senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a message; returns how many subscribers received it.
    pub fn publish(&self, message: Message) -> usize {
        let channel = message.channel.clone();
        let delivered = self.sender(&channel).send(message).unwrap_or(0);
        tlog_debug!("bus: published on {} to {} subscriber(s)", channel, delivered);
        delivered
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        Subscription {
            receiver: self.sender(&channel).subscribe(),
            channel,
        }
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.sender(channel).receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

pub struct Subscription {
    channel: Channel,
    receiver: broadcast::Receiver<Message>,
}

impl Subscription {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tlog_debug!("bus: subscriber on {} lagged by {}", self.channel, skipped);
                    continue;
                }
            }
        }
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(channel: Channel, body: &str) -> Message {
        Message::new(
            channel,
            "test",
            1,
            Payload::Text {
                body: body.to_string(),
            },
        )
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let bus = MessageBus::default();
        assert_eq!(bus.publish(text(Channel::CrossTeam, "hello")), 0);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MessageBus::default();
        let mut web = bus.subscribe(Channel::Team(TeamId::from("web")));
        let mut coordination = bus.subscribe(Channel::Coordination);

        bus.publish(text(Channel::Team(TeamId::from("web")), "standup"));

        assert_eq!(web.recv().await.unwrap().sender, "test");
        assert!(coordination.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_order_preserved_per_channel() {
        let bus = MessageBus::default();
        let mut sub = bus.subscribe(Channel::CrossTeam);
        for i in 0..5 {
            bus.publish(text(Channel::CrossTeam, &i.to_string()));
        }
        let bodies: Vec<String> = sub
            .drain()
            .into_iter()
            .map(|m| match m.payload {
                Payload::Text { body } => body,
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert_eq!(bodies, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_a_copy() {
        let bus = MessageBus::default();
        let mut a = bus.subscribe(Channel::Coordination);
        let mut b = bus.subscribe(Channel::Coordination);
        assert_eq!(bus.subscriber_count(&Channel::Coordination), 2);

        assert_eq!(bus.publish(text(Channel::Coordination, "summary")), 2);
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let bus = MessageBus::new(2);
        let mut sub = bus.subscribe(Channel::CrossTeam);
        for i in 0..5 {
            bus.publish(text(Channel::CrossTeam, &i.to_string()));
        }
        let received = sub.drain();
        assert_eq!(received.len(), 2);
    }

    #[test]
    fn test_recv_waits_for_publish() {
        let bus = MessageBus::default();
        let mut sub = bus.subscribe(Channel::Coordination);
        let mut recv = tokio_test::task::spawn(sub.recv());
        tokio_test::assert_pending!(recv.poll());

        bus.publish(text(Channel::Coordination, "late"));
        assert!(recv.is_woken());
        let message = tokio_test::assert_ready!(recv.poll());
        assert_eq!(message.map(|m| m.cycle), Some(1));
    }

    #[test]
    fn test_recv_ends_when_bus_dropped() {
        let bus = MessageBus::default();
        let mut sub = bus.subscribe(Channel::CrossTeam);
        drop(bus);
        assert!(tokio_test::block_on(sub.recv()).is_none());
    }

    #[test]
    fn test_skipped_pass_is_tagged() {
        let payload = Payload::CoordinationSkipped {
            returns: 1,
            timed_out: true,
            reason: "deadline exceeded".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "coordination_skipped");
        assert_eq!(json["timed_out"], true);
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(Channel::Team(TeamId::from("web")).to_string(), "team:web");
        assert_eq!(Channel::CrossTeam.to_string(), "cross_team");
    }
}
