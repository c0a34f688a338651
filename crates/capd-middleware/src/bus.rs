//! Headless, topic-based publish/subscribe bus for broker events.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the broker.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Lifecycle`] | `ApiAvailable` / `ApiUnavailable` |
//! | [`Topic::System`] | `AboutToQuit` |
//! | [`Topic::Clients`] | `ClientVanished` |
//!
//! The topic is derived from the event payload, so publishers never pick it
//! by hand.

use capd_types::{BrokerError, BrokerEvent, Event};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Capabilities becoming reachable or unreachable.
    Lifecycle,
    /// Broker-wide state such as the imminent shutdown.
    System,
    /// Client connections going away.
    Clients,
}

impl Topic {
    /// The lane an event payload travels on.
    pub fn of(payload: &BrokerEvent) -> Self {
        match payload {
            BrokerEvent::ApiAvailable { .. } | BrokerEvent::ApiUnavailable { .. } => {
                Topic::Lifecycle
            }
            BrokerEvent::AboutToQuit => Topic::System,
            BrokerEvent::ClientVanished(_) => Topic::Clients,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    lifecycle: broadcast::Sender<Event>,
    system: broadcast::Sender<Event>,
    clients: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (lifecycle, _) = broadcast::channel(capacity);
        let (system, _) = broadcast::channel(capacity);
        let (clients, _) = broadcast::channel(capacity);
        Self {
            lifecycle,
            system,
            clients,
        }
    }

    /// Publish `event` on the topic its payload belongs to.
    ///
    /// Returns the number of receivers handed the event.  Having nobody
    /// listening is normal for a broker event and yields `Ok(0)`.
    pub fn publish(&self, event: Event) -> Result<usize, BrokerError> {
        let topic = Topic::of(&event.payload);
        match self.topic_sender(topic).send(event) {
            Ok(n) => Ok(n),
            Err(broadcast::error::SendError(_)) => {
                trace!(?topic, "no subscribers for broker event");
                Ok(0)
            }
        }
    }

    /// Subscribe to a single [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Lifecycle => &self.lifecycle,
            Topic::System => &self.system,
            Topic::Clients => &self.clients,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capd_types::{CapabilityKind, ClientId, EndpointPath};

    fn available(kind: CapabilityKind) -> Event {
        Event::new(
            "capd-middleware::test",
            BrokerEvent::ApiAvailable {
                capability: kind,
                path: EndpointPath::for_capability("/org/capd/Broker1", kind),
            },
        )
    }

    #[test]
    fn topic_follows_payload() {
        assert_eq!(Topic::of(&available(CapabilityKind::Power).payload), Topic::Lifecycle);
        assert_eq!(Topic::of(&BrokerEvent::AboutToQuit), Topic::System);
        assert_eq!(
            Topic::of(&BrokerEvent::ClientVanished(ClientId::from(":1.1"))),
            Topic::Clients
        );
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(available(CapabilityKind::Wifi)).unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribers_on_same_topic_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Topic::Lifecycle);
        let mut second = bus.subscribe_to(Topic::Lifecycle);

        let event = available(CapabilityKind::Power);
        assert_eq!(bus.publish(event.clone())?, 2);

        assert_eq!(first.recv().await?.id, event.id);
        assert_eq!(second.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut system = bus.subscribe_to(Topic::System);
        bus.publish(available(CapabilityKind::Screen))?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), system.recv()).await;
        assert!(result.is_err(), "System subscriber must not receive a Lifecycle event");
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        const CAPACITY: usize = 16;
        let bus = EventBus::new(CAPACITY);
        let mut slow = bus.subscribe_to(Topic::Lifecycle);

        for _ in 0..1_000 {
            let _ = bus.publish(available(CapabilityKind::Apps));
        }

        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(Topic::Clients), 0);
        let rx = bus.subscribe_to(Topic::Clients);
        assert_eq!(bus.subscriber_count(Topic::Clients), 1);
        assert_eq!(rx.topic(), Topic::Clients);
    }
}
