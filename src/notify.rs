use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-user fan-out of booking events. Clients hear about their own
/// appointments; providers hear about appointments and settings changes on
/// their calendar.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a user's events. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Deliver an event. No-op if nobody is listening; a channel whose
    /// receivers have all gone is dropped.
    pub fn send(&self, user_id: Ulid, event: &Event) {
        let delivered = match self.channels.get(&user_id) {
            Some(sender) => sender.send(event.clone()).is_ok(),
            None => return,
        };
        if !delivered {
            self.prune(&user_id);
        }
    }

    /// Drop a user's channel once every receiver is gone.
    pub fn prune(&self, user_id: &Ulid) {
        self.channels
            .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    #[tokio::test]
    async fn subscriber_receives_events() {
        let hub = NotifyHub::new();
        let provider_id = Ulid::new();
        let mut rx = hub.subscribe(provider_id);

        let event = Event::ExecutionTimeRestored {
            provider_id,
            service_id: Ulid::new(),
        };
        hub.send(provider_id, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn events_stay_with_their_user() {
        let hub = NotifyHub::new();
        let (alice, bob) = (Ulid::new(), Ulid::new());
        let mut rx_bob = hub.subscribe(bob);

        hub.send(
            alice,
            &Event::ExecutionTimeRestored {
                provider_id: alice,
                service_id: Ulid::new(),
            },
        );

        assert!(rx_bob.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let id = Ulid::new();
        hub.send(
            id,
            &Event::ExecutionTimeRestored {
                provider_id: id,
                service_id: Ulid::new(),
            },
        );
    }

    #[test]
    fn prune_keeps_live_channels() {
        let hub = NotifyHub::new();
        let id = Ulid::new();
        let rx = hub.subscribe(id);
        hub.prune(&id);
        assert!(hub.channels.contains_key(&id));

        drop(rx);
        hub.prune(&id);
        assert!(!hub.channels.contains_key(&id));
    }

    #[test]
    fn send_drops_abandoned_channel() {
        let hub = NotifyHub::new();
        let id = Ulid::new();
        drop(hub.subscribe(id));
        hub.send(
            id,
            &Event::ExecutionTimeRestored {
                provider_id: id,
                service_id: Ulid::new(),
            },
        );
        assert!(!hub.channels.contains_key(&id));
    }
}
