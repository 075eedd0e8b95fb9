// Event subscriber registry: event id -> link id -> subscriber.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::Subscriber;

// Link ids are process-unique so a subscription can be referred to without
// naming its object.
static NEXT_LINK_ID: AtomicU32 = AtomicU32::new(1);

fn next_link_id() -> u32 {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
pub struct EventRegistry {
    subscribers: Mutex<HashMap<u32, HashMap<u32, Subscriber>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, event: u32, subscriber: Subscriber) -> u32 {
        let link_id = next_link_id();
        self.subscribers
            .lock()
            .entry(event)
            .or_default()
            .insert(link_id, subscriber);
        link_id
    }

    pub fn disconnect(&self, link_id: u32) -> bool {
        let mut subscribers = self.subscribers.lock();
        for (_, links) in subscribers.iter_mut() {
            if links.remove(&link_id).is_some() {
                return true;
            }
        }
        false
    }

    /// Which event a link belongs to, if any.
    pub fn event_for_link(&self, link_id: u32) -> Option<u32> {
        let subscribers = self.subscribers.lock();
        subscribers
            .iter()
            .find(|(_, links)| links.contains_key(&link_id))
            .map(|(event, _)| *event)
    }

    pub fn subscriber_count(&self, event: u32) -> usize {
        self.subscribers
            .lock()
            .get(&event)
            .map(|links| links.len())
            .unwrap_or(0)
    }

    /// Invoke every subscriber of `event` with `params`.
    ///
    /// Subscribers are snapshotted under the lock and run outside it, so a
    /// callback may connect or disconnect without deadlocking.
    pub fn trigger(&self, event: u32, params: &Bytes) {
        let snapshot: Vec<Subscriber> = {
            let subscribers = self.subscribers.lock();
            match subscribers.get(&event) {
                Some(links) => links.values().cloned().collect(),
                None => return,
            }
        };
        for subscriber in snapshot {
            subscriber(params.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counting_subscriber() -> (Subscriber, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let subscriber: Subscriber = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (subscriber, hits)
    }

    #[test]
    fn identical_connects_get_distinct_links() {
        let registry = EventRegistry::new();
        let (subscriber, hits) = counting_subscriber();
        let first = registry.connect(5, Arc::clone(&subscriber));
        let second = registry.connect(5, subscriber);
        assert_ne!(first, second);

        registry.trigger(5, &Bytes::from_static(b"x"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Dropping one leaves the other live.
        assert!(registry.disconnect(first));
        registry.trigger(5, &Bytes::from_static(b"x"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(registry.subscriber_count(5), 1);
    }

    #[test]
    fn disconnect_of_unknown_link_is_false() {
        let registry = EventRegistry::new();
        assert!(!registry.disconnect(12345));
    }

    #[test]
    fn event_for_link_finds_the_owner() {
        let registry = EventRegistry::new();
        let (subscriber, _) = counting_subscriber();
        let link = registry.connect(9, subscriber);
        assert_eq!(registry.event_for_link(link), Some(9));
        assert_eq!(registry.event_for_link(link + 1000), None);
    }

    #[test]
    fn trigger_on_unknown_event_is_a_no_op() {
        let registry = EventRegistry::new();
        registry.trigger(42, &Bytes::new());
    }
}
