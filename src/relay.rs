//! The relay capability this crate consumes: filtered subscriptions and
//! event publish, both synchronous from this crate's point of view (a
//! caller bridging to an async transport is expected to block its own
//! future before or after calling in, never from inside these calls).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::event::Event;

/// What a subscription matches against. All set fields are conjunctive
/// (AND); an empty set means "don't filter on this dimension".
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub kinds: HashSet<u16>,
    pub authors: HashSet<String>,
    pub tags: Vec<(char, HashSet<String>)>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.insert(pubkey.into());
        self
    }

    pub fn tag(mut self, letter: char, value: impl Into<String>) -> Self {
        match self.tags.iter_mut().find(|(l, _)| *l == letter) {
            Some((_, values)) => {
                values.insert(value.into());
            }
            None => self.tags.push((letter, HashSet::from([value.into()]))),
        }
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        for (letter, values) in &self.tags {
            let tag_name = letter.to_string();
            let matched = event.tags.iter().any(|t| t.first().map(String::as_str) == Some(tag_name.as_str()) && t.get(1).is_some_and(|v| values.contains(v)));
            if !matched {
                return false;
            }
        }
        true
    }
}

/// Releases a subscription when called (or dropped, for implementations
/// that wrap a guard). Idempotent.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// The relay capability. Implementations may deliver the same event more
/// than once; callers must tolerate that (the ratchet already does, via
/// consumed message-key tracking).
pub trait RelayAdapter: Send + Sync {
    fn subscribe(&self, filter: Filter, on_event: Box<dyn Fn(Event) + Send + Sync>) -> Unsubscribe;
    fn publish(&self, event: Event) -> Result<()>;
}

type Subscriptions = Arc<Mutex<Vec<(u64, Filter, Arc<dyn Fn(Event) + Send + Sync>)>>>;

/// An in-process relay for tests: `publish` immediately fans out to every
/// subscription whose filter matches.
#[derive(Default)]
pub struct InMemoryRelay {
    subscriptions: Subscriptions,
    next_id: Mutex<u64>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelayAdapter for InMemoryRelay {
    fn subscribe(&self, filter: Filter, on_event: Box<dyn Fn(Event) + Send + Sync>) -> Unsubscribe {
        let id = {
            let mut next_id = self.next_id.lock().expect("lock poisoned");
            let id = *next_id;
            *next_id += 1;
            id
        };
        self.subscriptions.lock().expect("lock poisoned").push((id, filter, Arc::from(on_event)));

        let subscriptions = Arc::clone(&self.subscriptions);
        Box::new(move || {
            subscriptions.lock().expect("lock poisoned").retain(|(sub_id, _, _)| *sub_id != id);
        })
    }

    fn publish(&self, event: Event) -> Result<()> {
        let subscriptions = self.subscriptions.lock().expect("lock poisoned");
        for (_, filter, on_event) in subscriptions.iter() {
            if filter.matches(&event) {
                on_event(event.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(kind: u16, pubkey: &str) -> Event {
        Event { id: "id".into(), pubkey: pubkey.into(), created_at: 0, kind, tags: vec![], content: String::new(), sig: String::new() }
    }

    #[test]
    fn test_filter_matches_kind_and_author() {
        let filter = Filter::new().kind(1060).author("alice");
        assert!(filter.matches(&event(1060, "alice")));
        assert!(!filter.matches(&event(1060, "bob")));
        assert!(!filter.matches(&event(1, "alice")));
    }

    #[test]
    fn test_subscribe_and_publish() {
        let relay = InMemoryRelay::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let unsubscribe = relay.subscribe(Filter::new().kind(1060), Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        relay.publish(event(1060, "alice")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        unsubscribe();
        relay.publish(event(1060, "alice")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
