// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The process-wide subscriber registry.
//!
//! A `std::sync::Mutex` guards the `HashMap` of subscriptions (spec §5:
//! "a single coarse lock around the dispatcher is a correct
//! implementation"); each subscription additionally carries its own
//! lock around its inbox and notify sender, the finer-grained scheme
//! spec §5 also permits. `publish` only ever holds the registry lock
//! long enough to snapshot which subscriptions match; the inbox append
//! and notify pipe write happen after it is dropped, under each
//! subscription's own lock, so no socket I/O ever happens while the
//! registry-wide lock is held.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::notify::{self, NotifyReceiver, NotifySender};
use crate::pattern::Pattern;

/// Uniquely identifies a subscription in the registry. Explicit and
/// synthesized ids live in disjoint variants, so an anonymous
/// subscriber can never collide with a client-supplied one (the
/// anonymous id space is opaque and never placed on the wire, per
/// spec §3/§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberId {
    Explicit(u64),
    Anonymous(u64),
}

/// A subscriber's pattern is immutable once compiled and shared out of
/// the registry lock; its inbox and notify sender need their own lock
/// since a publisher appending to them must never block on (or be
/// blocked by) unrelated subscribers or the registry-wide lookup.
struct Subscription {
    pattern: Pattern,
    state: Mutex<SubscriptionState>,
}

struct SubscriptionState {
    notify: NotifySender,
    inbox: VecDeque<(Vec<u8>, String)>,
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<SubscriberId, Arc<Subscription>>,
}

pub struct Dispatcher {
    registry: Mutex<Registry>,
    anon_seq: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            registry: Mutex::new(Registry::default()),
            anon_seq: AtomicU64::new(0),
        }
    }

    /// Registers a new subscription. `identity` is `Some` iff the
    /// client supplied an explicit 64-bit id at SUB time; `None`
    /// synthesizes an opaque anonymous id.
    ///
    /// Fails with `Error::SubscriberAlreadyExists` if `identity` is
    /// `Some` and already registered.
    pub fn subscribe(
        &self,
        identity: Option<u64>,
        pattern: Pattern,
    ) -> Result<(SubscriberId, NotifyReceiver)> {
        let id = match identity {
            Some(explicit) => SubscriberId::Explicit(explicit),
            None => SubscriberId::Anonymous(self.anon_seq.fetch_add(1, Ordering::Relaxed)),
        };

        let mut registry = self.registry.lock().unwrap();
        if registry.subscriptions.contains_key(&id) {
            return Err(Error::SubscriberAlreadyExists);
        }

        let (tx, rx) = notify::pair()?;
        log::info!("subscriber {:?} registered with pattern '{}'", id, pattern.source());
        registry.subscriptions.insert(
            id,
            Arc::new(Subscription {
                pattern,
                state: Mutex::new(SubscriptionState {
                    notify: tx,
                    inbox: VecDeque::new(),
                }),
            }),
        );

        Ok((id, rx))
    }

    /// Removes a subscription. Safe to call more than once or on an id
    /// that was never registered; every session exit path unconditionally
    /// calls this (spec §4.3/§4.4.3).
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut registry = self.registry.lock().unwrap();
        if registry.subscriptions.remove(&id).is_some() {
            log::info!("subscriber {:?} removed", id);
        }
    }

    /// Appends `(message, topic)` to the inbox of every subscription
    /// whose pattern fully matches `topic`, then raises that
    /// subscription's notification signal.
    ///
    /// The registry lock only ever guards the `HashMap` lookup: it is
    /// dropped before any per-subscriber inbox append or pipe write, so
    /// one slow or stuck subscriber's notify pipe can never hold up the
    /// registry for every other session (spec §9).
    pub fn publish(&self, message: &[u8], topic: &str) {
        let matches: Vec<(SubscriberId, Arc<Subscription>)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.pattern.matches(topic))
                .map(|(id, sub)| (*id, sub.clone()))
                .collect()
        };

        for (id, sub) in &matches {
            let mut state = sub.state.lock().unwrap();
            state.inbox.push_back((message.to_vec(), topic.to_owned()));
            if let Err(e) = state.notify.raise() {
                log::error!("cannot notify subscriber {:?}: {}", id, e);
            }
        }
        log::debug!(
            "published {} byte(s) on '{}' to {} subscriber(s)",
            message.len(),
            topic,
            matches.len()
        );
    }

    /// Drains and returns every pending `(message, topic)` entry for
    /// `id`, in FIFO order. Empty if `id` is unknown or has nothing
    /// pending.
    pub fn drain_inbox(&self, id: SubscriberId) -> Vec<(Vec<u8>, String)> {
        let sub = {
            let registry = self.registry.lock().unwrap();
            registry.subscriptions.get(&id).cloned()
        };
        match sub {
            Some(sub) => sub.state.lock().unwrap().inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(src: &str) -> Pattern {
        Pattern::compile(src).unwrap()
    }

    #[test]
    fn duplicate_explicit_id_is_rejected() {
        let d = Dispatcher::new();
        d.subscribe(Some(1), pattern(".*")).unwrap();
        let err = d.subscribe(Some(1), pattern(".*")).unwrap_err();
        assert!(matches!(err, Error::SubscriberAlreadyExists));
    }

    #[test]
    fn anonymous_ids_never_collide_with_explicit_ids() {
        let d = Dispatcher::new();
        let (anon_id, _rx) = d.subscribe(None, pattern(".*")).unwrap();
        // Even if a client later supplies the numeric value 0 explicitly,
        // the anonymous subscriber above used Anonymous(0), a disjoint key.
        let res = d.subscribe(Some(0), pattern(".*"));
        assert!(res.is_ok());
        assert_eq!(anon_id, SubscriberId::Anonymous(0));
    }

    #[test]
    fn publish_routes_only_to_matching_patterns() {
        let d = Dispatcher::new();
        let (en, _en_rx) = d.subscribe(Some(1), pattern(r"chat\.en")).unwrap();
        let (de, _de_rx) = d.subscribe(Some(2), pattern(r"chat\.de")).unwrap();

        d.publish(b"hello", "chat.en");

        assert_eq!(d.drain_inbox(en), vec![(b"hello".to_vec(), "chat.en".to_owned())]);
        assert_eq!(d.drain_inbox(de), Vec::new());
    }

    #[test]
    fn fifo_order_is_preserved_per_subscriber() {
        let d = Dispatcher::new();
        let (id, _rx) = d.subscribe(Some(1), pattern(".*")).unwrap();

        d.publish(b"one", "t");
        d.publish(b"two", "t");
        d.publish(b"three", "t");

        let got = d.drain_inbox(id);
        assert_eq!(
            got,
            vec![
                (b"one".to_vec(), "t".to_owned()),
                (b"two".to_vec(), "t".to_owned()),
                (b"three".to_vec(), "t".to_owned()),
            ]
        );
    }

    #[test]
    fn drain_empties_the_inbox() {
        let d = Dispatcher::new();
        let (id, _rx) = d.subscribe(Some(1), pattern(".*")).unwrap();
        d.publish(b"x", "t");
        assert_eq!(d.drain_inbox(id).len(), 1);
        assert_eq!(d.drain_inbox(id).len(), 0);
    }

    #[test]
    fn unsubscribe_removes_entry_and_is_idempotent() {
        let d = Dispatcher::new();
        let (id, _rx) = d.subscribe(Some(1), pattern(".*")).unwrap();
        d.unsubscribe(id);
        assert_eq!(d.drain_inbox(id).len(), 0);
        d.unsubscribe(id); // no panic, no error
    }

    #[test]
    fn group_pattern_selects_matching_branches() {
        let d = Dispatcher::new();
        let (id, _rx) = d.subscribe(Some(1), pattern(r"chat\.(en|de)")).unwrap();

        d.publish(b"a", "chat.en");
        d.publish(b"b", "chat.de");
        d.publish(b"c", "chat.fr");

        let got = d.drain_inbox(id);
        assert_eq!(
            got,
            vec![
                (b"a".to_vec(), "chat.en".to_owned()),
                (b"b".to_vec(), "chat.de".to_owned()),
            ]
        );
    }
}
