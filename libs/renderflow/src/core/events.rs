// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Typed event dispatch for network and evaluator observers.
//!
//! Instead of observer inheritance hierarchies, each subsystem publishes one
//! event enum to a flat list of subscriber callbacks. Subscribers are
//! identified by the id returned at registration and can be removed with it.

use crate::core::ports::PortRef;
use crate::core::properties::PropertyRef;

/// Topology and link changes published by a `ProcessorNetwork`.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Catch-all emitted alongside every specific event below.
    NetworkChanged,
    ProcessorAdded { name: String },
    ProcessorRemoved { name: String },
    ProcessorRenamed { previous: String, name: String },
    PortsConnected { from: PortRef, to: PortRef },
    PortsDisconnected { from: PortRef, to: PortRef },
    PropertyLinkAdded { from: PropertyRef, to: PropertyRef },
    PropertyLinkRemoved { from: PropertyRef, to: PropertyRef },
}

/// Pass and lifecycle hooks published by a `NetworkEvaluator`.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatorEvent {
    NetworkAssigned,
    BeforeNetworkInitialize,
    AfterNetworkInitialize,
    BeforeNetworkDeinitialize,
    AfterNetworkDeinitialize,
    BeforeNetworkProcess,
    AfterNetworkProcess,
    BeforeProcess { name: String },
    AfterProcess { name: String },
}

/// Request sent to the owning application loop over the evaluation channel.
///
/// The core never loops synchronously on itself: whenever another pass is
/// needed (deferred evaluation, mid-pass topology abort, end-processor
/// invalidation), it enqueues a request and yields control back to the host
/// event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationRequest {
    /// Run another evaluation pass.
    Process,
    /// Repaint canvases whose update was blocked by a locked evaluator.
    RefreshCanvases,
}

/// Handle identifying a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Registration list of event subscriber callbacks.
pub struct SubscriberList<E> {
    subscribers: Vec<(SubscriberId, Box<dyn FnMut(&E) + Send>)>,
    next_id: u64,
}

impl<E> Default for SubscriberList<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
        }
    }
}

impl<E> SubscriberList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&E) + Send + 'static) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, callback) in &mut self.subscribers {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<E> std::fmt::Debug for SubscriberList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let mut list: SubscriberList<NetworkEvent> = SubscriberList::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let id = list.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        list.emit(&NetworkEvent::NetworkChanged);
        list.emit(&NetworkEvent::NetworkChanged);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(list.unsubscribe(id));
        list.emit(&NetworkEvent::NetworkChanged);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!list.unsubscribe(id));
    }

    #[test]
    fn test_multiple_subscribers_all_notified() {
        let mut list: SubscriberList<EvaluatorEvent> = SubscriberList::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count_clone = Arc::clone(&count);
            list.subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            });
        }
        list.emit(&EvaluatorEvent::BeforeNetworkProcess);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
