//! # Message Router
//!
//! Takes raw text frames from the connection, classifies them by their
//! declared `type`, and fans the `data` payload out to every listener
//! registered for the mapped resource.
//!
//! ## Delivery rules
//!
//! 1. Frames are handled one at a time, synchronously, in the order the socket
//!    produced them.
//! 2. The listener list is snapshotted before delivery. Changes made while a
//!    frame is in flight (including from inside a listener) apply from the next
//!    frame on.
//! 3. A panicking listener is contained and logged; the remaining listeners
//!    for the same frame are still called.
//! 4. Malformed frames, `error` frames and unmapped types reach nobody.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::sync::message::{InboundMessage, MessageType};
use crate::sync::registry::{Listener, Registry, Subscription};

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The frame was not a valid message envelope and was dropped.
    Malformed,
    /// The frame parsed but its type maps to no resource.
    Ignored(MessageType),
    /// The payload was handed to the listeners of `resource`.
    Delivered {
        /// Resource the frame was mapped to.
        resource: &'static str,
        /// Listeners called, including ones that panicked.
        listeners: usize,
    },
}

/// Classifies inbound frames and dispatches them to subscribers.
#[derive(Default)]
pub struct MessageRouter {
    registry: Registry,
}

impl MessageRouter {
    /// Creates a router with an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    /// Registers a listener for `resource`. See [`Registry::subscribe`].
    pub fn subscribe(&self, resource: &str, listener: Listener) -> Subscription {
        self.registry.subscribe(resource, listener)
    }

    /// Convenience wrapper that boxes a closure into a [`Listener`].
    pub fn subscribe_fn<F>(&self, resource: &str, f: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.subscribe(resource, Arc::new(f))
    }

    /// Access to the underlying registry for diagnostics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handles one text frame from the socket.
    pub fn handle_frame(&self, frame: &str) -> RouteOutcome {
        let message = match InboundMessage::parse(frame) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Dropping malformed frame ({}): {:.200}", e, frame);
                return RouteOutcome::Malformed;
            }
        };
        self.dispatch(&message)
    }

    /// Delivers an already parsed message.
    pub fn dispatch(&self, message: &InboundMessage) -> RouteOutcome {
        let Some(resource) = message.kind.resource() else {
            if message.kind == MessageType::Error {
                log::warn!("Backend reported an error at {}: {}", message.timestamp, message.data);
            } else {
                log::debug!("Ignoring message of unmapped type {:?}", message.kind);
            }
            return RouteOutcome::Ignored(message.kind);
        };

        let listeners = self.registry.snapshot(resource);
        log::trace!("Delivering {:?} to {} listener(s) of '{}'", message.kind, listeners.len(), resource);

        for (index, listener) in listeners.iter().enumerate() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&message.data))) {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!(
                    "Listener #{} for '{}' panicked ({}); continuing delivery",
                    index,
                    resource,
                    reason
                );
            }
        }

        RouteOutcome::Delivered {
            resource,
            listeners: listeners.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::message::{ACCOUNTS, CONTAINERS};
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &Value| sink.lock().unwrap().push(v.clone()))
    }

    #[test]
    fn test_fan_out_to_every_listener() {
        let router = MessageRouter::new();
        let (a, fa) = recorder();
        let (b, fb) = recorder();
        let _sa = router.subscribe_fn(ACCOUNTS, fa);
        let _sb = router.subscribe_fn(ACCOUNTS, fb);

        let outcome = router.handle_frame(
            r#"{"type":"account_update","data":{"account_id":"DU1"},"timestamp":"2024-05-01T00:00:00Z"}"#,
        );

        assert_eq!(outcome, RouteOutcome::Delivered { resource: ACCOUNTS, listeners: 2 });
        assert_eq!(*a.lock().unwrap(), vec![json!({"account_id": "DU1"})]);
        assert_eq!(*b.lock().unwrap(), vec![json!({"account_id": "DU1"})]);
    }

    #[test]
    fn test_malformed_and_unmapped_frames_reach_nobody() {
        let router = MessageRouter::new();
        let (seen, f) = recorder();
        let _s = router.subscribe_fn(ACCOUNTS, f);

        assert_eq!(router.handle_frame("{{{"), RouteOutcome::Malformed);
        assert_eq!(router.handle_frame(""), RouteOutcome::Malformed);
        assert_eq!(
            router.handle_frame(r#"{"type":"error","data":"boom","timestamp":""}"#),
            RouteOutcome::Ignored(MessageType::Error)
        );
        assert_eq!(
            router.handle_frame(r#"{"type":"heartbeat","data":null,"timestamp":""}"#),
            RouteOutcome::Ignored(MessageType::Unknown)
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_frames_only_reach_their_resource() {
        let router = MessageRouter::new();
        let (accounts, fa) = recorder();
        let (containers, fc) = recorder();
        let _sa = router.subscribe_fn(ACCOUNTS, fa);
        let _sc = router.subscribe_fn(CONTAINERS, fc);

        router.handle_frame(r#"{"type":"container_status","data":{"name":"ib-gateway"},"timestamp":""}"#);

        assert!(accounts.lock().unwrap().is_empty());
        assert_eq!(containers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let router = MessageRouter::new();
        let _bad = router.subscribe_fn(ACCOUNTS, |_| panic!("listener failure"));
        let (seen, f) = recorder();
        let _good = router.subscribe_fn(ACCOUNTS, f);

        let outcome = router.handle_frame(r#"{"type":"account_update","data":1,"timestamp":""}"#);

        assert_eq!(outcome, RouteOutcome::Delivered { resource: ACCOUNTS, listeners: 2 });
        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
    }

    #[test]
    fn test_unsubscribe_during_delivery_applies_to_next_frame() {
        let router = Arc::new(MessageRouter::new());
        let (seen, f) = recorder();

        // The first listener drops the second one's handle mid-delivery.
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let victim_slot = Arc::clone(&victim);
        let _killer = router.subscribe_fn(ACCOUNTS, move |_| {
            victim_slot.lock().unwrap().take();
        });
        *victim.lock().unwrap() = Some(router.subscribe_fn(ACCOUNTS, f));

        let frame = r#"{"type":"account_update","data":"x","timestamp":""}"#;
        router.handle_frame(frame);
        assert_eq!(seen.lock().unwrap().len(), 1);

        router.handle_frame(frame);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(router.registry().listener_count(ACCOUNTS), 1);
    }

    #[test]
    fn test_delivery_preserves_frame_order() {
        let router = MessageRouter::new();
        let (seen, f) = recorder();
        let _s = router.subscribe_fn(ACCOUNTS, f);

        for i in 0..5 {
            router.handle_frame(&format!(r#"{{"type":"account_update","data":{},"timestamp":""}}"#, i));
        }

        let got: Vec<Value> = seen.lock().unwrap().clone();
        assert_eq!(got, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    }
}
