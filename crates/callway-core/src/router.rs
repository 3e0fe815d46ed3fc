//! Signaling router.
//!
//! Resolves a destination user through the registry and queues a frame on
//! their connection. Payloads are never inspected. An unregistered
//! destination is a normal outcome: the frame is dropped and logged.

use crate::registry::ConnectionRegistry;
use callway_protocol::ServerFrame;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of routing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the destination's connection.
    Delivered,
    /// The destination is not online.
    NotRegistered,
    /// The destination is registered but its writer has already gone away.
    Closed,
}

impl Delivery {
    /// Whether the frame was queued.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Routing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Frames queued on a connection.
    pub delivered: u64,
    /// Frames dropped because the destination was offline or closing.
    pub dropped: u64,
}

/// Routes frames to users.
#[derive(Debug, Default)]
pub struct SignalRouter {
    stats: RouterStats,
}

impl SignalRouter {
    /// Create a new router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `frame` to whatever connection `to` has registered.
    pub fn route(&mut self, registry: &ConnectionRegistry, to: &str, frame: ServerFrame) -> Delivery {
        let event = frame.event_name();

        let delivery = match registry.lookup(to) {
            Some(handle) => {
                if handle.send(Arc::new(frame)) {
                    trace!(to = %to, connection = %handle.id(), event, "Routed");
                    Delivery::Delivered
                } else {
                    debug!(to = %to, connection = %handle.id(), event, "Dropped: connection closing");
                    Delivery::Closed
                }
            }
            None => {
                debug!(to = %to, event, "Dropped: destination not registered");
                Delivery::NotRegistered
            }
        };

        if delivery.is_delivered() {
            self.stats.delivered += 1;
        } else {
            self.stats.dropped += 1;
        }
        delivery
    }

    /// Get routing counters.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn test_route_to_registered_user() {
        let mut registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ConnectionHandle::new("bob", tx));

        let mut router = SignalRouter::new();
        let candidate = json!({"candidate": "candidate:0 1 UDP 2122252543 192.0.2.1 49203 typ host"});
        let frame = ServerFrame::IceCandidate {
            from: "alice".into(),
            candidate: candidate.clone(),
        };

        assert_eq!(router.route(&registry, "bob", frame.clone()), Delivery::Delivered);
        assert_eq!(*rx.try_recv().unwrap(), frame);
        assert_eq!(router.stats().delivered, 1);
    }

    #[test]
    fn test_route_miss_is_not_an_error() {
        let registry = ConnectionRegistry::new();
        let mut router = SignalRouter::new();

        let delivery = router.route(&registry, "nobody", ServerFrame::CallAccepted { from: "bob".into() });
        assert_eq!(delivery, Delivery::NotRegistered);
        assert_eq!(router.stats(), RouterStats { delivered: 0, dropped: 1 });
    }

    #[test]
    fn test_route_to_closed_writer() {
        let mut registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(ConnectionHandle::new("bob", tx));
        drop(rx);

        let mut router = SignalRouter::new();
        assert_eq!(
            router.route(&registry, "bob", ServerFrame::pong(None)),
            Delivery::Closed
        );
    }

    #[test]
    fn test_forwarded_frames_keep_order() {
        let mut registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ConnectionHandle::new("bob", tx));

        let mut router = SignalRouter::new();
        for i in 0..50 {
            router.route(
                &registry,
                "bob",
                ServerFrame::IceCandidate {
                    from: "alice".into(),
                    candidate: json!(i),
                },
            );
        }

        for i in 0..50 {
            match &*rx.try_recv().unwrap() {
                ServerFrame::IceCandidate { candidate, .. } => assert_eq!(candidate, &json!(i)),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
}
