//! Presence broadcast.
//!
//! Every registry change pushes the full online set to every connection.
//! Clients render presence as a plain set, so no deltas are computed and a
//! lost update is corrected by the next one.

use crate::registry::ConnectionRegistry;
use callway_protocol::ServerFrame;
use std::sync::Arc;
use tracing::{debug, trace};

/// Build the presence frame for the registry's current online set.
#[must_use]
pub fn snapshot(registry: &ConnectionRegistry) -> ServerFrame {
    ServerFrame::OnlineUsers {
        users: registry.online_users(),
    }
}

/// Send the current online set to every registered connection.
///
/// Returns the number of connections the update was queued for.
pub fn broadcast(registry: &ConnectionRegistry) -> usize {
    let frame = Arc::new(snapshot(registry));
    let mut delivered = 0;

    for handle in registry.handles() {
        if handle.send(Arc::clone(&frame)) {
            delivered += 1;
        } else {
            trace!(user = %handle.user(), connection = %handle.id(), "Presence: writer gone");
        }
    }

    debug!(online = registry.len(), delivered, "Presence: broadcast");
    delivered
}
