//! The signaling hub.
//!
//! One task per process owns the connection registry and the call
//! controller. Connections never touch that state directly: they send
//! [`HubCommand`]s through a [`HubHandle`], and the hub processes them one at
//! a time, in the order they arrive. Frames for a connection go out through
//! that connection's own queue, so ordering per connection is kept end to
//! end.

use crate::controller::{CallController, CallStats, ControllerConfig, Outcome};
use crate::presence;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, UserId};
use crate::router::RouterStats;
use crate::scheduler::TokioScheduler;
use crate::session::SessionId;
use callway_protocol::{error_codes, ClientFrame, ServerFrame};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("Hub is not running")]
    Stopped,
}

/// Work items processed by the hub.
#[derive(Debug)]
pub enum HubCommand {
    /// A connection authenticated and is ready to receive frames.
    Connect(ConnectionHandle),
    /// A connection closed.
    Disconnect {
        user: UserId,
        connection: ConnectionId,
    },
    /// A connection sent a frame.
    Frame {
        user: UserId,
        connection: ConnectionId,
        frame: ClientFrame,
    },
    /// Report counters.
    Stats(oneshot::Sender<HubStats>),
}

/// Hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Users with a registered connection.
    pub online_users: usize,
    /// Calls that have not ended.
    pub active_calls: usize,
    /// Lifetime call counters.
    pub calls: CallStats,
    /// Lifetime routing counters.
    pub routing: RouterStats,
}

/// Cloneable sender side of the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub fn connect(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.send(HubCommand::Connect(handle))
    }

    /// Report a closed connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub fn disconnect(&self, user: impl Into<UserId>, connection: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Disconnect {
            user: user.into(),
            connection,
        })
    }

    /// Hand a client frame to the hub.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub fn frame(
        &self,
        user: impl Into<UserId>,
        connection: ConnectionId,
        frame: ClientFrame,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Frame {
            user: user.into(),
            connection,
            frame,
        })
    }

    /// Fetch current counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Stats(tx))?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Stopped)
    }
}

/// Hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Call controller settings.
    pub controller: ControllerConfig,
}

/// The hub task state.
pub struct Hub {
    registry: ConnectionRegistry,
    controller: CallController<TokioScheduler>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    expired: mpsc::UnboundedReceiver<SessionId>,
}

impl Hub {
    /// Create a hub and the handle that feeds it.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();

        info!(
            ring_timeout_ms = config.controller.ring_timeout.as_millis() as u64,
            "Creating signaling hub"
        );

        let hub = Self {
            registry: ConnectionRegistry::new(),
            controller: CallController::new(TokioScheduler::new(expired_tx), config.controller),
            commands: command_rx,
            expired: expired_rx,
        };
        (hub, HubHandle { commands: command_tx })
    }

    /// Create a hub and run it on a new task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Process commands until every [`HubHandle`] is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(session) = self.expired.recv() => {
                    self.controller.ring_timeout(&self.registry, session);
                }
            }
        }

        info!("Signaling hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect(handle) => {
                let user = handle.user().to_string();
                if let Some(previous) = self.registry.register(handle) {
                    info!(user = %user, replaced = %previous.id(), "Hub: newer connection takes over");
                    previous.send(Arc::new(ServerFrame::error(
                        error_codes::SESSION_REPLACED,
                        "Signed in from another connection",
                    )));
                }
                presence::broadcast(&self.registry);
            }

            HubCommand::Disconnect { user, connection } => {
                if self.registry.unregister(&user, connection).is_some() {
                    if let Outcome::Ended(reason) = self.controller.disconnect(&self.registry, &user) {
                        debug!(user = %user, reason = reason.as_str(), "Hub: call ended by disconnect");
                    }
                    presence::broadcast(&self.registry);
                }
            }

            HubCommand::Frame {
                user,
                connection,
                frame,
            } => {
                if !self.registry.is_current(&user, connection) {
                    debug!(
                        user = %user,
                        connection = %connection,
                        event = frame.event_name(),
                        "Hub: frame from replaced connection dropped"
                    );
                    return;
                }
                let event = frame.event_name();
                let outcome = self.controller.handle_frame(&self.registry, &user, frame);
                trace!(user = %user, event, outcome = ?outcome, "Hub: frame handled");
            }

            HubCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            online_users: self.registry.len(),
            active_calls: self.controller.tracker().len(),
            calls: self.controller.stats(),
            routing: self.controller.router_stats(),
        }
    }
}
