//! # callway-core
//!
//! Presence and call signaling for the Callway server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Maps each online user to their one live connection
//! - **Presence** - Broadcasts the online set on every registry change
//! - **Session** - Tracks calls in progress
//! - **Call** - Pure call lifecycle state machine
//! - **Controller** - Applies call events and arms ring timers
//! - **Router** - Delivers frames to users
//! - **Hub** - Single task that serializes all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│     Hub     │────▶│  Registry   │──▶ Presence
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│   Router    │◀────│ Controller  │──▶ Session
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod call;
pub mod controller;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod session;

pub use call::{transition, CallEvent, CallInput, Step, Termination, Transition};
pub use controller::{CallController, CallStats, ControllerConfig, Outcome, DEFAULT_RING_TIMEOUT};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Outbound, UserId};
pub use router::{Delivery, SignalRouter};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
pub use session::{CallSession, CallState, CallTracker, Role, SessionId, TrackerError};
