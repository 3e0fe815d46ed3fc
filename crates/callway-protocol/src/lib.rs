//! # callway-protocol
//!
//! Wire protocol definitions for the Callway presence and call-signaling
//! server.
//!
//! ## Frame Types
//!
//! - `call-user` / `accept-call` / `reject-call` / `end-call` - Call control
//! - `offer` / `answer` / `ice-candidate` - Peer connection negotiation
//! - `online-users` - Presence
//! - `error` - Non-fatal error reports
//!
//! ## Example
//!
//! ```rust
//! use callway_protocol::{codec, ClientFrame};
//!
//! let frame = ClientFrame::AcceptCall { to: "alice".into() };
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{error_codes, CallType, ClientFrame, EndReason, IceServer, ServerFrame};
pub use version::{Version, VersionError, PROTOCOL_VERSION};
