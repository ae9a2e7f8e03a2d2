//! The peer wire protocol: handshake and message framing (C1), and the
//! per-connection session built on top of them (C5).

pub mod handshake;
pub mod message;
pub mod peer;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING};
pub use message::{BlockRequest, Message, PeerCodec};
pub use peer::{ConnectionState, PeerFlags, PeerSession};
