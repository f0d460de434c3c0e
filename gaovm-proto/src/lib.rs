//! Wire protocol for the gaovm control fabric.
//!
//! Defines the length-prefixed JSON framing used on every control socket,
//! the JSON-RPC 2.0 message model, the bidirectional RPC channel, and the
//! `hello` handshake with capability negotiation.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod channel;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use channel::{IdRange, InboundHandler, InboundRequest, RpcChannel};
pub use error::ProtoError;
pub use frame::{encode_frame, FrameDecoder, MAX_FRAME_LEN};
pub use handshake::{HandshakeConfig, HelloParams, HelloReply, PROTOCOL_VERSION};
pub use message::{Event, EventSink, RpcErrorObject, RpcMessage};
