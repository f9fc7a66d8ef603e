//! Wire protocol for debugging a running petri net
//!
//! This crate contains the message catalog, the length-prefixed frame codec and the byte
//! transports the debug client speaks over.
pub mod bindings;
pub mod codec;
pub mod error;
pub mod io;
pub mod message;

pub use codec::{FrameReader, PollResult, decode_frame, encode_frame, write_frame};
pub use error::{CodecError, ProtocolError};
pub use io::{FrameTransport, InMemoryTransport, TcpTransport};
pub use message::{Ack, CLEAN_DETACH_REASON, Incoming, Message, StateCount};

