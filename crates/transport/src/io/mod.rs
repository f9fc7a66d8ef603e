//! IO abstraction layer for the debug transport
//!
//! [`FrameTransport`] is split into a reader half, owned by the receiver thread of a session,
//! and a writer half, shared by every command issued from caller threads.
//!
//! ```no_run
//! use std::time::Duration;
//! use transport::io::{FrameTransport, TcpTransport};
//!
//! let transport = TcpTransport::connect_timeout("127.0.0.1:12345", Duration::from_secs(1))?;
//! let (reader, writer) = transport.split()?;
//! # Ok::<(), eyre::Error>(())
//! ```

use std::io::{Read, Write};

mod memory;
mod tcp;

pub use memory::{InMemoryReader, InMemoryTransport, InMemoryWriter};
pub use tcp::{READ_POLL_INTERVAL, ShutdownHandle, TcpTransport};

/// A bidirectional byte stream carrying frames
///
/// Readers should return `WouldBlock` or `TimedOut` when no data arrives within their poll
/// interval, so the receiver thread can notice shutdown requests, and `Ok(0)` once the peer
/// has gone.
pub trait FrameTransport: Send + 'static {
    type Reader: Read + Send + 'static;
    type Writer: Write + Send + 'static;

    /// Split the transport into independently usable reader and writer halves
    fn split(self) -> eyre::Result<(Self::Reader, Self::Writer)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transports_implement_trait() {
        fn assert_impl<T: FrameTransport>() {}
        assert_impl::<TcpTransport>();
        assert_impl::<InMemoryTransport>();
    }
}
