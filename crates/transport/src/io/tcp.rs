//! TCP-based transport implementation

use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use eyre::{Context, Result};

use super::FrameTransport;

/// How long a read may block before the receiver loop gets control back
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// TCP connection to a debug server
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wrap an existing stream, configuring the read timeout used for polling
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .context("setting read timeout on TCP stream")?;
        stream
            .set_nodelay(true)
            .context("disabling Nagle's algorithm")?;
        Ok(Self { stream })
    }

    /// Connect to the first reachable address, giving each attempt at most `timeout`
    ///
    /// There is no retry: a refused or timed out connection is reported straight away.
    pub fn connect_timeout(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self> {
        let addresses: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .context("resolving debug server address")?
            .collect();

        let mut last_error = None;
        for address in addresses {
            tracing::debug!(%address, "trying to make connection");
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(stream) => {
                    tracing::debug!(%address, "connection made");
                    return Self::new(stream);
                }
                Err(e) => {
                    tracing::debug!(%address, error = %e, "error making connection");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e).context("connecting to debug server"),
            None => eyre::bail!("debug server address did not resolve to anything"),
        }
    }

    /// A handle that can shut the connection down from another thread
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        let stream = self
            .stream
            .try_clone()
            .context("cloning TCP stream for shutdown")?;
        Ok(ShutdownHandle { stream })
    }
}

impl FrameTransport for TcpTransport {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn split(self) -> Result<(Self::Reader, Self::Writer)> {
        let input = self
            .stream
            .try_clone()
            .context("cloning TCP stream for reader")?;
        Ok((input, self.stream))
    }
}

/// Closes both directions of a connection, unblocking any reader
#[derive(Debug)]
pub struct ShutdownHandle {
    stream: TcpStream,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::debug!(error = %e, "shutting down connection");
        }
    }
}
