use std::net::TcpListener;

use eyre::Result;

/// Find a local TCP port that is currently free
pub fn get_random_tcp_port() -> Result<u16> {
    for _ in 0..50 {
        match TcpListener::bind("127.0.0.1:0").and_then(|listener| listener.local_addr()) {
            Ok(addr) => return Ok(addr.port()),
            Err(e) => {
                tracing::warn!(%e, "binding");
            }
        }
    }

    eyre::bail!("could not get free port");
}
