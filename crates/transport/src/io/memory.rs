//! In-memory transport used to exercise the protocol without sockets

use std::io::{self, Read, Write};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use super::FrameTransport;

/// One end of an in-memory connection
///
/// Every `write` call is delivered as a separate chunk, so a writer can deliberately split a
/// frame to exercise partial reads.
///
/// ```
/// use std::io::{Read, Write};
/// use transport::io::{FrameTransport, InMemoryTransport};
///
/// let (client, server) = InMemoryTransport::pair();
/// let (_client_reader, mut client_writer) = client.split()?;
/// let (mut server_reader, _server_writer) = server.split()?;
///
/// client_writer.write_all(b"ping")?;
/// let mut buf = [0u8; 4];
/// server_reader.read_exact(&mut buf)?;
/// assert_eq!(&buf, b"ping");
/// # Ok::<(), eyre::Error>(())
/// ```
pub struct InMemoryTransport {
    reader: InMemoryReader,
    writer: InMemoryWriter,
}

/// Reader half: reports `WouldBlock` while no chunk is pending and EOF once the peer's writer
/// has been dropped
pub struct InMemoryReader {
    pending: Vec<u8>,
    offset: usize,
    rx: Receiver<Vec<u8>>,
}

/// Writer half
pub struct InMemoryWriter {
    tx: Sender<Vec<u8>>,
}

impl InMemoryTransport {
    /// Create two connected ends: bytes written to one are read from the other
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = crossbeam_channel::unbounded();
        let (right_tx, left_rx) = crossbeam_channel::unbounded();

        (Self::new(left_rx, left_tx), Self::new(right_rx, right_tx))
    }

    fn new(rx: Receiver<Vec<u8>>, tx: Sender<Vec<u8>>) -> Self {
        Self {
            reader: InMemoryReader {
                pending: Vec::new(),
                offset: 0,
                rx,
            },
            writer: InMemoryWriter { tx },
        }
    }
}

impl FrameTransport for InMemoryTransport {
    type Reader = InMemoryReader;
    type Writer = InMemoryWriter;

    fn split(self) -> eyre::Result<(Self::Reader, Self::Writer)> {
        Ok((self.reader, self.writer))
    }
}

impl Read for InMemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.pending.len() {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(TryRecvError::Empty) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "no data available",
                    ));
                }
                Err(TryRecvError::Disconnected) => return Ok(0),
            }
        }

        let available = &self.pending[self.offset..];
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        self.offset += len;
        Ok(len)
    }
}

impl Write for InMemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_on_empty_channel() {
        let (client, _server) = InMemoryTransport::pair();
        let (mut reader, _writer) = client.split().unwrap();

        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn eof_once_peer_is_dropped() {
        let (client, server) = InMemoryTransport::pair();
        let (mut reader, _writer) = client.split().unwrap();
        drop(server);

        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn chunks_are_read_across_boundaries() -> io::Result<()> {
        let (client, server) = InMemoryTransport::pair();
        let (mut reader, _client_writer) = client.split().unwrap();
        let (_server_reader, mut writer) = server.split().unwrap();

        writer.write_all(b"First")?;
        writer.write_all(b"Second")?;

        let mut buf = vec![0u8; 7];
        reader.read_exact(&mut buf)?;
        assert_eq!(&buf, b"FirstSe");

        let mut buf = vec![0u8; 4];
        reader.read_exact(&mut buf)?;
        assert_eq!(&buf, b"cond");

        Ok(())
    }

    #[test]
    fn write_fails_once_peer_is_dropped() {
        let (client, server) = InMemoryTransport::pair();
        let (_reader, mut writer) = client.split().unwrap();
        drop(server);

        let err = writer.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
