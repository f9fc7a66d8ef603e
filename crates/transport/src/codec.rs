//! Length-prefixed framing
//!
//! A frame is a 4 byte little-endian unsigned length followed by exactly that many bytes of
//! UTF-8 JSON encoding a single [`Message`]. A frame is never parsed until all of its bytes
//! have arrived, however many reads that takes.
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::Message;
use crate::error::CodecError;

/// Largest frame we accept, checked before allocating the body
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Consecutive zero-length reads after which the peer is considered gone
pub const MAX_EMPTY_READS: usize = 5;

/// Pause between consecutive empty reads
pub const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(1);

const LENGTH_PREFIX: usize = 4;

/// Serialize a message and prefix it with its length
pub fn encode_frame(message: &Message) -> Result<Bytes, CodecError> {
    let body = serde_json::to_vec(message).map_err(CodecError::Serialize)?;
    let too_large = || CodecError::FrameTooLarge {
        size: body.len(),
        max: MAX_FRAME_SIZE,
    };
    if body.len() > MAX_FRAME_SIZE {
        return Err(too_large());
    }
    let len = u32::try_from(body.len()).map_err(|_| too_large())?;

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
    frame.put_u32_le(len);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode the first frame held in `bytes`, returning `None` if the buffer is empty
pub fn decode_frame(bytes: &[u8]) -> Result<Option<Message>, CodecError> {
    FrameReader::new(bytes).poll_message()
}

/// Encode a message and write it out in one go
pub fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), CodecError>
where
    W: Write + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Result of a single poll of a [`FrameReader`]
#[derive(Debug)]
pub enum PollResult {
    /// A complete message was received
    Message(Message),
    /// No data was available yet
    Idle,
    /// The peer closed the connection
    Closed,
}

/// Reads frames from a byte stream
///
/// The reader does not buffer across calls: once the first byte of a frame has been seen, the
/// call blocks until the whole frame has been read.
pub struct FrameReader<R> {
    input: R,
}

impl<R> FrameReader<R>
where
    R: Read,
{
    pub fn new(input: R) -> Self {
        Self { input }
    }

    pub fn get_ref(&self) -> &R {
        &self.input
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    /// Attempt to read the next frame
    ///
    /// Returns [`PollResult::Idle`] if the underlying stream has no data available (read
    /// timeout or `WouldBlock`) before the first byte of a frame, and [`PollResult::Closed`]
    /// after [`MAX_EMPTY_READS`] consecutive zero-length reads.
    pub fn try_poll_message(&mut self) -> Result<PollResult, CodecError> {
        let mut header = [0u8; LENGTH_PREFIX];
        let mut filled = 0;
        let mut empty_reads = 0;

        while filled < LENGTH_PREFIX {
            match self.input.read(&mut header[filled..]) {
                Ok(0) => {
                    empty_reads += 1;
                    if empty_reads >= MAX_EMPTY_READS {
                        if filled == 0 {
                            tracing::debug!("peer closed the connection");
                            return Ok(PollResult::Closed);
                        }
                        return Err(CodecError::Truncated {
                            read: filled,
                            expected: LENGTH_PREFIX,
                        });
                    }
                    thread::sleep(EMPTY_READ_BACKOFF);
                }
                Ok(n) => {
                    filled += n;
                    empty_reads = 0;
                }
                Err(e) if is_idle(&e) => {
                    if filled == 0 {
                        return Ok(PollResult::Idle);
                    }
                    thread::sleep(EMPTY_READ_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = vec![0u8; len];
        self.read_body(&mut body)?;
        tracing::trace!(len, "received frame");

        let message = serde_json::from_slice(&body).map_err(CodecError::InvalidMessage)?;
        Ok(PollResult::Message(message))
    }

    /// Block until the next message arrives, or return `None` once the peer has gone
    pub fn poll_message(&mut self) -> Result<Option<Message>, CodecError> {
        loop {
            match self.try_poll_message()? {
                PollResult::Message(message) => return Ok(Some(message)),
                PollResult::Closed => return Ok(None),
                PollResult::Idle => thread::sleep(EMPTY_READ_BACKOFF),
            }
        }
    }

    fn read_body(&mut self, body: &mut [u8]) -> Result<(), CodecError> {
        let mut filled = 0;
        let mut empty_reads = 0;

        while filled < body.len() {
            match self.input.read(&mut body[filled..]) {
                Ok(0) => {
                    empty_reads += 1;
                    if empty_reads >= MAX_EMPTY_READS {
                        return Err(CodecError::Truncated {
                            read: filled,
                            expected: body.len(),
                        });
                    }
                    thread::sleep(EMPTY_READ_BACKOFF);
                }
                Ok(n) => {
                    filled += n;
                    empty_reads = 0;
                }
                Err(e) if is_idle(&e) => thread::sleep(EMPTY_READ_BACKOFF),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
