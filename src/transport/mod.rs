//! Framing for the two byte streams the service speaks.
//!
//! Client sockets carry protocol frames whose length prefix counts itself
//! (see [`protocol`]). The pipe to a Python child process carries
//! length-prefixed JSON whose prefix counts only the payload.

pub mod protocol;
pub mod stdio_pipe;

pub use stdio_pipe::StdioPipeTransport;

use std::io::{Read, Write};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use protocol::LENGTH_PREFIX_LEN;

/// Default maximum frame size (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum child pipe message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Read one complete frame, prefix included.
///
/// Returns `Ok(None)` on a clean end of stream between frames. A declared
/// length smaller than the prefix or above `max_frame_size` cannot be
/// resynchronised and is reported as an error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    anyhow::ensure!(
        len >= LENGTH_PREFIX_LEN,
        "Frame length {len} is smaller than its own prefix"
    );
    anyhow::ensure!(
        len <= max_frame_size,
        "Frame exceeds max size: {len} > {max_frame_size}"
    );

    let mut frame = vec![0u8; len];
    frame[..LENGTH_PREFIX_LEN].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[LENGTH_PREFIX_LEN..]).await?;
    Ok(Some(frame))
}

/// Write one already-encoded frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a length-prefixed message to a blocking writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub fn send_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-prefixed message from a blocking reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub fn recv_message<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
