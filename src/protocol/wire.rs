//! Frame transmission over stream transports.
//!
//! Reading blocks until a whole frame is available or the stream ends. A
//! truncated or corrupt frame is reported as an error, and the caller must treat
//! the stream as unusable: there is no way to find the next frame boundary.
//!
//! Writers encode first and hold the connection's write lock only for
//! [`write_frame`], so frames from concurrent callers never interleave and a
//! message that cannot be encoded never touches the stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::message::{check_length, decode_metadata, Message, HEADER_LEN};

/// Reads a single frame from a stream.
///
/// A clean end of stream before the first header byte surfaces as an
/// `UnexpectedEof` I/O error, the same as a truncated frame.
pub async fn read_message<R>(src: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0_u8; HEADER_LEN];
    src.read_exact(&mut header).await?;
    let mut msg = Message::from_header(&header)?;

    let metadata_len = src.read_u32().await? as usize;
    check_length("metadata", metadata_len)?;
    let mut metadata = vec![0_u8; metadata_len];
    src.read_exact(&mut metadata).await?;
    msg.metadata = decode_metadata(&metadata)?;

    let payload_len = src.read_u32().await? as usize;
    check_length("payload", payload_len)?;
    msg.payload.resize(payload_len, 0);
    src.read_exact(&mut msg.payload).await?;

    trace!("Read frame seq:{}, type:{:?}, payload:{}", msg.seq, msg.message_type, payload_len);
    Ok(msg)
}

/// Like [`read_message`], failing with a timeout error when `deadline` elapses first.
pub async fn read_message_timeout<R>(src: &mut R, deadline: Option<Duration>) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match deadline {
        Some(d) => tokio::time::timeout(d, read_message(src))
            .await
            .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))?,
        None => read_message(src).await,
    }
}

/// Encodes and writes one frame, then flushes.
///
/// An encode failure leaves the stream untouched.
pub async fn write_message<W>(dest: &mut W, msg: &Message, deadline: Option<Duration>) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = msg.encode()?;
    trace!("Writing frame seq:{}, type:{:?}, length:{}", msg.seq, msg.message_type, frame.len());
    write_frame(dest, &frame, deadline).await
}

/// Writes an already encoded frame, then flushes.
///
/// Any error may leave part of the frame on the stream, which is then unusable.
pub async fn write_frame<W>(dest: &mut W, frame: &[u8], deadline: Option<Duration>) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let write = async {
        dest.write_all(frame).await?;
        dest.flush().await
    };
    match deadline {
        Some(d) => tokio::time::timeout(d, write)
            .await
            .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??,
        None => write.await?,
    }
    Ok(())
}
