//! Length-prefixed framing for peer traffic.
//!
//! Wire format: a 4-byte big-endian u32 length followed by a bincode payload.
//! Requests are [`CmdLine`](crate::CmdLine) values and responses are
//! [`Reply`](crate::Reply) values; streaming responses are simply several
//! reply frames in a row.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on a single frame. Migration dumps carry whole values, so
/// this is far larger than a typical command.
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the connection cleanly between frames.
    #[error("connection closed")]
    Closed,

    #[error("frame size {0} exceeds limit {MAX_FRAME_SIZE}")]
    TooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes one frame and flushes it.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(data.len()));
    }
    w.write_all(&(data.len() as u32).to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one frame. A clean EOF before the length prefix is reported as
/// [`FrameError::Closed`].
pub async fn read_frame<R, T>(r: &mut R) -> Result<T, FrameError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(bincode::deserialize(&data)?)
}
