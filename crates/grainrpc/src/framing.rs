//! Length-prefixed framing over byte streams.
//!
//! ```text
//! [u32 BE: len][len bytes of frame]
//! ```

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::error::RpcError;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one frame. Returns `None` on a clean EOF before the length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(RpcError::FrameTooLarge { len, max });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8], max: usize) -> Result<()> {
    let len = payload.len();
    if len > max {
        return Err(RpcError::FrameTooLarge { len, max });
    }
    let prefix = u32::try_from(len).map_err(|_| RpcError::FrameTooLarge { len, max })?;

    writer.write_all(&prefix.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
