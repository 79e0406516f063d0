//! Length prefixed postcard frames over any async byte stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

/// Largest body accepted in either direction
pub const MAX_RPC_FRAME: usize = 64 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Read one frame; `None` when the peer closed between frames
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_RPC_FRAME {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(postcard::from_bytes(&body)?))
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = postcard::to_allocvec(value)?;
    if body.len() > MAX_RPC_FRAME {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcRequest;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_survive_the_stream() {
        let (mut client, mut server) = duplex(256);
        write_frame(&mut client, &RpcRequest::TimerExpired(7)).await.unwrap();
        write_frame(&mut client, &RpcRequest::FromReader(vec![1, 2, 3]))
            .await
            .unwrap();
        drop(client);

        let first: Option<RpcRequest> = read_frame(&mut server).await.unwrap();
        assert_eq!(first, Some(RpcRequest::TimerExpired(7)));
        let second: Option<RpcRequest> = read_frame(&mut server).await.unwrap();
        assert_eq!(second, Some(RpcRequest::FromReader(vec![1, 2, 3])));
        let end: Option<RpcRequest> = read_frame(&mut server).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&((MAX_RPC_FRAME as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        let result: Result<Option<RpcRequest>, _> = read_frame(&mut server).await;
        assert!(matches!(result, Err(RpcError::FrameTooLarge(_))));
    }
}
