//! Length-prefixed framing for envelopes on a byte stream.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of envelope body. The
//! prefix is what makes message boundaries unambiguous; the body itself is MessagePack.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RemoteError, Result};

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame body accepted unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn write_frame_header(body_len: usize) -> [u8; LENGTH_PREFIX_LEN] {
    (body_len as u32).to_be_bytes()
}

/// Writes one complete frame and flushes it.
///
/// The caller must hold the connection's write lock for the duration of the call so frames from
/// concurrent senders never interleave.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if body.len() > max_len || body.len() > u32::MAX as usize {
        return Err(RemoteError::FrameTooLarge {
            len: body.len(),
            max: max_len,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&write_frame_header(body.len()));
    frame.extend_from_slice(body);

    writer
        .write_all(&frame)
        .await
        .map_err(RemoteError::ConnectionWriteFailure)?;
    writer
        .flush()
        .await
        .map_err(RemoteError::ConnectionWriteFailure)
}

/// Reads one frame body.
///
/// Returns `Ok(None)` on a clean end of stream, that is when the peer closed the connection
/// between two frames. End of stream inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    let mut offset = 0;
    while offset < LENGTH_PREFIX_LEN {
        match reader.read(&mut header[offset..]).await {
            Ok(0) if offset == 0 => return Ok(None),
            Ok(0) => return Err(eof_inside_frame()),
            Ok(n) => offset += n,
            Err(err) => return Err(RemoteError::ConnectionLost(err.to_string())),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(RemoteError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            eof_inside_frame()
        } else {
            RemoteError::ConnectionLost(err.to_string())
        }
    })?;

    Ok(Some(body))
}

fn eof_inside_frame() -> RemoteError {
    RemoteError::ConnectionLost("unexpected end of stream inside a frame".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_holds_big_endian_length() {
        let header = write_frame_header(0x0102);
        assert_eq!(header, [0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn frames_are_read_back_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"first", 64).await.unwrap();
        write_frame(&mut client, b"", 64).await.unwrap();
        write_frame(&mut client, b"third", 64).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"third");
        assert!(read_frame(&mut server, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&write_frame_header(10)).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        let err = read_frame(&mut server, 64).await.unwrap_err();
        assert!(matches!(err, RemoteError::ConnectionLost(_)), "{err:?}");
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_both_ways() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let err = write_frame(&mut client, &[0u8; 65], 64).await.unwrap_err();
        assert!(matches!(err, RemoteError::FrameTooLarge { len: 65, max: 64 }));

        client.write_all(&write_frame_header(65)).await.unwrap();
        let err = read_frame(&mut server, 64).await.unwrap_err();
        assert!(matches!(err, RemoteError::FrameTooLarge { len: 65, max: 64 }));
    }
}
