//! Length-delimited message framing over TCP.
//!
//! A frame is an unsigned varint length followed by that many payload bytes.
//! The length uses the same 7-bit-group encoding as the in-payload varints
//! and may occupy at most five bytes on the wire.
//!
//! [`MAX_FRAME_SIZE`] (2 MiB) protects against unbounded allocation from
//! malformed or malicious length prefixes: an oversized declared length is
//! rejected *before* any payload byte is read, and the connection is torn
//! down. A malformed length encoding is treated the same way, because once
//! the length is unreadable the stream can never be re-synchronised.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload size (2 MiB).
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Reads one frame into `buf`, replacing its contents.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame,
/// and `InvalidData` for an over-long length encoding or a declared length
/// above [`MAX_FRAME_SIZE`]. All errors from this function are
/// connection-terminating; frame-local decode errors happen one layer up.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<()> {
    let mut len = 0u64;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        len |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            break;
        }
        if i == 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length encoding exceeds five bytes",
            ));
        }
    }
    if len > MAX_FRAME_SIZE as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"),
        ));
    }
    buf.clear();
    buf.resize(len as usize, 0);
    reader.read_exact(buf).await?;
    Ok(())
}

/// Writes one frame: minimal varint length, payload, flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame of {} bytes exceeds limit of {MAX_FRAME_SIZE}",
                payload.len()
            ),
        ));
    }
    let mut prefix = [0u8; 5];
    let mut n = 0;
    let mut len = payload.len() as u64;
    loop {
        let group = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            prefix[n] = group;
            n += 1;
            break;
        }
        prefix[n] = group | 0x80;
        n += 1;
    }
    writer.write_all(&prefix[..n]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn roundtrip_single_frame() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        write_frame(&mut tx, b"hello, server!").await.unwrap();

        let mut buf = Vec::new();
        read_frame(&mut rx, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello, server!");
    }

    #[tokio::test]
    async fn roundtrip_empty_frame() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        write_frame(&mut tx, b"").await.unwrap();

        let mut buf = vec![0xaa];
        read_frame(&mut rx, &mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn frames_survive_arbitrary_read_splits() {
        // Concatenate several frames and dribble them through one byte at a
        // time; the reader must recover each original message.
        let messages: Vec<&[u8]> = vec![b"first", b"", b"third message", &[0u8; 200]];
        let mut wire = Vec::new();
        for msg in &messages {
            write_frame(&mut wire, msg).await.unwrap();
        }

        let (mut tx, mut rx) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            for byte in wire {
                tx.write_all(&[byte]).await.unwrap();
            }
        });

        let mut buf = Vec::new();
        for expected in &messages {
            read_frame(&mut rx, &mut buf).await.unwrap();
            assert_eq!(&buf, expected);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_oversized_declared_length() {
        // 3 × 2²⁰ declared, no payload behind it: the reader must fail on the
        // prefix alone. 0x30_0000 as a varint is 80 80 c0 01.
        let prefix = [0x80u8, 0x80, 0xc0, 0x01];
        let (mut tx, mut rx) = tokio::io::duplex(16);
        tx.write_all(&prefix).await.unwrap();

        let mut buf = Vec::new();
        let err = read_frame(&mut rx, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_six_byte_length_encoding() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        tx.write_all(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01])
            .await
            .unwrap();

        let mut buf = Vec::new();
        let err = read_frame(&mut rx, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_oversized_write() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        let mut sink = Vec::new();
        let err = write_frame(&mut sink, &big).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn eof_mid_frame() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        // Declared length 10, only 3 payload bytes, then EOF.
        tx.write_all(&[10, 1, 2, 3]).await.unwrap();
        drop(tx);

        let mut buf = Vec::new();
        let err = read_frame(&mut rx, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
