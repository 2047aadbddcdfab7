use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Maximum bytes a length varint may occupy.
///
/// Four 7-bit groups cover lengths up to 256 MiB, far beyond any sane
/// protocol-id line; a fifth byte means the prefix is garbage.
const MAX_VARINT_LEN: usize = 4;

/// Encode a protocol id as a length-prefixed line.
///
/// Wire format:
/// ```text
/// [uvarint: len(id) + 1][id: UTF-8 bytes]['\n']
/// ```
pub fn encode(protocol: &str) -> BytesMut {
    let payload_len = protocol.len() + 1;
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN + payload_len);
    put_uvarint(&mut buf, payload_len as u64);
    buf.put_slice(protocol.as_bytes());
    buf.put_u8(b'\n');
    buf
}

/// Append an unsigned LEB128 varint to the buffer.
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8(value as u8 | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read an unsigned LEB128 varint from the stream.
pub async fn read_uvarint<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    for shift in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await.map_err(map_eof)?;
        value |= u64::from(byte & 0x7f) << (7 * shift as u32);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Framing(format!(
        "length varint exceeds {} bytes",
        MAX_VARINT_LEN
    )))
}

/// Read one protocol-id frame from the stream.
///
/// Reads a varint length, then exactly that many bytes, strips the trailing
/// newline and returns the id. Fails with [`Error::Framing`] on a malformed
/// varint, a declared length above `max_len`, a stream that ends before the
/// payload completes, a payload without the trailing newline, or non-UTF-8
/// payload bytes.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let declared = read_uvarint(reader).await? as usize;
    if declared > max_len {
        return Err(Error::Framing(format!(
            "declared length {} exceeds limit {}",
            declared, max_len
        )));
    }

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    if payload.pop() != Some(b'\n') {
        return Err(Error::Framing("frame not newline-terminated".to_string()));
    }

    let id = String::from_utf8(payload)
        .map_err(|_| Error::Framing("frame is not valid UTF-8".to_string()))?;
    trace!("read frame: {:?}", id);
    Ok(id)
}

/// Write one protocol-id frame to the stream and flush it.
pub async fn write_frame<W>(writer: &mut W, protocol: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode(protocol);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    trace!("wrote frame: {:?}", protocol);
    Ok(())
}

/// A peer hanging up mid-frame is a framing violation, not a plain I/O error.
fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Framing("stream ended inside a frame".to_string())
    } else {
        Error::Io(e)
    }
}
