/// Streaming reads and writes of wire-protocol primitives
///
/// All integers on the wire are little-endian. Short reads surface as
/// `io::ErrorKind::UnexpectedEof` from `read_exact`; callers translate that
/// into a clean close where the protocol allows one.
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{MsgHeader, HEADER_LEN};

/// Read a little-endian i32 at `pos`.
pub fn get_i32(b: &[u8], pos: usize) -> i32 {
    i32::from_le_bytes([b[pos], b[pos + 1], b[pos + 2], b[pos + 3]])
}

/// Write a little-endian i32 at `pos`.
pub fn set_i32(b: &mut [u8], pos: usize, v: i32) {
    b[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

/// Read one message header from the stream.
pub async fn read_header<R>(r: &mut R) -> io::Result<MsgHeader>
where
    R: AsyncRead + Unpin,
{
    let mut b = [0u8; HEADER_LEN as usize];
    r.read_exact(&mut b).await?;
    Ok(MsgHeader::from_wire(&b))
}

/// Write one message header to the stream.
pub async fn write_header<W>(w: &mut W, h: &MsgHeader) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&h.to_wire()).await
}

/// Copy exactly `n` bytes from `src` to `dst`, erroring on early EOF.
pub async fn copy_exact<R, W>(dst: &mut W, src: &mut R, n: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = src.take(n);
    let copied = tokio::io::copy(&mut limited, dst).await?;
    if copied < n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended after {} of {} bytes", copied, n),
        ));
    }
    Ok(copied)
}

/// Read and throw away exactly `n` bytes from `src`.
pub async fn discard_exact<R>(src: &mut R, n: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();
    copy_exact(&mut sink, src, n).await?;
    Ok(())
}

/// Relay one whole message from `src` to `dst`: the header followed by
/// exactly `message_length - 16` body bytes. A header-only message is valid
/// and copies no body.
pub async fn copy_message<R, W>(dst: &mut W, src: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let h = read_header(src).await?;
    write_header(dst, &h).await?;
    copy_exact(dst, src, h.body_length().max(0) as u64).await?;
    Ok(())
}

/// Read an entire BSON document: a 4-byte length prefix, then `length - 4`
/// more bytes. The returned buffer includes the prefix and can be handed to
/// the BSON codec as-is.
pub async fn read_document<R>(r: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut size_raw = [0u8; 4];
    r.read_exact(&mut size_raw).await?;
    let size = get_i32(&size_raw, 0);
    // A document is at least its length prefix plus the trailing NUL.
    if size < 5 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid document length {}", size),
        ));
    }
    let mut doc = vec![0u8; size as usize];
    set_i32(&mut doc, 0, size);
    r.read_exact(&mut doc[4..]).await?;
    Ok(doc)
}

/// Read a NUL-terminated string, returning the bytes *including* the
/// terminator.
pub async fn read_cstring<R>(r: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut b = Vec::new();
    let mut one = [0u8; 1];
    loop {
        r.read_exact(&mut one).await?;
        b.push(one[0]);
        if one[0] == 0 {
            return Ok(b);
        }
    }
}
