//! Framed decoder turning a journal byte stream into [`Entry`] values.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::context::Context;

use super::entry::{Entry, MAGIC};
use super::error::Error;

const READ_CHUNK: usize = 8192;
/// magic + opcode + dbid + txid + shard_cnt + slot + lsn + argc
const HEADER_LEN: usize = 1 + 1 + 4 + 8 + 4 + 8 + 8 + 4;

/// Determine how many bytes the next complete frame needs, without
/// consuming `buf`. Returns `Ok(None)` when more data is required.
fn frame_len(buf: &[u8]) -> Result<Option<usize>, Error> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut cur = buf;
    if cur.get_u8() != MAGIC {
        return Err(Error::Malformed("bad magic byte"));
    }
    let _opcode = cur.get_u8();
    let _dbid = cur.get_u32_le();
    let _txid = cur.get_u64_le();
    let _shard_cnt = cur.get_u32_le();
    let _slot = cur.get_i64_le();
    let _lsn = cur.get_u64_le();
    let argc = cur.get_u32_le();
    if argc > 1_000_000 {
        return Err(Error::Malformed("argc out of range"));
    }

    let mut consumed = HEADER_LEN;
    for _ in 0..argc {
        if cur.len() < 4 {
            return Ok(None);
        }
        let len = cur.get_u32_le() as usize;
        consumed += 4;
        if cur.len() < len {
            return Ok(None);
        }
        cur.advance(len);
        consumed += len;
    }

    Ok(Some(consumed))
}

/// Wraps an `AsyncRead` byte source and yields framed [`Entry`] values.
pub struct JournalReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> JournalReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Read the next framed entry. `Err(Error::ShortRead)` means the stream
    /// closed cleanly at an entry boundary; any other error is unrecoverable
    /// and the caller must abort the stream.
    pub async fn read_entry(&mut self, cntx: &Context) -> Result<Entry, Error> {
        loop {
            if let Some(len) = frame_len(&self.buf)? {
                if self.buf.len() >= len {
                    let mut frame = self.buf.split_to(len);
                    return Entry::decode(&mut frame);
                }
            }

            if !cntx.is_running() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "reader cancelled",
                )));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Err(Error::ShortRead)
                } else {
                    Err(Error::Malformed("stream closed mid-frame"))
                };
            }
            trace!(n, "read bytes from journal stream");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
