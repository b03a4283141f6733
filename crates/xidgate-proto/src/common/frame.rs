//! Frame layout shared by both protocols.
//!
//! ```text
//! +-----+----------------+----------------------+
//! | tag | body_len (u32) | body (body_len bytes)|
//! +-----+----------------+----------------------+
//! ```
//!
//! All integers are big-endian. An id list is a `u32` count followed by that
//! many `u32` ids.

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use xidgate::TransactionId;

/// Bytes in a frame header: the tag plus the body length.
pub const HEADER_LEN: usize = 1 + 4;

/// Largest body a peer may announce.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Most ids a sender puts in one id-list frame. Batch grants are clamped to
/// it and larger deltas are split, which keeps every id frame far below
/// [`MAX_BODY_LEN`].
pub const MAX_IDS_PER_FRAME: usize = 64 * 1024;

/// Splits one complete frame off the front of `src`.
///
/// Returns `Ok(None)` until the whole frame has been buffered, reserving room
/// for the rest of it.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the header announces a body
/// over [`MAX_BODY_LEN`].
pub fn split_frame(src: &mut BytesMut) -> Result<Option<(u8, Bytes)>, ProtocolError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = src[0];
    let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
    if len > MAX_BODY_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_BODY_LEN,
        });
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }
    src.advance(HEADER_LEN);
    Ok(Some((tag, src.split_to(len).freeze())))
}

/// Appends a frame header announcing `body_len` bytes.
pub fn put_header(dst: &mut BytesMut, tag: u8, body_len: usize) {
    dst.reserve(HEADER_LEN + body_len);
    dst.put_u8(tag);
    // Encoders only build bodies well under MAX_BODY_LEN.
    dst.put_u32(body_len as u32);
}

/// Encoded size of an id list.
pub const fn ids_len(count: usize) -> usize {
    4 + count * TransactionId::SIZE
}

pub fn put_ids(dst: &mut BytesMut, ids: &[TransactionId]) {
    dst.put_u32(ids.len() as u32);
    for id in ids {
        dst.put_u32(id.to_raw());
    }
}

/// Checked field reader over one frame body.
pub struct BodyReader {
    tag: u8,
    body: Bytes,
}

impl BodyReader {
    pub const fn new(tag: u8, body: Bytes) -> Self {
        Self { tag, body }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.body.remaining() < n {
            return Err(ProtocolError::Truncated {
                tag: char::from(self.tag),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.body.get_u8())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.body.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.body.get_u64())
    }

    pub fn xid(&mut self) -> Result<TransactionId, ProtocolError> {
        self.u32().map(TransactionId::from_raw)
    }

    pub fn ids(&mut self) -> Result<Vec<TransactionId>, ProtocolError> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(TransactionId::SIZE))?;
        Ok((0..count)
            .map(|_| TransactionId::from_raw(self.body.get_u32()))
            .collect())
    }

    /// Takes the rest of the body as UTF-8 text.
    pub fn text(&mut self) -> Result<String, ProtocolError> {
        let rest = self.body.split_off(0);
        String::from_utf8(rest.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Fails if any bytes are left unread.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.body.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes {
                tag: char::from(self.tag),
                extra,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_a_complete_frame() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, b'q', ids_len(2));
        put_ids(
            &mut buf,
            &[TransactionId::from_raw(5), TransactionId::from_raw(6)],
        );
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(split_frame(&mut partial).unwrap().is_none());

        let mut complete = full;
        let (tag, body) = split_frame(&mut complete).unwrap().unwrap();
        assert_eq!(tag, b'q');
        assert!(complete.is_empty());

        let mut reader = BodyReader::new(tag, body);
        assert_eq!(
            reader.ids().unwrap(),
            vec![TransactionId::from_raw(5), TransactionId::from_raw(6)]
        );
        reader.finish().unwrap();
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'q');
        buf.put_u32(MAX_BODY_LEN as u32 + 1);
        assert!(matches!(
            split_frame(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn id_count_beyond_body_is_truncated() {
        let mut body = BytesMut::new();
        body.put_u32(3);
        body.put_u32(1);
        let mut reader = BodyReader::new(b'q', body.freeze());
        assert!(matches!(
            reader.ids(),
            Err(ProtocolError::Truncated { tag: 'q' })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut reader = BodyReader::new(b'a', Bytes::from_static(&[0, 0, 0, 1, 9]));
        assert_eq!(reader.u32().unwrap(), 1);
        assert!(matches!(
            reader.finish(),
            Err(ProtocolError::TrailingBytes { tag: 'a', extra: 1 })
        ));
    }
}
