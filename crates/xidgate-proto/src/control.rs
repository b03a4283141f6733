//! Control-plane frames between a node's sequencer client and the authority.
//!
//! A node asks for a pre-allocation batch with `p` and receives `q`. Batch
//! grants carry no token: the authority answers `p` frames in the order they
//! arrived, and an empty `q` means the batch could not be served. Single ids
//! (`g`/`a`) and finishes (`f`/`c`) are matched by the requester's token, and
//! either can be refused with an `e` frame carrying an [`ErrorCode`].
//!
//! A `p` frame for zero ids is a connect-time announcement of the node id and
//! is never answered.

use crate::{
    BodyReader, ErrorCode, ProtocolError, ids_len, put_header, put_ids, split_frame, tag::*,
};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use xidgate::{NodeId, RequestToken, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// `p`: request up to `count` ids for `node`'s pool. A zero count only
    /// announces `node`.
    BatchRequest { node: NodeId, count: u32 },
    /// `q`: a granted batch. Empty when the request was refused.
    BatchGrant { ids: Vec<TransactionId> },
    /// `g`: request a single id.
    SingleRequest { token: RequestToken },
    /// `a`: the single id granted for `token`.
    SingleGrant {
        token: RequestToken,
        xid: TransactionId,
    },
    /// `f`: `xid` finished.
    Finish {
        token: RequestToken,
        xid: TransactionId,
        committed: bool,
    },
    /// `c`: the authority recorded the finish.
    FinishAck {
        token: RequestToken,
        xid: TransactionId,
    },
    /// `e`: the request under `token` was refused.
    Reject { token: RequestToken, code: ErrorCode },
    /// `h`: keeps an idle link observable.
    Heartbeat,
}

impl ControlFrame {
    pub const fn tag(&self) -> u8 {
        match self {
            Self::BatchRequest { .. } => BATCH_REQUEST,
            Self::BatchGrant { .. } => BATCH_GRANT,
            Self::SingleRequest { .. } => SINGLE_REQUEST,
            Self::SingleGrant { .. } => SINGLE_GRANT,
            Self::Finish { .. } => FINISH,
            Self::FinishAck { .. } => FINISH_ACK,
            Self::Reject { .. } => REJECT,
            Self::Heartbeat => HEARTBEAT,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::BatchRequest { .. } => 8,
            Self::BatchGrant { ids } => ids_len(ids.len()),
            Self::SingleRequest { .. } => 8,
            Self::SingleGrant { .. } | Self::FinishAck { .. } => 12,
            Self::Finish { .. } => 13,
            Self::Reject { .. } => 9,
            Self::Heartbeat => 0,
        }
    }
}

/// Codec for control-plane frames. Both ends use the same codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((kind, body)) = split_frame(src)? else {
            return Ok(None);
        };
        let mut r = BodyReader::new(kind, body);
        let frame = match kind {
            BATCH_REQUEST => ControlFrame::BatchRequest {
                node: r.u32()?,
                count: r.u32()?,
            },
            BATCH_GRANT => ControlFrame::BatchGrant { ids: r.ids()? },
            SINGLE_REQUEST => ControlFrame::SingleRequest { token: r.u64()? },
            SINGLE_GRANT => ControlFrame::SingleGrant {
                token: r.u64()?,
                xid: r.xid()?,
            },
            FINISH => ControlFrame::Finish {
                token: r.u64()?,
                xid: r.xid()?,
                committed: r.u8()? != 0,
            },
            FINISH_ACK => ControlFrame::FinishAck {
                token: r.u64()?,
                xid: r.xid()?,
            },
            REJECT => ControlFrame::Reject {
                token: r.u64()?,
                code: ErrorCode::try_from(r.u8()?)?,
            },
            HEARTBEAT => ControlFrame::Heartbeat,
            other => {
                return Err(ProtocolError::UnknownTag {
                    tag: char::from(other),
                });
            }
        };
        r.finish()?;
        Ok(Some(frame))
    }
}

impl Encoder<ControlFrame> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: ControlFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_header(dst, frame.tag(), frame.body_len());
        match frame {
            ControlFrame::BatchRequest { node, count } => {
                dst.put_u32(node);
                dst.put_u32(count);
            }
            ControlFrame::BatchGrant { ids } => put_ids(dst, &ids),
            ControlFrame::SingleRequest { token } => dst.put_u64(token),
            ControlFrame::SingleGrant { token, xid } | ControlFrame::FinishAck { token, xid } => {
                dst.put_u64(token);
                dst.put_u32(xid.to_raw());
            }
            ControlFrame::Finish {
                token,
                xid,
                committed,
            } => {
                dst.put_u64(token);
                dst.put_u32(xid.to_raw());
                dst.put_u8(u8::from(committed));
            }
            ControlFrame::Reject { token, code } => {
                dst.put_u64(token);
                dst.put_u8(code as u8);
            }
            ControlFrame::Heartbeat => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xid(raw: u32) -> TransactionId {
        TransactionId::from_raw(raw)
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let frames = vec![
            ControlFrame::BatchRequest { node: 3, count: 64 },
            ControlFrame::BatchGrant {
                ids: vec![xid(u32::MAX), xid(1), xid(2)],
            },
            ControlFrame::Finish {
                token: 9,
                xid: xid(1),
                committed: false,
            },
            ControlFrame::Reject {
                token: 10,
                code: ErrorCode::ServiceShutdown,
            },
            ControlFrame::Heartbeat,
        ];

        let mut buf = BytesMut::new();
        for frame in frames.clone() {
            ControlCodec.encode(frame, &mut buf).unwrap();
        }
        let mut decoded = Vec::new();
        while let Some(frame) = ControlCodec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn finish_frame_layout() {
        let mut buf = BytesMut::new();
        ControlCodec
            .encode(
                ControlFrame::Finish {
                    token: 1,
                    xid: xid(0x0102_0304),
                    committed: true,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            &[b'f', 0, 0, 0, 13, 0, 0, 0, 0, 0, 0, 0, 1, 1, 2, 3, 4, 1]
        );
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut buf = BytesMut::from(&[b'z', 0, 0, 0, 0][..]);
        assert!(matches!(
            ControlCodec.decode(&mut buf),
            Err(ProtocolError::UnknownTag { tag: 'z' })
        ));
    }
}
