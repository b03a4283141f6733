//! Snapshot broadcast frames.
//!
//! A subscriber opens the stream with a `Q` frame carrying
//! [`START_STREAM_COMMAND`]. The server answers `k`, then exactly one `s`
//! bootstrap, then a stream of `a` (assign) and `c` (commit) batches with `h`
//! heartbeats while idle. The subscriber may report how many frames it has
//! consumed with `c`, answer heartbeats with `d`, and ends the stream with `X`.

use crate::{BodyReader, ProtocolError, ids_len, put_header, put_ids, split_frame, tag::*};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use xidgate::{BootstrapSnapshot, SnapshotDelta, TransactionId};

/// The only command that starts a snapshot stream.
pub const START_STREAM_COMMAND: &str = "START_SNAPSHOT_STREAM";

/// Frames a subscriber sends to the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberRequest {
    /// `Q`: a text command. Only [`START_STREAM_COMMAND`] is accepted.
    Command(String),
    /// `X`: stop streaming and close once buffered frames are flushed.
    Stop,
    /// `c`: number of frames consumed so far.
    Position(u64),
    /// `d`: reply to a heartbeat.
    KeepAlive,
}

impl SubscriberRequest {
    pub fn start() -> Self {
        Self::Command(START_STREAM_COMMAND.to_string())
    }
}

/// Frames the broadcaster sends to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// `k`: the stream-start command was accepted.
    Accepted,
    /// `s`: the running set at the moment streaming began.
    Bootstrap(BootstrapSnapshot),
    /// `a`: newly issued ids.
    Assign(Vec<TransactionId>),
    /// `c`: newly finished ids.
    Commit(Vec<TransactionId>),
    /// `h`: nothing happened for one heartbeat interval.
    Heartbeat,
}

impl From<SnapshotDelta> for StreamFrame {
    fn from(delta: SnapshotDelta) -> Self {
        match delta {
            SnapshotDelta::Assign(ids) => Self::Assign(ids),
            SnapshotDelta::Commit(ids) => Self::Commit(ids),
        }
    }
}

impl StreamFrame {
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Accepted => ACCEPTED,
            Self::Bootstrap(_) => BOOTSTRAP,
            Self::Assign(_) => ASSIGN,
            Self::Commit(_) => COMMIT,
            Self::Heartbeat => HEARTBEAT,
        }
    }

    /// Serialized size including the header.
    pub fn encoded_len(&self) -> usize {
        crate::HEADER_LEN + self.body_len()
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Accepted | Self::Heartbeat => 0,
            Self::Bootstrap(snap) => 8 + ids_len(snap.xip.len()),
            Self::Assign(ids) | Self::Commit(ids) => ids_len(ids.len()),
        }
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        put_header(dst, self.tag(), self.body_len());
        match self {
            Self::Accepted | Self::Heartbeat => {}
            Self::Bootstrap(snap) => {
                dst.put_u32(snap.xmin.to_raw());
                dst.put_u32(snap.xmax.to_raw());
                put_ids(dst, &snap.xip);
            }
            Self::Assign(ids) | Self::Commit(ids) => put_ids(dst, ids),
        }
    }

    /// Serializes once for fan-out to many subscribers.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Server side of the broadcast stream: decodes [`SubscriberRequest`]s,
/// encodes [`StreamFrame`]s or pre-serialized frame bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = SubscriberRequest;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((kind, body)) = split_frame(src)? else {
            return Ok(None);
        };
        let mut r = BodyReader::new(kind, body);
        let request = match kind {
            COMMAND => SubscriberRequest::Command(r.text()?),
            STOP => SubscriberRequest::Stop,
            POSITION => SubscriberRequest::Position(r.u64()?),
            KEEPALIVE => SubscriberRequest::KeepAlive,
            other => {
                return Err(ProtocolError::UnknownTag {
                    tag: char::from(other),
                });
            }
        };
        r.finish()?;
        Ok(Some(request))
    }
}

impl Encoder<StreamFrame> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: StreamFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.write_to(dst);
        Ok(())
    }
}

impl Encoder<Bytes> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Subscriber side of the broadcast stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = StreamFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((kind, body)) = split_frame(src)? else {
            return Ok(None);
        };
        let mut r = BodyReader::new(kind, body);
        let frame = match kind {
            ACCEPTED => StreamFrame::Accepted,
            BOOTSTRAP => StreamFrame::Bootstrap(BootstrapSnapshot {
                xmin: r.xid()?,
                xmax: r.xid()?,
                xip: r.ids()?,
            }),
            ASSIGN => StreamFrame::Assign(r.ids()?),
            COMMIT => StreamFrame::Commit(r.ids()?),
            HEARTBEAT => StreamFrame::Heartbeat,
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

impl Encoder<SubscriberRequest> for ClientCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        request: SubscriberRequest,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match request {
            SubscriberRequest::Command(command) => {
                put_header(dst, COMMAND, command.len());
                dst.extend_from_slice(command.as_bytes());
            }
            SubscriberRequest::Stop => put_header(dst, STOP, 0),
            SubscriberRequest::Position(position) => {
                put_header(dst, POSITION, 8);
                dst.put_u64(position);
            }
            SubscriberRequest::KeepAlive => put_header(dst, KEEPALIVE, 0),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn xids(raw: &[u32]) -> Vec<TransactionId> {
        raw.iter().copied().map(TransactionId::from_raw).collect()
    }

    #[test]
    fn bootstrap_keeps_id_order() {
        let snap = BootstrapSnapshot {
            xmin: TransactionId::from_raw(u32::MAX),
            xmax: TransactionId::from_raw(4),
            xip: xids(&[u32::MAX, 1, 3]),
        };
        let mut buf = BytesMut::from(&StreamFrame::Bootstrap(snap.clone()).to_bytes()[..]);
        assert_eq!(
            ClientCodec.decode(&mut buf).unwrap(),
            Some(StreamFrame::Bootstrap(snap))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn pre_serialized_bytes_match_frame_encoding() {
        let frame = StreamFrame::Commit(xids(&[8, 9]));
        let mut direct = BytesMut::new();
        ServerCodec.encode(frame.clone(), &mut direct).unwrap();
        let mut shared = BytesMut::new();
        ServerCodec.encode(frame.to_bytes(), &mut shared).unwrap();
        assert_eq!(direct, shared);
        assert_eq!(direct.len(), frame.encoded_len());
    }

    #[test]
    fn server_rejects_server_frames() {
        let mut buf = BytesMut::from(&StreamFrame::Accepted.to_bytes()[..]);
        assert!(matches!(
            ServerCodec.decode(&mut buf),
            Err(ProtocolError::UnknownTag { tag: 'k' })
        ));
    }

    #[tokio::test]
    async fn subscriber_requests_cross_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(256);
        let mut tx = FramedWrite::new(client, ClientCodec);
        let mut rx = FramedRead::new(server, ServerCodec);

        tx.send(SubscriberRequest::start()).await.unwrap();
        tx.send(SubscriberRequest::Position(42)).await.unwrap();
        tx.send(SubscriberRequest::KeepAlive).await.unwrap();
        tx.send(SubscriberRequest::Stop).await.unwrap();
        drop(tx);

        let got: Vec<_> = rx.by_ref().map(Result::unwrap).collect().await;
        assert_eq!(
            got,
            vec![
                SubscriberRequest::Command(START_STREAM_COMMAND.to_string()),
                SubscriberRequest::Position(42),
                SubscriberRequest::KeepAlive,
                SubscriberRequest::Stop,
            ]
        );
    }
}
