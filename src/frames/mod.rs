//! Glue between the crate and the `amq-protocol` frame codec: marshaling
//! into the worker's output buffer, the outbound write-queue items, and the
//! wake-on-enqueue handle user threads write through.

pub(crate) mod buffer;

use std::sync::Arc;

use amq_protocol::frame::{gen_frame, AMQPFrame};
use amq_protocol::protocol::basic::AMQPProperties;
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::Sender;
use mio::Waker;

use crate::error::{Error, Result};

/// Frame overhead on the wire: 1 byte type, 2 bytes channel, 4 bytes length
/// and the frame-end octet.
pub(crate) const FRAME_OVERHEAD: usize = 8;

/// The `basic` class id used in content headers.
pub(crate) const BASIC_CLASS_ID: u16 = 60;

/// An entry in the shared write queue drained by the I/O worker.
///
/// A whole publish (method + content header + body frames) travels as one
/// [`Outbound::Batch`] so the worker can keep it contiguous on the wire.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A single frame
    Frame(AMQPFrame),
    /// Frames that must be written back to back without interleaving
    Batch(Vec<AMQPFrame>),
    /// Ask channel 0 to run its close handshake
    ConnectionClose,
}

/// Multi-producer handle to the write queue. Enqueues an [`Outbound`] and
/// wakes the I/O worker out of its poll so the frame does not sit in the
/// queue until the next timeout.
#[derive(Debug, Clone)]
pub(crate) struct FrameSink {
    tx: Sender<Outbound>,
    waker: Arc<Waker>,
}

impl FrameSink {
    pub(crate) fn new(tx: Sender<Outbound>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Enqueue for the worker. Fails with [`Error::ChannelClosed`] once the
    /// worker has exited and dropped the receiving side.
    pub(crate) fn send(&self, outbound: Outbound) -> Result<()> {
        self.tx.send(outbound).map_err(|_| Error::ChannelClosed)?;
        let _ = self.waker.wake();
        Ok(())
    }

    /// Wake the worker without enqueuing anything, e.g. after setting a
    /// shutdown signal.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// Marshal one frame onto the end of `buf`.
pub(crate) fn marshal_into(buf: Vec<u8>, frame: &AMQPFrame) -> Result<Vec<u8>> {
    cookie_factory::gen(gen_frame(frame), buf)
        .map(|(buf, _)| buf)
        .map_err(|e| Error::MalformedFrame(format!("{e:?}")))
}

/// Staging area for marshaled outbound bytes, drained to the socket by the
/// worker as the socket accepts them.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl OutputBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marshal a frame onto the end of the buffer.
    pub(crate) fn push_frame(&mut self, frame: &AMQPFrame) -> Result<()> {
        self.bytes = marshal_into(std::mem::take(&mut self.bytes), frame)?;
        Ok(())
    }

    /// Bytes not yet written to the socket.
    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes[self.cursor..]
    }

    /// Record that `n` bytes from the front of [`data`](Self::data) reached
    /// the socket.
    pub(crate) fn consume(&mut self, n: usize) {
        self.cursor += n;
        debug_assert!(self.cursor <= self.bytes.len());
        if self.cursor == self.bytes.len() {
            self.bytes.clear();
            self.cursor = 0;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cursor == self.bytes.len()
    }
}

/// Build the frames for one content-bearing method: the method frame, a
/// content header carrying the properties and total body size, and as many
/// body frames as the negotiated frame size requires.
pub(crate) fn content_frames(
    channel_id: u16,
    method: AMQPClass,
    properties: AMQPProperties,
    body: &[u8],
    frame_max: u32,
) -> Vec<AMQPFrame> {
    let header = amq_protocol::frame::AMQPContentHeader {
        class_id: BASIC_CLASS_ID,
        weight: 0,
        body_size: body.len() as u64,
        properties,
    };
    let capacity = body_frame_capacity(frame_max);
    let mut frames = Vec::with_capacity(2 + body.len() / capacity + 1);
    frames.push(AMQPFrame::Method(channel_id, method));
    frames.push(AMQPFrame::Header(channel_id, BASIC_CLASS_ID, Box::new(header)));
    frames.extend(
        body.chunks(capacity)
            .map(|chunk| AMQPFrame::Body(channel_id, chunk.to_vec())),
    );
    frames
}

/// Largest body payload that fits in one frame of the negotiated size.
pub(crate) fn body_frame_capacity(frame_max: u32) -> usize {
    frame_max as usize - FRAME_OVERHEAD
}

#[cfg(test)]
mod tests {
    use amq_protocol::protocol::basic;

    use super::*;

    fn publish(channel: u16) -> AMQPClass {
        AMQPClass::Basic(basic::AMQPMethod::Publish(basic::Publish {
            exchange: "events".into(),
            routing_key: "audit".into(),
            mandatory: false,
            immediate: false,
        }))
    }

    #[test]
    fn content_frames_follow_the_ceil_law() {
        let frame_max = 131072u32;
        let capacity = body_frame_capacity(frame_max);
        for body_len in [0usize, 1, capacity - 1, capacity, capacity + 1, 204800] {
            let body = vec![0u8; body_len];
            let frames = content_frames(7, publish(7), AMQPProperties::default(), &body, frame_max);
            let body_frames = body_len.div_ceil(capacity);
            assert_eq!(frames.len(), 2 + body_frames, "body_len={body_len}");
        }
    }

    #[test]
    fn content_frames_carry_the_full_body_in_order() {
        let frame_max = 4096u32;
        let body: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let frames = content_frames(3, publish(3), AMQPProperties::default(), &body, frame_max);

        match &frames[1] {
            AMQPFrame::Header(3, BASIC_CLASS_ID, header) => {
                assert_eq!(header.body_size, body.len() as u64);
            }
            other => panic!("expected content header, got {other:?}"),
        }

        let mut reassembled = Vec::new();
        for frame in &frames[2..] {
            match frame {
                AMQPFrame::Body(3, chunk) => {
                    assert!(chunk.len() <= body_frame_capacity(frame_max));
                    reassembled.extend_from_slice(chunk);
                }
                other => panic!("expected body frame, got {other:?}"),
            }
        }
        assert_eq!(reassembled, body);
    }

    #[test]
    fn marshal_appends_to_the_buffer() {
        let buf = marshal_into(Vec::new(), &AMQPFrame::Heartbeat(0)).unwrap();
        let len = buf.len();
        assert!(len > 0);
        let buf = marshal_into(buf, &AMQPFrame::Heartbeat(0)).unwrap();
        assert_eq!(buf.len(), len * 2);
    }
}
