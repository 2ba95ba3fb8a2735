//! Inbound byte accumulator for the I/O worker.
//!
//! Bytes arrive from the socket in arbitrary slices; frames are only handed
//! out once a complete one is buffered. Completeness is decided from the
//! 7-byte frame prologue before the codec is asked to decode, so a partial
//! read is never a decode error.

use amq_protocol::frame::{parse_frame, AMQPFrame};
use bytes::BytesMut;

use crate::error::{Error, Result};

/// Byte offset of the big-endian payload length within the frame prologue.
const LENGTH_OFFSET: usize = 3;
/// Type byte + channel + length.
const PROLOGUE_LEN: usize = 7;
/// The frame-end octet after the payload.
const FRAME_END_LEN: usize = 1;

#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Try to decode the next complete frame, leaving any trailing partial
    /// frame in the buffer.
    pub(crate) fn next_frame(&mut self) -> Result<Option<AMQPFrame>> {
        // A broker that rejects the protocol version answers the client's
        // 8-byte header with its own and closes the socket.
        if self.buf.starts_with(b"AMQP") {
            if self.buf.len() < 8 {
                return Ok(None);
            }
            let header = self.buf.split_to(8);
            return Err(Error::ConnectionReset(format!(
                "broker rejected the protocol version, offered {}.{}.{}",
                header[5], header[6], header[7]
            )));
        }

        if self.buf.len() < PROLOGUE_LEN {
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes([
            self.buf[LENGTH_OFFSET],
            self.buf[LENGTH_OFFSET + 1],
            self.buf[LENGTH_OFFSET + 2],
            self.buf[LENGTH_OFFSET + 3],
        ]) as usize;
        let total = PROLOGUE_LEN + payload_len + FRAME_END_LEN;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame_bytes = self.buf.split_to(total);
        match parse_frame(&frame_bytes[..]) {
            Ok((rest, frame)) if rest.is_empty() => Ok(Some(frame)),
            Ok((rest, _)) => Err(Error::MalformedFrame(format!(
                "{} undecoded bytes inside a frame boundary",
                rest.len()
            ))),
            Err(e) => Err(Error::MalformedFrame(format!("{e:?}"))),
        }
    }

    #[cfg(test)]
    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use amq_protocol::protocol::{channel, AMQPClass};

    use super::*;
    use crate::frames::marshal_into;

    fn sample_frames() -> Vec<AMQPFrame> {
        vec![
            AMQPFrame::Method(
                1,
                AMQPClass::Channel(channel::AMQPMethod::OpenOk(channel::OpenOk {})),
            ),
            AMQPFrame::Heartbeat(0),
            AMQPFrame::Body(1, vec![0xAB; 300]),
        ]
    }

    #[test]
    fn reassembles_frames_fed_one_byte_at_a_time() {
        let frames = sample_frames();
        let mut wire = Vec::new();
        for frame in &frames {
            wire = marshal_into(wire, frame).unwrap();
        }

        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        for byte in wire {
            buffer.extend(&[byte]);
            while let Some(frame) = buffer.next_frame().unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn leaves_partial_frames_buffered() {
        let wire = marshal_into(Vec::new(), &AMQPFrame::Body(2, vec![1, 2, 3, 4])).unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.extend(&wire[..wire.len() - 1]);
        assert!(buffer.next_frame().unwrap().is_none());
        buffer.extend(&wire[wire.len() - 1..]);
        assert_eq!(
            buffer.next_frame().unwrap(),
            Some(AMQPFrame::Body(2, vec![1, 2, 3, 4]))
        );
    }

    #[test]
    fn server_protocol_header_is_a_version_rejection() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"AMQP\x00\x00\x08\x00");
        match buffer.next_frame() {
            Err(Error::ConnectionReset(text)) => assert!(text.contains("0.8.0")),
            other => panic!("expected a reset, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_malformed_frame() {
        let mut buffer = FrameBuffer::new();
        // type 200 is not an AMQP frame type; length decodes as zero
        buffer.extend(&[200, 0, 0, 0, 0, 0, 0, 0xCE]);
        assert!(matches!(
            buffer.next_frame(),
            Err(Error::MalformedFrame(_))
        ));
    }
}
