//! The I/O worker: a single background thread that owns the socket for the
//! lifetime of the connection.
//!
//! Each loop iteration drains the shared write queue into the output buffer,
//! flushes what the socket will take, then sleeps in `poll` until the socket
//! has data, a user thread enqueues a frame (waking it through the
//! [`Waker`](mio::Waker)), or the poll timeout elapses. Inbound frames are
//! decoded and routed: channel 0 frames drive the connection state machine
//! in place, heartbeats touch the liveness clock, and everything else is
//! forwarded to the owning channel's inbound queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use amq_protocol::frame::AMQPFrame;
use crossbeam_channel::{Receiver, Sender};
use mio::{Events as PollEvents, Poll, Token};
use tracing::{debug, error, trace, warn};

use crate::channel::ChannelTable;
use crate::connection::channel0::Channel0;
use crate::connection::options::ConnectionOptions;
use crate::error::{Error, Result};
use crate::events::{Event, Events};
use crate::frames::buffer::FrameBuffer;
use crate::frames::{Outbound, OutputBuffer};
use crate::transport::{self, Transport, TransportStats};

pub(crate) const STREAM: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);

/// Upper bound on one poll sleep; shutdown requests and enqueues cut it
/// short through the waker.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a graceful shutdown keeps trying to flush queued writes.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct IoLoop {
    poll: Poll,
    options: ConnectionOptions,
    write_rx: Receiver<Outbound>,
    channels: Arc<ChannelTable>,
    channel0: Channel0,
    events: Arc<Events>,
    exceptions: Sender<Error>,
    stats: Arc<TransportStats>,
    frame_buffer: FrameBuffer,
    outbuf: OutputBuffer,
}

impl IoLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        poll: Poll,
        options: ConnectionOptions,
        write_rx: Receiver<Outbound>,
        channels: Arc<ChannelTable>,
        channel0: Channel0,
        events: Arc<Events>,
        exceptions: Sender<Error>,
        stats: Arc<TransportStats>,
    ) -> Self {
        Self {
            poll,
            options,
            write_rx,
            channels,
            channel0,
            events,
            exceptions,
            stats,
            frame_buffer: FrameBuffer::new(),
            outbuf: OutputBuffer::new(),
        }
    }

    /// Thread entry point. Never panics across the thread boundary: every
    /// failure is pushed into the exception queue before the thread exits.
    pub(crate) fn run(mut self) {
        let mut transport = match transport::connect(&self.options) {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "failed to connect");
                self.fail(e);
                self.teardown();
                return;
            }
        };
        if let Err(e) = transport.register(self.poll.registry(), STREAM) {
            self.fail(e.into());
            self.teardown();
            return;
        }
        self.events.set(Event::SocketOpened);
        debug!(host = %self.options.host, port = self.options.port, "socket opened");

        if let Err(e) = self.channel0.start(&mut self.outbuf) {
            self.fail(e);
            self.teardown();
            return;
        }

        if let Err(e) = self.event_loop(&mut transport) {
            self.fail(e);
        }
        self.shutdown(&mut transport);
        self.teardown();
    }

    fn event_loop(&mut self, transport: &mut Transport) -> Result<()> {
        let mut poll_events = PollEvents::with_capacity(64);
        loop {
            self.drain_write_queue()?;
            self.flush(transport)?;

            if self.events.is_set(Event::SocketClose) {
                debug!("socket close requested");
                return Ok(());
            }

            match self.poll.poll(&mut poll_events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let mut readable = false;
            for event in poll_events.iter() {
                match event.token() {
                    STREAM => readable |= event.is_readable(),
                    // The waker exists purely to cut the poll short.
                    WAKER => trace!("woken"),
                    _ => {}
                }
            }
            if readable {
                self.read_and_dispatch(transport)?;
            }
        }
    }

    fn drain_write_queue(&mut self) -> Result<()> {
        while let Ok(outbound) = self.write_rx.try_recv() {
            match outbound {
                Outbound::Frame(frame) => {
                    trace!(?frame, "writing frame");
                    self.outbuf.push_frame(&frame)?;
                }
                // A batch is marshaled back to back so frames from other
                // channels can never interleave inside it.
                Outbound::Batch(frames) => {
                    trace!(frames = frames.len(), "writing frame batch");
                    for frame in &frames {
                        self.outbuf.push_frame(frame)?;
                    }
                }
                Outbound::ConnectionClose => {
                    self.channel0.begin_close(&mut self.outbuf)?;
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self, transport: &mut Transport) -> Result<()> {
        while !self.outbuf.is_empty() {
            let n = transport.write(self.outbuf.data())?;
            if n == 0 {
                // Backpressure; the poll will report writable again.
                break;
            }
            self.stats.add_bytes_written(n as u64);
            self.outbuf.consume(n);
        }
        transport.flush_pending()
    }

    fn read_and_dispatch(&mut self, transport: &mut Transport) -> Result<()> {
        let outcome = transport.read_into(&mut self.frame_buffer)?;
        if outcome.bytes > 0 {
            self.stats.touch_received();
        }
        while let Some(frame) = self.frame_buffer.next_frame()? {
            self.dispatch(frame)?;
        }
        if outcome.closed {
            return Err(Error::ConnectionReset(
                "the broker closed the socket".to_string(),
            ));
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: AMQPFrame) -> Result<()> {
        match frame {
            // Heartbeats bypass channel routing; receiving one only feeds
            // the liveness clock.
            AMQPFrame::Heartbeat(0) => {
                trace!("received heartbeat");
                self.stats.touch_received();
            }
            AMQPFrame::Heartbeat(channel) => {
                warn!(channel, "heartbeat on a nonzero channel dropped");
            }
            AMQPFrame::ProtocolHeader(version) => {
                return Err(Error::ConnectionReset(format!(
                    "unexpected protocol header for {version:?}"
                )));
            }
            AMQPFrame::Method(0, class) => self.channel0.on_method(class, &mut self.outbuf)?,
            AMQPFrame::Header(0, ..) | AMQPFrame::Body(0, ..) => {
                warn!("content frame on channel 0 dropped");
            }
            AMQPFrame::Method(channel, _)
            | AMQPFrame::Header(channel, ..)
            | AMQPFrame::Body(channel, _) => {
                trace!(channel, "routing frame");
                if !self.channels.route(channel, frame) {
                    warn!(channel, "frame for unknown channel dropped");
                }
            }
        }
        Ok(())
    }

    /// Best-effort flush of whatever is still queued, then close the socket.
    fn shutdown(&mut self, transport: &mut Transport) {
        let _ = self.drain_write_queue();
        let deadline = Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;
        let mut poll_events = PollEvents::with_capacity(8);
        while !self.outbuf.is_empty() && Instant::now() < deadline {
            match self.flush(transport) {
                Ok(()) if self.outbuf.is_empty() => break,
                Ok(()) => {
                    let _ = self
                        .poll
                        .poll(&mut poll_events, Some(Duration::from_millis(50)));
                }
                Err(_) => break,
            }
        }
    }

    fn fail(&mut self, error: Error) {
        error!(error = %error, "I/O worker failed");
        let _ = self.exceptions.send(error);
        self.events.set(Event::ExceptionRaised);
        self.events.set(Event::SocketClose);
    }

    /// Release every waiter: dropping the inbound senders makes blocked
    /// channel reads fail with `ChannelClosed`.
    fn teardown(&mut self) {
        self.channels.clear();
        self.events.set(Event::SocketClosed);
        debug!("I/O worker exited");
    }
}
