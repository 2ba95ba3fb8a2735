//! Heartbeat monitor thread.
//!
//! Fires every half interval. A tick where the worker wrote nothing emits
//! one heartbeat frame on channel 0; a connection that has heard nothing for
//! `interval * MAX_MISSED` seconds is declared dead: a reset error is pushed
//! for user threads and the worker is asked to close the socket.

use std::sync::Arc;
use std::time::Duration;

use amq_protocol::frame::AMQPFrame;
use crossbeam_channel::Sender;
use tracing::{debug, error, trace};

use crate::error::Error;
use crate::events::{Event, Events};
use crate::frames::{FrameSink, Outbound};
use crate::transport::TransportStats;

/// Missed-interval multiplier before the connection is considered dead.
const MAX_MISSED: u32 = 3;

#[derive(Debug)]
pub(crate) struct Monitor {
    interval: Duration,
    sink: FrameSink,
    stats: Arc<TransportStats>,
    events: Arc<Events>,
    exceptions: Sender<Error>,
}

impl Monitor {
    pub(crate) fn new(
        interval_secs: u16,
        sink: FrameSink,
        stats: Arc<TransportStats>,
        events: Arc<Events>,
        exceptions: Sender<Error>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(u64::from(interval_secs)),
            sink,
            stats,
            events,
            exceptions,
        }
    }

    /// Thread entry point. Returns when the socket is torn down or the
    /// liveness threshold trips.
    pub(crate) fn run(self) {
        let tick = self.interval / 2;
        let threshold = self.interval * MAX_MISSED;
        debug!(?tick, "heartbeat monitor started");

        let mut last_written = self.stats.bytes_written();
        loop {
            // The tick sleep doubles as the shutdown wait.
            if self.events.wait(Event::SocketClosed, tick) {
                debug!("heartbeat monitor stopped");
                return;
            }
            if self.events.is_set(Event::SocketClose) {
                return;
            }

            let written = self.stats.bytes_written();
            if written == last_written {
                trace!("idle tick, sending heartbeat");
                if self.sink.send(Outbound::Frame(AMQPFrame::Heartbeat(0))).is_err() {
                    return;
                }
            }
            last_written = written;

            let silence = self.stats.since_last_received();
            if silence >= threshold {
                error!(?silence, "no heartbeat from the broker, resetting");
                let _ = self.exceptions.send(Error::ConnectionReset(format!(
                    "no heartbeat in {} seconds",
                    silence.as_secs()
                )));
                self.events.set(Event::ExceptionRaised);
                self.events.set(Event::SocketClose);
                self.sink.wake();
                return;
            }
        }
    }
}
