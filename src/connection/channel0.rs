//! The connection-level state machine, driven on the I/O worker thread.
//!
//! Channel 0 negotiates the connection with the broker and handles every
//! frame addressed to channel id 0 after that: broker-initiated closes, flow
//! blocking notifications and the close handshake.

use std::sync::Arc;

use amq_protocol::frame::{AMQPFrame, ProtocolVersion};
use amq_protocol::protocol::{connection, AMQPClass};
use amq_protocol::types::{AMQPValue, FieldTable};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection::options::ConnectionOptions;
use crate::error::{Error, Result};
use crate::events::{Event, Events};
use crate::frames::OutputBuffer;

/// AMQP protocol version spoken by this client.
const VERSION_MAJOR: u8 = 0;
const VERSION_MINOR: u8 = 9;

const DEFAULT_CLOSE_CODE: u16 = 200;
const DEFAULT_CLOSE_REASON: &str = "Normal Shutdown";

/// Channel 0 lifecycle. The handshake walks the first five states in order;
/// a close from either side ends in `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel0State {
    Closed,
    /// Protocol header sent, awaiting `Connection.Start`
    Opening,
    /// `Connection.StartOk` sent, awaiting `Connection.Tune`
    TuneWait,
    /// `Connection.Open` sent, awaiting `Connection.OpenOk`
    OpenWait,
    Open,
    /// Local `Connection.Close` sent, awaiting `Connection.CloseOk`
    Closing,
}

/// Values agreed during the handshake, shared with the facade.
#[derive(Debug)]
pub(crate) struct Negotiated {
    pub(crate) channel_max: u16,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: u16,
    pub(crate) server_properties: FieldTable,
}

impl Negotiated {
    fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            channel_max: options.channel_max,
            frame_max: options.frame_max,
            heartbeat: options.heartbeat,
            server_properties: FieldTable::default(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Channel0 {
    state: Channel0State,
    options: ConnectionOptions,
    negotiated: Arc<Mutex<Negotiated>>,
    events: Arc<Events>,
    exceptions: Sender<Error>,
}

impl Channel0 {
    pub(crate) fn new(
        options: ConnectionOptions,
        events: Arc<Events>,
        exceptions: Sender<Error>,
    ) -> (Self, Arc<Mutex<Negotiated>>) {
        let negotiated = Arc::new(Mutex::new(Negotiated::from_options(&options)));
        let channel0 = Self {
            state: Channel0State::Closed,
            options,
            negotiated: Arc::clone(&negotiated),
            events,
            exceptions,
        };
        (channel0, negotiated)
    }

    /// Kick off the handshake by sending the 8-byte protocol header.
    pub(crate) fn start(&mut self, out: &mut OutputBuffer) -> Result<()> {
        out.push_frame(&AMQPFrame::ProtocolHeader(ProtocolVersion::amqp_0_9_1()))?;
        self.state = Channel0State::Opening;
        Ok(())
    }

    /// Begin a locally initiated connection close.
    pub(crate) fn begin_close(&mut self, out: &mut OutputBuffer) -> Result<()> {
        if self.state != Channel0State::Open {
            // Never opened or already closing; nothing to negotiate.
            self.events.set(Event::Channel0Closed);
            return Ok(());
        }
        self.state = Channel0State::Closing;
        out.push_frame(&AMQPFrame::Method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::Close(connection::Close {
                reply_code: DEFAULT_CLOSE_CODE,
                reply_text: DEFAULT_CLOSE_REASON.into(),
                class_id: 0,
                method_id: 0,
            })),
        ))
    }

    /// Process a method frame received on channel 0.
    pub(crate) fn on_method(&mut self, class: AMQPClass, out: &mut OutputBuffer) -> Result<()> {
        let method = match class {
            AMQPClass::Connection(method) => method,
            other => {
                warn!(frame = ?other, "unexpected non-connection frame on channel 0");
                return Ok(());
            }
        };
        match method {
            connection::AMQPMethod::Start(start) => self.on_start(start, out),
            connection::AMQPMethod::Tune(tune) => self.on_tune(tune, out),
            connection::AMQPMethod::OpenOk(_) => {
                debug!("connection opened");
                self.state = Channel0State::Open;
                self.events.set(Event::Channel0Opened);
                Ok(())
            }
            connection::AMQPMethod::Close(close) => self.on_remote_close(close, out),
            connection::AMQPMethod::CloseOk(_) => {
                debug!("connection close acknowledged by the broker");
                self.state = Channel0State::Closed;
                self.events.set(Event::Channel0Closed);
                Ok(())
            }
            connection::AMQPMethod::Blocked(blocked) => {
                warn!(reason = blocked.reason.as_str(), "broker blocked the connection");
                self.events.set(Event::ConnectionBlocked);
                self.events.clear(Event::ConnectionUnblocked);
                Ok(())
            }
            connection::AMQPMethod::Unblocked(_) => {
                info!("broker unblocked the connection");
                self.events.clear(Event::ConnectionBlocked);
                self.events.set(Event::ConnectionUnblocked);
                Ok(())
            }
            other => {
                warn!(frame = ?other, "unexpected frame on channel 0");
                Ok(())
            }
        }
    }

    fn on_start(&mut self, start: connection::Start, out: &mut OutputBuffer) -> Result<()> {
        trace!(?start, "received Connection.Start");
        if self.state != Channel0State::Opening {
            warn!(state = ?self.state, "Connection.Start outside the handshake");
            return Ok(());
        }
        if (start.version_major, start.version_minor) != (VERSION_MAJOR, VERSION_MINOR) {
            self.abort(Error::ConnectionReset(format!(
                "AMQP version mismatch: broker speaks {}.{}, expected {}.{}",
                start.version_major, start.version_minor, VERSION_MAJOR, VERSION_MINOR
            )));
            return Ok(());
        }

        self.negotiated.lock().server_properties = start.server_properties;

        out.push_frame(&AMQPFrame::Method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::StartOk(connection::StartOk {
                client_properties: client_properties(),
                mechanism: "PLAIN".into(),
                response: plain_credentials(&self.options.username, &self.options.password).into(),
                locale: self.options.locale.as_str().into(),
            })),
        ))?;
        self.state = Channel0State::TuneWait;
        Ok(())
    }

    fn on_tune(&mut self, tune: connection::Tune, out: &mut OutputBuffer) -> Result<()> {
        trace!(?tune, "received Connection.Tune");
        if self.state != Channel0State::TuneWait {
            warn!(state = ?self.state, "Connection.Tune outside the handshake");
            return Ok(());
        }

        let (channel_max, frame_max, heartbeat) = {
            let mut negotiated = self.negotiated.lock();
            negotiated.channel_max = negotiate(self.options.channel_max, tune.channel_max);
            negotiated.frame_max = negotiate(self.options.frame_max, tune.frame_max);
            negotiated.heartbeat = negotiate(self.options.heartbeat, tune.heartbeat);
            (
                negotiated.channel_max,
                negotiated.frame_max,
                negotiated.heartbeat,
            )
        };
        debug!(channel_max, frame_max, heartbeat, "tuned connection");

        out.push_frame(&AMQPFrame::Method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::TuneOk(connection::TuneOk {
                channel_max,
                frame_max,
                heartbeat,
            })),
        ))?;
        out.push_frame(&AMQPFrame::Method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::Open(connection::Open {
                virtual_host: self.options.virtual_host.as_str().into(),
            })),
        ))?;
        self.state = Channel0State::OpenWait;
        Ok(())
    }

    fn on_remote_close(
        &mut self,
        close: connection::Close,
        out: &mut OutputBuffer,
    ) -> Result<()> {
        warn!(
            code = close.reply_code,
            reason = close.reply_text.as_str(),
            "broker closed the connection"
        );
        self.state = Channel0State::Closed;
        self.abort(Error::from_connection_close(
            close.reply_code,
            close.reply_text.as_str().to_string(),
        ));
        self.events.set(Event::Channel0Closed);
        out.push_frame(&AMQPFrame::Method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::CloseOk(connection::CloseOk {})),
        ))
    }

    /// Push an error for user threads and ask the worker to shut down.
    fn abort(&mut self, error: Error) {
        let _ = self.exceptions.send(error);
        self.events.set(Event::ExceptionRaised);
        self.events.set(Event::SocketClose);
    }
}

/// The tune negotiation rule: the smaller of two nonzero values, otherwise
/// whichever one is nonzero.
fn negotiate<T: Ord + Default + Copy + std::ops::BitOr<Output = T>>(client: T, server: T) -> T {
    if client != T::default() && server != T::default() {
        client.min(server)
    } else {
        client | server
    }
}

fn plain_credentials(username: &str, password: &str) -> String {
    format!("\0{username}\0{password}")
}

fn client_properties() -> FieldTable {
    let mut capabilities = FieldTable::default();
    for capability in [
        "authentication_failure_close",
        "basic.nack",
        "connection.blocked",
        "consumer_cancel_notify",
        "publisher_confirms",
    ] {
        capabilities.insert(capability.into(), AMQPValue::Boolean(true));
    }
    let mut properties = FieldTable::default();
    properties.insert("product".into(), AMQPValue::LongString("lepus".into()));
    properties.insert("platform".into(), AMQPValue::LongString("Rust".into()));
    properties.insert(
        "version".into(),
        AMQPValue::LongString(env!("CARGO_PKG_VERSION").into()),
    );
    properties.insert(
        "information".into(),
        AMQPValue::LongString("https://github.com/lepus-rs/lepus".into()),
    );
    properties.insert("capabilities".into(), AMQPValue::FieldTable(capabilities));
    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_prefers_the_smaller_nonzero_value() {
        assert_eq!(negotiate(65535u16, 100), 100);
        assert_eq!(negotiate(100u16, 65535), 100);
        assert_eq!(negotiate(131072u32, 131072), 131072);
    }

    #[test]
    fn negotiate_falls_back_to_the_nonzero_side() {
        assert_eq!(negotiate(300u16, 0), 300);
        assert_eq!(negotiate(0u16, 60), 60);
        assert_eq!(negotiate(0u16, 0), 0);
    }

    #[test]
    fn plain_credentials_are_null_delimited() {
        assert_eq!(plain_credentials("guest", "guest"), "\0guest\0guest");
    }

    #[test]
    fn client_properties_announce_the_expected_capabilities() {
        let properties = client_properties();
        let capabilities = properties
            .inner()
            .iter()
            .find_map(|(key, value)| match value {
                AMQPValue::FieldTable(table) if key.as_str() == "capabilities" => Some(table),
                _ => None,
            })
            .expect("capabilities table");
        for capability in [
            "authentication_failure_close",
            "basic.nack",
            "connection.blocked",
            "consumer_cancel_notify",
            "publisher_confirms",
        ] {
            let value = capabilities
                .inner()
                .iter()
                .find_map(|(key, value)| (key.as_str() == capability).then_some(value));
            assert_eq!(value, Some(&AMQPValue::Boolean(true)), "{capability}");
        }
    }
}
