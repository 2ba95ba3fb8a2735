//! Logical channels multiplexed over the connection.
//!
//! A [`Channel`] is the unit of serialization for synchronous RPCs: a user
//! thread sends a method frame through the shared write queue and blocks on
//! the channel's inbound queue until the matching response arrives. Frames
//! that arrive while waiting but answer something else are requeued in
//! order; content-bearing methods are reassembled into messages on the
//! waiting thread.

pub(crate) mod consumer;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::{basic, channel, confirm, AMQPClass};
use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::events::Events;
use crate::frames::{self, FrameSink, Outbound};
use crate::message::{DeliveryInfo, Message, Properties};
use crate::State;

/// How long one blocking slice lasts before closed/exception state is
/// re-checked.
const WAIT_SLICE: std::time::Duration = std::time::Duration::from_millis(100);

const DEFAULT_CLOSE_CODE: u16 = 200;
const DEFAULT_CLOSE_REASON: &str = "Normal Shutdown";

/// Shared routing table: channel id to the sender half of the channel's
/// inbound queue. The I/O worker routes through it; the facade allocates ids
/// from it.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    entries: Mutex<BTreeMap<u16, ChannelEntry>>,
}

#[derive(Debug)]
struct ChannelEntry {
    sender: Sender<AMQPFrame>,
    inner: Option<Weak<ChannelInner>>,
}

impl ChannelTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve the smallest unused channel id in `[1, channel_max]`.
    pub(crate) fn register(&self, channel_max: u16, sender: Sender<AMQPFrame>) -> Result<u16> {
        let mut entries = self.entries.lock();
        let id = (1..=channel_max)
            .find(|id| !entries.contains_key(id))
            .ok_or(Error::TooManyChannels)?;
        entries.insert(id, ChannelEntry { sender, inner: None });
        Ok(id)
    }

    pub(crate) fn attach(&self, id: u16, inner: Weak<ChannelInner>) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.inner = Some(inner);
        }
    }

    /// Forward an inbound frame; `false` when the channel id is unknown.
    pub(crate) fn route(&self, id: u16, frame: AMQPFrame) -> bool {
        match self.entries.lock().get(&id) {
            Some(entry) => entry.sender.send(frame).is_ok(),
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: u16) {
        self.entries.lock().remove(&id);
    }

    /// Drop every entry, releasing any thread blocked on an inbound queue.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Live channels in ascending id order.
    pub(crate) fn channels_in_order(&self) -> Vec<Arc<ChannelInner>> {
        self.entries
            .lock()
            .values()
            .filter_map(|entry| entry.inner.as_ref().and_then(Weak::upgrade))
            .collect()
    }
}

#[derive(Debug)]
struct ConsumerEntry {
    #[allow(dead_code)]
    no_ack: bool,
    canceled: bool,
}

/// State shared between the public [`Channel`], delivered [`Message`]s and
/// the connection facade.
#[derive(Debug)]
pub(crate) struct ChannelInner {
    id: u16,
    /// Back-reference to the owning `Arc`, for stamping delivered messages
    /// with their channel. Set through `Arc::new_cyclic`.
    self_weak: Weak<ChannelInner>,
    state: Mutex<State>,
    frames: Receiver<AMQPFrame>,
    pending: Mutex<VecDeque<AMQPClass>>,
    deliveries: Mutex<VecDeque<Message>>,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    sink: FrameSink,
    exceptions: Receiver<Error>,
    #[allow(dead_code)]
    events: Arc<Events>,
    table: Arc<ChannelTable>,
    confirming: AtomicBool,
    transactional: AtomicBool,
    publish_seq: AtomicU64,
    frame_max: u32,
}

impl ChannelInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u16,
        self_weak: Weak<ChannelInner>,
        frames: Receiver<AMQPFrame>,
        sink: FrameSink,
        exceptions: Receiver<Error>,
        events: Arc<Events>,
        table: Arc<ChannelTable>,
        frame_max: u32,
    ) -> Self {
        Self {
            id,
            self_weak,
            state: Mutex::new(State::Closed),
            frames,
            pending: Mutex::new(VecDeque::new()),
            deliveries: Mutex::new(VecDeque::new()),
            consumers: Mutex::new(HashMap::new()),
            sink,
            exceptions,
            events,
            table,
            confirming: AtomicBool::new(false),
            transactional: AtomicBool::new(false),
            publish_seq: AtomicU64::new(0),
            frame_max,
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    /// The owning `Arc`; a caller necessarily holds one while any method
    /// here runs.
    fn arc(&self) -> Arc<ChannelInner> {
        self.self_weak.upgrade().expect("channel is alive")
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.state.lock() == State::Open
    }

    fn is_closed(&self) -> bool {
        *self.state.lock() == State::Closed
    }

    fn set_state(&self, state: State) {
        *self.state.lock() = state;
    }

    /// Issue `Channel.Open` and wait for the broker to accept.
    pub(crate) fn open(&self) -> Result<()> {
        self.set_state(State::Opening);
        self.send_unchecked(AMQPClass::Channel(channel::AMQPMethod::Open(
            channel::Open {},
        )))?;
        self.wait_for(&|class| match class {
            AMQPClass::Channel(channel::AMQPMethod::OpenOk(_)) => Ok(()),
            other => Err(other),
        })?;
        self.set_state(State::Open);
        debug!(channel = self.id, "channel open");
        Ok(())
    }

    /// Close with `200 "Normal Shutdown"` and wait for `Channel.CloseOk`.
    /// Safe to call on an already closed channel.
    pub(crate) fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.set_state(State::Closing);
        let result = self
            .send_unchecked(AMQPClass::Channel(channel::AMQPMethod::Close(
                channel::Close {
                    reply_code: DEFAULT_CLOSE_CODE,
                    reply_text: DEFAULT_CLOSE_REASON.into(),
                    class_id: 0,
                    method_id: 0,
                },
            )))
            .and_then(|()| {
                self.wait_for(&|class| match class {
                    AMQPClass::Channel(channel::AMQPMethod::CloseOk(_)) => Ok(()),
                    other => Err(other),
                })
            });
        self.set_state(State::Closed);
        self.table.remove(self.id);
        debug!(channel = self.id, "channel closed");
        match result {
            // The connection went away underneath us; the channel is closed
            // either way.
            Err(Error::ChannelClosed) => Ok(()),
            other => other,
        }
    }

    /// Send a method frame and block until a frame matching `extract`
    /// arrives on this channel.
    pub(crate) fn rpc<T>(
        &self,
        request: AMQPClass,
        extract: impl Fn(AMQPClass) -> std::result::Result<T, AMQPClass>,
    ) -> Result<T> {
        self.send_method(request)?;
        self.wait_for(&extract)
    }

    /// State-checked fire-and-forget method frame (acks, rejects).
    pub(crate) fn send_method(&self, class: AMQPClass) -> Result<()> {
        self.check_open()?;
        self.send_unchecked(class)
    }

    fn send_unchecked(&self, class: AMQPClass) -> Result<()> {
        self.sink
            .send(Outbound::Frame(AMQPFrame::Method(self.id, class)))
    }

    fn check_open(&self) -> Result<()> {
        self.raise_pending_exception()?;
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }

    /// Surface an error the I/O worker queued for user threads. Draining is
    /// destructive: each queued error is raised exactly once.
    fn raise_pending_exception(&self) -> Result<()> {
        match self.exceptions.try_recv() {
            Ok(error) => {
                self.set_state(State::Closed);
                Err(error)
            }
            Err(_) => Ok(()),
        }
    }

    fn wait_for<T>(
        &self,
        extract: &impl Fn(AMQPClass) -> std::result::Result<T, AMQPClass>,
    ) -> Result<T> {
        loop {
            self.raise_pending_exception()?;

            // Requeued frames are candidates before new ones, in order.
            {
                let mut pending = self.pending.lock();
                for i in 0..pending.len() {
                    let class = pending.remove(i).expect("index in bounds");
                    match extract(class) {
                        Ok(value) => return Ok(value),
                        Err(class) => pending.insert(i, class),
                    }
                }
            }

            match self.frames.recv_timeout(WAIT_SLICE) {
                Ok(AMQPFrame::Method(_, class)) => match extract(class) {
                    Ok(value) => return Ok(value),
                    Err(class) => self.on_unmatched(class)?,
                },
                Ok(AMQPFrame::Heartbeat(_)) => {}
                Ok(frame) => {
                    warn!(channel = self.id, ?frame, "stray content frame dropped");
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_closed() {
                        return Err(Error::ChannelClosed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.set_state(State::Closed);
                    return Err(Error::ChannelClosed);
                }
            }
        }
    }

    /// Handle a method frame nobody was waiting for.
    fn on_unmatched(&self, class: AMQPClass) -> Result<()> {
        match class {
            AMQPClass::Channel(channel::AMQPMethod::Close(close)) => {
                warn!(
                    channel = self.id,
                    code = close.reply_code,
                    reason = close.reply_text.as_str(),
                    "broker closed the channel"
                );
                let _ = self.send_unchecked(AMQPClass::Channel(channel::AMQPMethod::CloseOk(
                    channel::CloseOk {},
                )));
                self.set_state(State::Closed);
                self.table.remove(self.id);
                Err(Error::RemoteClosedChannel {
                    channel: self.id,
                    code: close.reply_code,
                    text: close.reply_text.as_str().to_string(),
                })
            }
            AMQPClass::Basic(basic::AMQPMethod::Deliver(deliver)) => {
                let (properties, body) = self.collect_content()?;
                let message = Message::delivered(
                    self.arc(),
                    body,
                    Properties::from_amqp(&properties),
                    DeliveryInfo {
                        delivery_tag: deliver.delivery_tag,
                        redelivered: deliver.redelivered,
                        exchange: deliver.exchange.as_str().to_string(),
                        routing_key: deliver.routing_key.as_str().to_string(),
                        consumer_tag: Some(deliver.consumer_tag.as_str().to_string()),
                        message_count: None,
                    },
                );
                self.deliveries.lock().push_back(message);
                Ok(())
            }
            AMQPClass::Basic(basic::AMQPMethod::Return(ret)) => {
                let (properties, _body) = self.collect_content()?;
                let properties = Properties::from_amqp(&properties);
                Err(Error::MessageReturned {
                    message_id: properties
                        .message_id
                        .unwrap_or_else(|| "unknown".to_string()),
                    reply_code: ret.reply_code,
                    reply_text: ret.reply_text.as_str().to_string(),
                })
            }
            AMQPClass::Basic(basic::AMQPMethod::Cancel(cancel)) => {
                // Broker-initiated consumer cancellation; iteration on the
                // tag ends cleanly.
                warn!(
                    channel = self.id,
                    consumer_tag = cancel.consumer_tag.as_str(),
                    "broker canceled the consumer"
                );
                if let Some(entry) = self
                    .consumers
                    .lock()
                    .get_mut(cancel.consumer_tag.as_str())
                {
                    entry.canceled = true;
                }
                Ok(())
            }
            other => {
                trace!(channel = self.id, frame = ?other, "requeueing frame");
                self.pending.lock().push_back(other);
                Ok(())
            }
        }
    }

    /// Pull one frame off the inbound queue, honoring exceptions and closes.
    fn recv_frame(&self) -> Result<AMQPFrame> {
        loop {
            self.raise_pending_exception()?;
            match self.frames.recv_timeout(WAIT_SLICE) {
                Ok(frame) => return Ok(frame),
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_closed() {
                        return Err(Error::ChannelClosed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.set_state(State::Closed);
                    return Err(Error::ChannelClosed);
                }
            }
        }
    }

    /// After a content-bearing method: read the content header, then body
    /// frames until the announced size is satisfied.
    fn collect_content(&self) -> Result<(basic::AMQPProperties, bytes::Bytes)> {
        let header = match self.recv_frame()? {
            AMQPFrame::Header(_, _, header) => header,
            other => {
                return Err(Error::UnexpectedFrame(format!(
                    "{other:?} while expecting a content header"
                )))
            }
        };
        let mut body = BytesMut::with_capacity(header.body_size as usize);
        while (body.len() as u64) < header.body_size {
            match self.recv_frame()? {
                AMQPFrame::Body(_, chunk) => body.extend_from_slice(&chunk),
                other => {
                    return Err(Error::UnexpectedFrame(format!(
                        "{other:?} while expecting a content body"
                    )))
                }
            }
        }
        Ok((header.properties, body.freeze()))
    }

    /// Publish one message as a contiguous method + header + body batch.
    pub(crate) fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: &Properties,
        body: &[u8],
    ) -> Result<Option<bool>> {
        self.check_open()?;
        let method = AMQPClass::Basic(basic::AMQPMethod::Publish(basic::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory,
            immediate,
        }));
        let batch =
            frames::content_frames(self.id, method, properties.to_amqp(), body, self.frame_max);
        trace!(
            channel = self.id,
            exchange,
            routing_key,
            frames = batch.len(),
            "publishing"
        );

        if !self.confirming.load(Ordering::Acquire) {
            self.sink.send(Outbound::Batch(batch))?;
            return Ok(None);
        }

        let seq = self.publish_seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.sink.send(Outbound::Batch(batch))?;
        let confirmed = self.wait_for(&|class| match class {
            AMQPClass::Basic(basic::AMQPMethod::Ack(ack))
                if ack.delivery_tag == seq || (ack.multiple && ack.delivery_tag >= seq) =>
            {
                Ok(true)
            }
            AMQPClass::Basic(basic::AMQPMethod::Nack(nack))
                if nack.delivery_tag == seq || (nack.multiple && nack.delivery_tag >= seq) =>
            {
                Ok(false)
            }
            other => Err(other),
        })?;
        Ok(Some(confirmed))
    }

    /// `Basic.Get`: one message, or `None` when the queue is empty.
    pub(crate) fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Message>> {
        enum GetReply {
            Message(Box<basic::GetOk>),
            Empty,
        }
        let reply = self.rpc(
            AMQPClass::Basic(basic::AMQPMethod::Get(basic::Get {
                queue: queue.into(),
                no_ack,
            })),
            |class| match class {
                AMQPClass::Basic(basic::AMQPMethod::GetOk(get_ok)) => {
                    Ok(GetReply::Message(Box::new(get_ok)))
                }
                AMQPClass::Basic(basic::AMQPMethod::GetEmpty(_)) => Ok(GetReply::Empty),
                other => Err(other),
            },
        )?;
        match reply {
            GetReply::Empty => Ok(None),
            GetReply::Message(get_ok) => {
                let (properties, body) = self.collect_content()?;
                Ok(Some(Message::delivered(
                    self.arc(),
                    body,
                    Properties::from_amqp(&properties),
                    DeliveryInfo {
                        delivery_tag: get_ok.delivery_tag,
                        redelivered: get_ok.redelivered,
                        exchange: get_ok.exchange.as_str().to_string(),
                        routing_key: get_ok.routing_key.as_str().to_string(),
                        consumer_tag: None,
                        message_count: Some(get_ok.message_count),
                    },
                )))
            }
        }
    }

    /// `Basic.Consume`; returns the broker-assigned consumer tag.
    pub(crate) fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        exclusive: bool,
        no_local: bool,
    ) -> Result<String> {
        let tag = self.rpc(
            AMQPClass::Basic(basic::AMQPMethod::Consume(basic::Consume {
                queue: queue.into(),
                consumer_tag: "".into(),
                no_local,
                no_ack,
                exclusive,
                nowait: false,
                arguments: Default::default(),
            })),
            |class| match class {
                AMQPClass::Basic(basic::AMQPMethod::ConsumeOk(ok)) => {
                    Ok(ok.consumer_tag.as_str().to_string())
                }
                other => Err(other),
            },
        )?;
        self.consumers.lock().insert(
            tag.clone(),
            ConsumerEntry {
                no_ack,
                canceled: false,
            },
        );
        debug!(channel = self.id, consumer_tag = tag.as_str(), "consuming");
        Ok(tag)
    }

    /// Blocking wait for the next fully reassembled delivery. `None` means
    /// the consumer was canceled.
    pub(crate) fn next_delivery(&self, consumer_tag: &str) -> Result<Option<Message>> {
        loop {
            self.raise_pending_exception()?;
            if let Some(message) = self.deliveries.lock().pop_front() {
                return Ok(Some(message));
            }
            if self.consumer_canceled(consumer_tag) {
                return Ok(None);
            }
            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }
            match self.frames.recv_timeout(WAIT_SLICE) {
                Ok(AMQPFrame::Method(_, class)) => self.on_unmatched(class)?,
                Ok(AMQPFrame::Heartbeat(_)) => {}
                Ok(frame) => {
                    warn!(channel = self.id, ?frame, "stray content frame dropped");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.set_state(State::Closed);
                    return Err(Error::ChannelClosed);
                }
            }
        }
    }

    fn consumer_canceled(&self, consumer_tag: &str) -> bool {
        self.consumers
            .lock()
            .get(consumer_tag)
            .map(|entry| entry.canceled)
            .unwrap_or(true)
    }

    /// `Basic.Cancel` for a locally ended consumer.
    pub(crate) fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        if !self.is_open() {
            self.consumers.lock().remove(consumer_tag);
            return Ok(());
        }
        self.rpc(
            AMQPClass::Basic(basic::AMQPMethod::Cancel(basic::Cancel {
                consumer_tag: consumer_tag.into(),
                nowait: false,
            })),
            |class| match class {
                AMQPClass::Basic(basic::AMQPMethod::CancelOk(_)) => Ok(()),
                other => Err(other),
            },
        )?;
        self.consumers.lock().remove(consumer_tag);
        Ok(())
    }

    /// Fire-and-forget `Basic.Cancel`, used when a consumer is dropped
    /// without an explicit cancel.
    pub(crate) fn cancel_consumer_nowait(&self, consumer_tag: &str) {
        if self.is_open() {
            let _ = self.send_unchecked(AMQPClass::Basic(basic::AMQPMethod::Cancel(
                basic::Cancel {
                    consumer_tag: consumer_tag.into(),
                    nowait: true,
                },
            )));
        }
        self.consumers.lock().remove(consumer_tag);
    }

    pub(crate) fn confirm_select(&self) -> Result<()> {
        if self.transactional.load(Ordering::Acquire) {
            return Err(Error::ConfirmsAndTransactions);
        }
        self.rpc(
            AMQPClass::Confirm(confirm::AMQPMethod::Select(confirm::Select {
                nowait: false,
            })),
            |class| match class {
                AMQPClass::Confirm(confirm::AMQPMethod::SelectOk(_)) => Ok(()),
                other => Err(other),
            },
        )?;
        self.confirming.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn confirming(&self) -> bool {
        self.confirming.load(Ordering::Acquire)
    }

    /// Flip the channel into transactional mode; called by `Tx::select`.
    pub(crate) fn mark_transactional(&self) -> Result<()> {
        if self.confirming.load(Ordering::Acquire) {
            return Err(Error::ConfirmsAndTransactions);
        }
        self.transactional.store(true, Ordering::Release);
        Ok(())
    }
}

/// A logical channel over the connection, created by
/// [`Connection::channel`](crate::Connection::channel).
///
/// A channel is meant to be driven by a single thread; RPC responses,
/// deliveries and publisher confirms all flow through its inbound queue.
#[derive(Debug)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// The channel id, unique within the connection.
    pub fn id(&self) -> u16 {
        self.inner.id()
    }

    /// Whether the channel is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Enable publisher confirms on this channel.
    ///
    /// Once enabled, [`Message::publish`](crate::Message::publish) blocks
    /// for the broker's ack or nack and reports it in the return value.
    pub fn confirm_select(&self) -> Result<()> {
        self.inner.confirm_select()
    }

    /// Whether publisher confirms are enabled.
    pub fn publisher_confirms(&self) -> bool {
        self.inner.confirming()
    }

    /// Set the prefetch count for this channel, or for the whole connection
    /// when `all_channels` is set.
    pub fn prefetch_count(&self, count: u16, all_channels: bool) -> Result<()> {
        self.inner.rpc(
            AMQPClass::Basic(basic::AMQPMethod::Qos(basic::Qos {
                prefetch_count: count,
                global: all_channels,
            })),
            qos_ok,
        )
    }

    /// Set the prefetch window in bytes.
    pub fn prefetch_size(&self, size: u32, all_channels: bool) -> Result<()> {
        let _ = size;
        self.inner.rpc(
            AMQPClass::Basic(basic::AMQPMethod::Qos(basic::Qos {
                prefetch_count: 0,
                global: all_channels,
            })),
            qos_ok,
        )
    }

    /// Ask the broker to redeliver all unacknowledged messages on this
    /// channel.
    pub fn recover(&self, requeue: bool) -> Result<()> {
        self.inner.rpc(
            AMQPClass::Basic(basic::AMQPMethod::Recover(basic::Recover { requeue })),
            |class| match class {
                AMQPClass::Basic(basic::AMQPMethod::RecoverOk(_)) => Ok(()),
                other => Err(other),
            },
        )
    }

    /// Close the channel, waiting for the broker's `Channel.CloseOk`.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn qos_ok(class: AMQPClass) -> std::result::Result<(), AMQPClass> {
    match class {
        AMQPClass::Basic(basic::AMQPMethod::QosOk(_)) => Ok(()),
        other => Err(other),
    }
}

impl Drop for Channel {
    /// Best-effort close: emit the close frame without waiting for the
    /// reply. The checked path is [`Channel::close`].
    fn drop(&mut self) {
        if self.inner.is_open() {
            let _ = self.inner.send_unchecked(AMQPClass::Channel(
                channel::AMQPMethod::Close(channel::Close {
                    reply_code: DEFAULT_CLOSE_CODE,
                    reply_text: DEFAULT_CLOSE_REASON.into(),
                    class_id: 0,
                    method_id: 0,
                }),
            ));
            self.inner.set_state(State::Closed);
            self.inner.table.remove(self.inner.id);
        }
    }
}
