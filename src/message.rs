//! The user-facing message: an opaque byte body plus the fixed set of AMQP
//! basic properties, and the delivery metadata the broker attaches when a
//! message comes back down a channel.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use amq_protocol::protocol::basic::{self, AMQPProperties};
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::FieldTable;
use bytes::Bytes;

use crate::channel::{Channel, ChannelInner};
use crate::error::{Error, Result};

/// An absolute UTC point in time carried by the `timestamp` property.
///
/// Whatever form a timestamp is supplied in (integral or fractional epoch
/// seconds, a numeric string, a [`SystemTime`]), it is normalized to an
/// absolute time at construction; the wire form is whole epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// The current time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// From whole seconds since the Unix epoch.
    pub fn from_epoch_seconds(seconds: u64) -> Self {
        Self(UNIX_EPOCH + Duration::from_secs(seconds))
    }

    /// From fractional seconds since the Unix epoch. Values before the epoch
    /// are rejected.
    pub fn from_epoch_fractional(seconds: f64) -> Result<Self> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::InvalidProperty {
                property: "timestamp",
                value: seconds.to_string(),
            });
        }
        Ok(Self(UNIX_EPOCH + Duration::from_secs_f64(seconds)))
    }

    /// The underlying absolute time.
    pub fn as_system_time(&self) -> SystemTime {
        self.0
    }

    pub(crate) fn as_epoch_seconds(&self) -> u64 {
        self.0
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        Self(value)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self::from_epoch_seconds(value)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    /// Parse a numeric string of epoch seconds, integral or fractional.
    fn from_str(value: &str) -> Result<Self> {
        if let Ok(seconds) = value.parse::<u64>() {
            return Ok(Self::from_epoch_seconds(seconds));
        }
        if let Ok(seconds) = value.parse::<f64>() {
            return Self::from_epoch_fractional(seconds);
        }
        Err(Error::InvalidProperty {
            property: "timestamp",
            value: value.to_string(),
        })
    }
}

/// The closed record of AMQP basic properties.
///
/// Only these fourteen properties exist in the protocol, so unlike a
/// free-form map there is no invalid key to reject; the `headers` table
/// remains open for application use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// Application identifier
    pub app_id: Option<String>,
    /// MIME content encoding of the body
    pub content_encoding: Option<String>,
    /// MIME content type of the body
    pub content_type: Option<String>,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    /// Message expiration, in milliseconds as a string
    pub expiration: Option<String>,
    /// Application-defined headers
    pub headers: Option<FieldTable>,
    /// Application message identifier
    pub message_id: Option<String>,
    /// Priority, 0 to 9
    pub priority: Option<u8>,
    /// Address to reply to
    pub reply_to: Option<String>,
    /// Message timestamp, normalized to an absolute time
    pub timestamp: Option<Timestamp>,
    /// The `type` property, renamed to dodge the keyword
    pub message_type: Option<String>,
    /// Creating user id, validated by the broker
    pub user_id: Option<String>,
    /// Intra-cluster routing identifier
    pub cluster_id: Option<String>,
}

impl Properties {
    pub(crate) fn to_amqp(&self) -> AMQPProperties {
        let mut amqp = AMQPProperties::default();
        if let Some(v) = &self.content_type {
            amqp = amqp.with_content_type(v.as_str().into());
        }
        if let Some(v) = &self.content_encoding {
            amqp = amqp.with_content_encoding(v.as_str().into());
        }
        if let Some(v) = &self.headers {
            amqp = amqp.with_headers(v.clone());
        }
        if let Some(v) = self.delivery_mode {
            amqp = amqp.with_delivery_mode(v);
        }
        if let Some(v) = self.priority {
            amqp = amqp.with_priority(v);
        }
        if let Some(v) = &self.correlation_id {
            amqp = amqp.with_correlation_id(v.as_str().into());
        }
        if let Some(v) = &self.reply_to {
            amqp = amqp.with_reply_to(v.as_str().into());
        }
        if let Some(v) = &self.expiration {
            amqp = amqp.with_expiration(v.as_str().into());
        }
        if let Some(v) = &self.message_id {
            amqp = amqp.with_message_id(v.as_str().into());
        }
        if let Some(v) = &self.timestamp {
            amqp = amqp.with_timestamp(v.as_epoch_seconds());
        }
        if let Some(v) = &self.message_type {
            // the codec renames the `type` property to `kind`
            amqp = amqp.with_kind(v.as_str().into());
        }
        if let Some(v) = &self.user_id {
            amqp = amqp.with_user_id(v.as_str().into());
        }
        if let Some(v) = &self.app_id {
            amqp = amqp.with_app_id(v.as_str().into());
        }
        if let Some(v) = &self.cluster_id {
            amqp = amqp.with_cluster_id(v.as_str().into());
        }
        amqp
    }

    pub(crate) fn from_amqp(amqp: &AMQPProperties) -> Self {
        Self {
            app_id: amqp.app_id().as_ref().map(|v| v.as_str().to_string()),
            content_encoding: amqp.content_encoding().as_ref().map(|v| v.as_str().to_string()),
            content_type: amqp.content_type().as_ref().map(|v| v.as_str().to_string()),
            correlation_id: amqp.correlation_id().as_ref().map(|v| v.as_str().to_string()),
            delivery_mode: *amqp.delivery_mode(),
            expiration: amqp.expiration().as_ref().map(|v| v.as_str().to_string()),
            headers: amqp.headers().clone(),
            message_id: amqp.message_id().as_ref().map(|v| v.as_str().to_string()),
            priority: *amqp.priority(),
            reply_to: amqp.reply_to().as_ref().map(|v| v.as_str().to_string()),
            timestamp: amqp
                .timestamp()
                .as_ref()
                .map(|&v| Timestamp::from_epoch_seconds(v)),
            message_type: amqp.kind().as_ref().map(|v| v.as_str().to_string()),
            user_id: amqp.user_id().as_ref().map(|v| v.as_str().to_string()),
            cluster_id: amqp.cluster_id().as_ref().map(|v| v.as_str().to_string()),
        }
    }
}

/// Routing metadata attached to messages the broker handed to us.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryInfo {
    pub(crate) delivery_tag: u64,
    pub(crate) redelivered: bool,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) message_count: Option<u32>,
}

/// A message to publish, or one delivered by the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// The opaque body
    pub body: Bytes,
    /// The basic properties
    pub properties: Properties,
    delivery: Option<DeliveryInfo>,
    channel: Option<Arc<ChannelInner>>,
}

impl Message {
    /// A message with default (empty) properties.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self::with_properties(body, Properties::default())
    }

    /// A message carrying the given properties.
    pub fn with_properties(body: impl Into<Bytes>, properties: Properties) -> Self {
        Self {
            body: body.into(),
            properties,
            delivery: None,
            channel: None,
        }
    }

    pub(crate) fn delivered(
        channel: Arc<ChannelInner>,
        body: Bytes,
        properties: Properties,
        delivery: DeliveryInfo,
    ) -> Self {
        Self {
            body,
            properties,
            delivery: Some(delivery),
            channel: Some(channel),
        }
    }

    /// Publish to `exchange` with `routing_key`.
    ///
    /// With publisher confirms enabled on the channel, blocks until the
    /// broker confirms and returns `Some(true)` for an ack, `Some(false)`
    /// for a nack; otherwise returns `None` without waiting.
    pub fn publish(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Option<bool>> {
        self.publish_with(channel, exchange, routing_key, PublishOptions::default())
    }

    /// Publish with explicit `mandatory`/`immediate` flags.
    ///
    /// If `mandatory` is set and the broker cannot route the message, the
    /// returned message surfaces as [`Error::MessageReturned`] on this
    /// channel's next blocking call.
    pub fn publish_with(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
    ) -> Result<Option<bool>> {
        channel.inner.publish(
            exchange,
            routing_key,
            options.mandatory,
            options.immediate,
            &self.properties,
            &self.body,
        )
    }

    /// Acknowledge receipt. `multiple` also acknowledges every earlier
    /// unacknowledged delivery on the channel.
    pub fn ack(&self, multiple: bool) -> Result<()> {
        let (channel, delivery) = self.received("ack")?;
        channel.send_method(AMQPClass::Basic(basic::AMQPMethod::Ack(basic::Ack {
            delivery_tag: delivery.delivery_tag,
            multiple,
        })))
    }

    /// Negatively acknowledge receipt, optionally requeueing.
    pub fn nack(&self, requeue: bool, multiple: bool) -> Result<()> {
        let (channel, delivery) = self.received("nack")?;
        channel.send_method(AMQPClass::Basic(basic::AMQPMethod::Nack(basic::Nack {
            delivery_tag: delivery.delivery_tag,
            multiple,
            requeue,
        })))
    }

    /// Reject the message, optionally requeueing.
    pub fn reject(&self, requeue: bool) -> Result<()> {
        let (channel, delivery) = self.received("reject")?;
        channel.send_method(AMQPClass::Basic(basic::AMQPMethod::Reject(basic::Reject {
            delivery_tag: delivery.delivery_tag,
            requeue,
        })))
    }

    /// The broker-assigned delivery tag, when delivered.
    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery.as_ref().map(|d| d.delivery_tag)
    }

    /// Whether the broker flagged this delivery as possibly seen before.
    pub fn redelivered(&self) -> Option<bool> {
        self.delivery.as_ref().map(|d| d.redelivered)
    }

    /// The exchange the message was published to, when delivered.
    pub fn exchange(&self) -> Option<&str> {
        self.delivery.as_ref().map(|d| d.exchange.as_str())
    }

    /// The routing key the message was published with, when delivered.
    pub fn routing_key(&self) -> Option<&str> {
        self.delivery.as_ref().map(|d| d.routing_key.as_str())
    }

    /// The consumer tag the delivery was addressed to, for consumed messages.
    pub fn consumer_tag(&self) -> Option<&str> {
        self.delivery
            .as_ref()
            .and_then(|d| d.consumer_tag.as_deref())
    }

    /// Messages left in the queue at the time of a `Basic.Get`.
    pub fn message_count(&self) -> Option<u32> {
        self.delivery.as_ref().and_then(|d| d.message_count)
    }

    fn received(&self, action: &'static str) -> Result<(&Arc<ChannelInner>, &DeliveryInfo)> {
        match (&self.channel, &self.delivery) {
            (Some(channel), Some(delivery)) => Ok((channel, delivery)),
            _ => Err(Error::NotDelivered { action }),
        }
    }
}

/// Flags for [`Message::publish_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Ask the broker to return the message if it cannot be routed
    pub mandatory: bool,
    /// Ask the broker to return the message if it cannot be delivered
    /// immediately
    pub immediate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_normalize_to_absolute_times() {
        let epoch = 1_700_000_000u64;
        let from_int = Timestamp::from(epoch);
        let from_float = Timestamp::from_epoch_fractional(epoch as f64 + 0.25).unwrap();
        let from_str: Timestamp = epoch.to_string().parse().unwrap();
        let from_system = Timestamp::from(UNIX_EPOCH + Duration::from_secs(epoch));

        assert_eq!(from_int, from_str);
        assert_eq!(from_int, from_system);
        assert_eq!(from_int.as_epoch_seconds(), epoch);
        assert_eq!(from_float.as_epoch_seconds(), epoch);
    }

    #[test]
    fn non_numeric_timestamp_strings_are_invalid() {
        let err = "half past nine".parse::<Timestamp>().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidProperty { property: "timestamp", .. }
        ));
        assert!(Timestamp::from_epoch_fractional(f64::NAN).is_err());
        assert!(Timestamp::from_epoch_fractional(-5.0).is_err());
    }

    #[test]
    fn properties_round_trip_through_the_wire_form() {
        let properties = Properties {
            app_id: Some("billing".into()),
            content_type: Some("application/json".into()),
            correlation_id: Some("req-42".into()),
            delivery_mode: Some(2),
            message_id: Some("m-1".into()),
            priority: Some(5),
            reply_to: Some("billing.replies".into()),
            timestamp: Some(Timestamp::from_epoch_seconds(1_700_000_000)),
            message_type: Some("invoice.created".into()),
            ..Properties::default()
        };
        let round_tripped = Properties::from_amqp(&properties.to_amqp());
        assert_eq!(round_tripped, properties);
    }

    #[test]
    fn empty_properties_stay_empty_on_the_wire() {
        let round_tripped = Properties::from_amqp(&Properties::default().to_amqp());
        assert_eq!(round_tripped, Properties::default());
    }

    #[test]
    fn actions_on_unreceived_messages_are_usage_errors() {
        let message = Message::new("payload");
        assert!(matches!(
            message.ack(false),
            Err(Error::NotDelivered { action: "ack" })
        ));
        assert!(matches!(
            message.nack(false, false),
            Err(Error::NotDelivered { action: "nack" })
        ));
        assert!(matches!(
            message.reject(true),
            Err(Error::NotDelivered { action: "reject" })
        ));
        assert!(message.delivery_tag().is_none());
    }
}
