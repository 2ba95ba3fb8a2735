//! Blocking consumer iteration over a channel's deliveries.

use tracing::debug;

use crate::channel::Channel;
use crate::error::Result;
use crate::message::Message;

/// A live subscription created by [`Queue::consume`](crate::Queue::consume).
///
/// Iterating blocks until the broker delivers the next message. Iteration
/// ends cleanly when the consumer is canceled from either side; breaking out
/// of the loop and dropping the consumer emits a fire-and-forget
/// `Basic.Cancel`, while [`cancel`](Consumer::cancel) runs the full
/// cancel handshake.
#[derive(Debug)]
pub struct Consumer<'a> {
    channel: &'a Channel,
    tag: String,
    canceled: bool,
}

impl<'a> Consumer<'a> {
    pub(crate) fn new(channel: &'a Channel, tag: String) -> Self {
        Self {
            channel,
            tag,
            canceled: false,
        }
    }

    /// The broker-assigned consumer tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Block until the next message is delivered. `None` means the consumer
    /// was canceled and no more deliveries will arrive.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.canceled {
            return Ok(None);
        }
        match self.channel.inner.next_delivery(&self.tag) {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                self.canceled = true;
                Ok(None)
            }
            Err(e) => {
                self.canceled = true;
                Err(e)
            }
        }
    }

    /// Cancel the subscription with a full `Basic.Cancel` round trip.
    pub fn cancel(mut self) -> Result<()> {
        self.canceled = true;
        debug!(consumer_tag = self.tag.as_str(), "canceling consumer");
        self.channel.inner.cancel_consumer(&self.tag)
    }
}

impl Iterator for Consumer<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        if !self.canceled {
            self.channel.inner.cancel_consumer_nowait(&self.tag);
        }
    }
}
