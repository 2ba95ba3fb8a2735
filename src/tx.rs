//! Standard AMQP transactions: batch publishes and acks into a unit that
//! commits or rolls back atomically.
//!
//! A channel can not combine transactions with publisher confirms; selecting
//! one mode locks the other out.

use amq_protocol::protocol::{tx, AMQPClass};

use crate::channel::Channel;
use crate::error::{Error, Result};

/// Transaction control for one channel.
///
/// A transaction that was selected but neither committed nor rolled back by
/// the time the `Tx` is dropped is rolled back, so an early return can not
/// leave half a transaction open on the channel.
#[derive(Debug)]
pub struct Tx<'a> {
    channel: &'a Channel,
    selected: bool,
}

impl<'a> Tx<'a> {
    /// Wrap a channel for transactional use; nothing is sent until
    /// [`select`](Tx::select).
    pub fn new(channel: &'a Channel) -> Self {
        Self {
            channel,
            selected: false,
        }
    }

    /// Put the channel in transaction mode. Must be called once before
    /// commit or rollback.
    pub fn select(&mut self) -> Result<()> {
        self.channel.inner.mark_transactional()?;
        self.channel.inner.rpc(
            AMQPClass::Tx(tx::AMQPMethod::Select(tx::Select {})),
            |class| match class {
                AMQPClass::Tx(tx::AMQPMethod::SelectOk(_)) => Ok(()),
                other => Err(other),
            },
        )?;
        self.selected = true;
        Ok(())
    }

    /// Commit the publishes and acks issued since the last commit or
    /// rollback. A new transaction starts immediately.
    pub fn commit(&mut self) -> Result<()> {
        self.finish(AMQPClass::Tx(tx::AMQPMethod::Commit(tx::Commit {})), |class| {
            match class {
                AMQPClass::Tx(tx::AMQPMethod::CommitOk(_)) => Ok(()),
                other => Err(other),
            }
        })
    }

    /// Abandon the publishes and acks issued since the last commit or
    /// rollback. Unacked deliveries are not redelivered automatically; use
    /// [`Channel::recover`] for that.
    pub fn rollback(&mut self) -> Result<()> {
        self.finish(
            AMQPClass::Tx(tx::AMQPMethod::Rollback(tx::Rollback {})),
            |class| match class {
                AMQPClass::Tx(tx::AMQPMethod::RollbackOk(_)) => Ok(()),
                other => Err(other),
            },
        )
    }

    fn finish(
        &mut self,
        request: AMQPClass,
        extract: impl Fn(AMQPClass) -> std::result::Result<(), AMQPClass>,
    ) -> Result<()> {
        match self.channel.inner.rpc(request, extract) {
            Ok(()) => {
                self.selected = false;
                Ok(())
            }
            // The channel died under the transaction; there is nothing left
            // to commit or abandon.
            Err(Error::ChannelClosed) => {
                self.selected = false;
                Err(Error::NoActiveTransaction)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Tx<'_> {
    /// Best-effort rollback of a transaction left open; the checked paths
    /// are [`Tx::commit`] and [`Tx::rollback`].
    fn drop(&mut self) {
        if self.selected {
            let _ = self.rollback();
        }
    }
}
