//! Declare and work with exchanges.

use amq_protocol::protocol::{exchange, AMQPClass};
use amq_protocol::types::FieldTable;

use crate::channel::Channel;
use crate::error::{Error, Result};

/// Built-in exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    /// Route on an exact routing-key match
    #[default]
    Direct,
    /// Route to every bound queue
    Fanout,
    /// Route on routing-key pattern match
    Topic,
    /// Route on header values
    Headers,
}

impl ExchangeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// An exchange definition and the operations on it. Exchange names are
/// required; the nameless default exchange needs no declaration.
#[derive(Debug, Clone)]
pub struct Exchange {
    name: String,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    arguments: FieldTable,
}

impl Exchange {
    /// An exchange definition with the given name and type.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            arguments: FieldTable::default(),
        }
    }

    /// The exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Survive a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Delete the exchange once nothing is bound to it.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Custom declaration arguments.
    pub fn argument(mut self, key: impl Into<String>, value: amq_protocol::types::AMQPValue) -> Self {
        self.arguments.insert(key.into().into(), value);
        self
    }

    /// Declare the exchange on the broker.
    pub fn declare(&self, channel: &Channel) -> Result<()> {
        self.declare_inner(channel, false)
    }

    /// Verify the exchange exists without creating it.
    pub fn declare_passive(&self, channel: &Channel) -> Result<()> {
        self.declare_inner(channel, true)
    }

    fn declare_inner(&self, channel: &Channel, passive: bool) -> Result<()> {
        self.require_name()?;
        channel.inner.rpc(
            AMQPClass::Exchange(exchange::AMQPMethod::Declare(exchange::Declare {
                exchange: self.name.as_str().into(),
                kind: self.kind.as_str().into(),
                passive,
                durable: self.durable,
                auto_delete: self.auto_delete,
                internal: false,
                nowait: false,
                arguments: self.arguments.clone(),
            })),
            |class| match class {
                AMQPClass::Exchange(exchange::AMQPMethod::DeclareOk(_)) => Ok(()),
                other => Err(other),
            },
        )
    }

    /// Delete the exchange.
    pub fn delete(&self, channel: &Channel, if_unused: bool) -> Result<()> {
        self.require_name()?;
        channel.inner.rpc(
            AMQPClass::Exchange(exchange::AMQPMethod::Delete(exchange::Delete {
                exchange: self.name.as_str().into(),
                if_unused,
                nowait: false,
            })),
            |class| match class {
                AMQPClass::Exchange(exchange::AMQPMethod::DeleteOk(_)) => Ok(()),
                other => Err(other),
            },
        )
    }

    /// Bind this exchange to receive messages from `source` (an
    /// exchange-to-exchange binding, a RabbitMQ extension).
    pub fn bind(&self, channel: &Channel, source: &str, routing_key: &str) -> Result<()> {
        self.require_name()?;
        if source.is_empty() {
            return Err(Error::EmptyExchangeName);
        }
        channel.inner.rpc(
            AMQPClass::Exchange(exchange::AMQPMethod::Bind(exchange::Bind {
                destination: self.name.as_str().into(),
                source: source.into(),
                routing_key: routing_key.into(),
                nowait: false,
                arguments: FieldTable::default(),
            })),
            |class| match class {
                AMQPClass::Exchange(exchange::AMQPMethod::BindOk(_)) => Ok(()),
                other => Err(other),
            },
        )
    }

    /// Remove an exchange-to-exchange binding.
    pub fn unbind(&self, channel: &Channel, source: &str, routing_key: &str) -> Result<()> {
        self.require_name()?;
        if source.is_empty() {
            return Err(Error::EmptyExchangeName);
        }
        channel.inner.rpc(
            AMQPClass::Exchange(exchange::AMQPMethod::Unbind(exchange::Unbind {
                destination: self.name.as_str().into(),
                source: source.into(),
                routing_key: routing_key.into(),
                nowait: false,
                arguments: FieldTable::default(),
            })),
            |class| match class {
                AMQPClass::Exchange(exchange::AMQPMethod::UnbindOk(_)) => Ok(()),
                other => Err(other),
            },
        )
    }

    fn require_name(&self) -> Result<()> {
        if self.name.is_empty() {
            Err(Error::EmptyExchangeName)
        } else {
            Ok(())
        }
    }
}
