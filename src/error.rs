//! Error types raised by connections, channels and the domain objects.
//!
//! The I/O worker and the connection state machine never panic across
//! threads; they push an [`Error`] into the shared exception queue and user
//! threads re-raise it from the next blocking call.

use std::io;
use std::time::Duration;

/// Errors from the AMQP 0-9-1 reply-code table.
///
/// The broker attaches one of these codes to `Connection.Close` and
/// `Channel.Close` frames. Codes in the 3xx range are soft (channel) errors,
/// 4xx/5xx are connection errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpError {
    /// 311
    ContentTooLarge,
    /// 312
    NoRoute,
    /// 313
    NoConsumers,
    /// 320
    ConnectionForced,
    /// 402
    InvalidPath,
    /// 403
    AccessRefused,
    /// 404
    NotFound,
    /// 405
    ResourceLocked,
    /// 406
    PreconditionFailed,
    /// 501
    FrameError,
    /// 502
    SyntaxError,
    /// 503
    CommandInvalid,
    /// 504
    ChannelError,
    /// 505
    UnexpectedFrame,
    /// 506
    ResourceError,
    /// 530
    NotAllowed,
    /// 540
    NotImplemented,
    /// 541
    InternalError,
}

impl AmqpError {
    /// Map an AMQP reply code to its typed error, if the code is in the
    /// published table.
    pub fn from_reply_code(code: u16) -> Option<Self> {
        match code {
            311 => Some(Self::ContentTooLarge),
            312 => Some(Self::NoRoute),
            313 => Some(Self::NoConsumers),
            320 => Some(Self::ConnectionForced),
            402 => Some(Self::InvalidPath),
            403 => Some(Self::AccessRefused),
            404 => Some(Self::NotFound),
            405 => Some(Self::ResourceLocked),
            406 => Some(Self::PreconditionFailed),
            501 => Some(Self::FrameError),
            502 => Some(Self::SyntaxError),
            503 => Some(Self::CommandInvalid),
            504 => Some(Self::ChannelError),
            505 => Some(Self::UnexpectedFrame),
            506 => Some(Self::ResourceError),
            530 => Some(Self::NotAllowed),
            540 => Some(Self::NotImplemented),
            541 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// The wire reply code for this error.
    pub fn reply_code(&self) -> u16 {
        match self {
            Self::ContentTooLarge => 311,
            Self::NoRoute => 312,
            Self::NoConsumers => 313,
            Self::ConnectionForced => 320,
            Self::InvalidPath => 402,
            Self::AccessRefused => 403,
            Self::NotFound => 404,
            Self::ResourceLocked => 405,
            Self::PreconditionFailed => 406,
            Self::FrameError => 501,
            Self::SyntaxError => 502,
            Self::CommandInvalid => 503,
            Self::ChannelError => 504,
            Self::UnexpectedFrame => 505,
            Self::ResourceError => 506,
            Self::NotAllowed => 530,
            Self::NotImplemented => 540,
            Self::InternalError => 541,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ContentTooLarge => "CONTENT_TOO_LARGE",
            Self::NoRoute => "NO_ROUTE",
            Self::NoConsumers => "NO_CONSUMERS",
            Self::ConnectionForced => "CONNECTION_FORCED",
            Self::InvalidPath => "INVALID_PATH",
            Self::AccessRefused => "ACCESS_REFUSED",
            Self::NotFound => "NOT_FOUND",
            Self::ResourceLocked => "RESOURCE_LOCKED",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::FrameError => "FRAME_ERROR",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::CommandInvalid => "COMMAND_INVALID",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::UnexpectedFrame => "UNEXPECTED_FRAME",
            Self::ResourceError => "RESOURCE_ERROR",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for AmqpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.reply_code())
    }
}

/// The error type for every fallible operation in the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The AMQP URL could not be parsed
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// The URL scheme is neither `amqp` nor `amqps`
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// A recognized URL option carried an invalid value
    #[error("invalid value for option {option}: {value}")]
    InvalidOption {
        /// The query-string option name
        option: &'static str,
        /// The rejected value
        value: String,
    },

    /// An `amqps` URL was given but the crate was built without TLS support
    #[error("TLS requested but the crate was built without the `rustls` feature")]
    TlsDisabled,

    /// IO error on the socket
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The connection handshake did not complete within the configured timeout
    #[error("connection handshake timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// The connection was reset at the transport level
    #[error("connection was reset: {0}")]
    ConnectionReset(String),

    /// The broker closed the connection with a reply code from the AMQP table
    #[error("connection closed by the broker: {error}: {text}")]
    Amqp {
        /// The typed reply-code error
        error: AmqpError,
        /// The reply text sent by the broker
        text: String,
    },

    /// The broker closed the connection with a reply code outside the table
    #[error("connection closed by the broker ({code}): {text}")]
    RemoteClosed {
        /// The broker reply code
        code: u16,
        /// The broker reply text
        text: String,
    },

    /// The broker closed a channel
    #[error("channel {channel} closed by the broker ({code}): {text}")]
    RemoteClosedChannel {
        /// The channel that was closed
        channel: u16,
        /// The broker reply code
        code: u16,
        /// The broker reply text
        text: String,
    },

    /// A mandatory publish could not be routed and the broker returned it
    #[error("message {message_id} was returned by the broker ({reply_code}): {reply_text}")]
    MessageReturned {
        /// The `message_id` property of the returned message, if set
        message_id: String,
        /// The broker reply code
        reply_code: u16,
        /// The broker reply text
        reply_text: String,
    },

    /// An operation was attempted on a closed channel
    #[error("can not perform RPC requests on a closed channel")]
    ChannelClosed,

    /// An operation was attempted on a closed connection
    #[error("can not perform operations on a closed connection")]
    ConnectionClosed,

    /// Every channel id up to the negotiated maximum is in use
    #[error("the maximum number of negotiated channels has been reached")]
    TooManyChannels,

    /// An exchange name is required for the operation
    #[error("an exchange name must be specified")]
    EmptyExchangeName,

    /// A queue name is required for the operation
    #[error("a queue name must be specified")]
    EmptyQueueName,

    /// A message property failed validation or coercion
    #[error("invalid value for property {property}: {value}")]
    InvalidProperty {
        /// The property name
        property: &'static str,
        /// The rejected value
        value: String,
    },

    /// ack/nack/reject was called on a message the broker never delivered
    #[error("can not {action} a message that was not received from the broker")]
    NotDelivered {
        /// The attempted action
        action: &'static str,
    },

    /// The channel closed while a transaction was awaiting commit or rollback
    #[error("no active transaction for the request, channel closed")]
    NoActiveTransaction,

    /// Publisher confirms and transactions are mutually exclusive on a channel
    #[error("a channel can not combine transactions with publisher confirms")]
    ConfirmsAndTransactions,

    /// A frame was received that is not valid where it arrived
    #[error("received an unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Bytes on the wire could not be decoded as an AMQP frame
    #[error("received malformed data, expected an AMQP frame: {0}")]
    MalformedFrame(String),

    /// TLS-level failure
    #[cfg(feature = "rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Translate a broker `Connection.Close` into the typed error for its
    /// reply code, falling back to [`Error::RemoteClosed`] for codes outside
    /// the table.
    pub(crate) fn from_connection_close(code: u16, text: String) -> Self {
        match AmqpError::from_reply_code(code) {
            Some(error) => Error::Amqp { error, text },
            None => Error::RemoteClosed { code, text },
        }
    }
}

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: [u16; 18] = [
        311, 312, 313, 320, 402, 403, 404, 405, 406, 501, 502, 503, 504, 505, 506, 530, 540, 541,
    ];

    #[test]
    fn reply_code_table_round_trips() {
        for code in TABLE {
            let error = AmqpError::from_reply_code(code).unwrap();
            assert_eq!(error.reply_code(), code);
        }
    }

    #[test]
    fn unknown_codes_fall_through() {
        for code in [0, 200, 310, 399, 500, 542] {
            assert!(AmqpError::from_reply_code(code).is_none());
        }
        let err = Error::from_connection_close(542, "weird".into());
        assert!(matches!(err, Error::RemoteClosed { code: 542, .. }));
    }

    #[test]
    fn connection_close_maps_to_typed_error() {
        let err = Error::from_connection_close(320, "CONNECTION_FORCED - shutdown".into());
        match err {
            Error::Amqp { error, text } => {
                assert_eq!(error, AmqpError::ConnectionForced);
                assert!(text.starts_with("CONNECTION_FORCED"));
            }
            other => panic!("expected typed error, got {other:?}"),
        }
    }
}
