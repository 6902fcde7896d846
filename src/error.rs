//! Error types associated with LCM operations.
//!
//! In general, one will want to return an `Error` from a function as all of
//! the other errors can be converted into the `Error` using either the `?`
//! operator or `From`. The per-operation error types exist in case one wants
//! to attempt to recover from a specific failure.
//!
//! Transport errors on a live connection are deliberately absent here: they
//! never escape the connection boundary. The connection transitions to its
//! torn-down state instead, which callers observe through `is_connected`,
//! an absent subscribe result, or `PublishError::NotConnected`.

use regex;
use std::io;

/// A generic LCM error.
///
/// If one does not intend to try and recover from errors, this is the best
/// error type to handle. All of the LCM errors can be converted to this type
/// using the `?` operator.
#[derive(Debug, Fail)]
pub enum Error {
    /// An error happened while establishing a connection.
    #[fail(display = "Failed to connect.")]
    Connect(#[cause] ConnectError),

    /// An error happened while registering a provider.
    #[fail(display = "Failed to register the provider.")]
    Register(#[cause] RegisterError),

    /// An error happened while trying to subscribe to a channel.
    #[fail(display = "Failed to subscribe to the channel.")]
    Subscribe(#[cause] SubscribeError),

    /// An error happened while trying to publish a message.
    #[fail(display = "Failed to publish message.")]
    Publish(#[cause] PublishError),
}
impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Error::Connect(err)
    }
}
impl From<RegisterError> for Error {
    fn from(err: RegisterError) -> Self {
        Error::Register(err)
    }
}
impl From<SubscribeError> for Error {
    fn from(err: SubscribeError) -> Self {
        Error::Subscribe(err)
    }
}
impl From<PublishError> for Error {
    fn from(err: PublishError) -> Self {
        Error::Publish(err)
    }
}

/// The connection could not be established.
#[derive(Debug, Fail)]
pub enum ConnectError {
    /// The supplied LCM URL could not be parsed, has no scheme, or carries
    /// a host the provider cannot use.
    #[fail(display = "Invalid LCM URL.")]
    InvalidUrl,

    /// The URL names a scheme this provider does not implement.
    #[fail(display = "Expected a \"{}\" URL, got \"{}\".", expected, found)]
    WrongScheme {
        /// The scheme the provider serves.
        expected: &'static str,
        /// The scheme found in the URL.
        found: String,
    },

    /// No provider is registered under the URL's scheme.
    #[fail(display = "Unknown provider \"{}\".", _0)]
    UnknownProvider(String),

    /// The relay answered the protocol handshake with unexpected bytes.
    #[fail(display = "Invalid handshake received from the relay.")]
    InvalidHandshake,

    /// There was an IO issue that prevented the connection from starting.
    #[fail(display = "The connection failed to start due to an IO error.")]
    IoError(#[cause] io::Error),
}
impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        ConnectError::IoError(err)
    }
}

/// The provider could not be registered.
#[derive(Debug, Fail)]
pub enum RegisterError {
    /// A provider already exists under this name and overriding was not
    /// requested.
    #[fail(display = "A provider is already registered as \"{}\".", _0)]
    AlreadyRegistered(String),
}

/// The attempt to subscribe to a channel was unsuccessful.
#[derive(Debug, Fail)]
pub enum SubscribeError {
    /// The provided channel pattern was an invalid regular expression.
    #[fail(display = "Invalid regular expression used.")]
    InvalidRegex(#[cause] regex::Error),
}
impl From<regex::Error> for SubscribeError {
    fn from(err: regex::Error) -> Self {
        SubscribeError::InvalidRegex(err)
    }
}

/// Publishing to a channel failed.
#[derive(Debug, Fail)]
pub enum PublishError {
    /// The connection has been torn down.
    #[fail(display = "The connection is no longer live.")]
    NotConnected,

    /// The message would not fit in the maximum number of fragments.
    #[fail(display = "The message would span {} fragments; at most 65535 fit.", _0)]
    TooManyFragments(usize),
}
