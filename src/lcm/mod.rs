//! The front door: a registry that routes `connect` calls to the provider
//! registered for the URL's scheme.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use url::Url;

use crate::error::{ConnectError, PublishError, RegisterError, SubscribeError};
use crate::subscription::{Callback, Subscription};

pub mod providers;
#[cfg(feature = "tcpq")]
use self::providers::tcpq::TcpqProvider;
#[cfg(feature = "udpm")]
use self::providers::udpm::UdpmProvider;

/// Default LCM URL to be used when the `LCM_DEFAULT_URL` environment
/// variable is not available.
const LCM_DEFAULT_URL: &str = "udpm://239.255.76.76:7667?ttl=1";

/// A provider builds connections for a single wire protocol, selected by
/// URL scheme.
pub trait LcmProvider: Send + Sync {
    /// Produces a connection for the given URL.
    ///
    /// Fails when the URL does not describe this provider or the transport
    /// could not be established.
    fn connect(&self, url: &Url) -> Result<Box<dyn LcmConnection>, ConnectError>;
}

/// A live transport handle bound to one provider.
///
/// A connection owns its socket, its background receiver, and the set of
/// subscriptions created through it. It is live until the first of: an
/// explicit [`disconnect`](LcmConnection::disconnect), or an I/O error on
/// any read or write. Once torn down it never becomes live again.
pub trait LcmConnection: Send + Sync {
    /// Publishes `data` on `channel`.
    ///
    /// Publishing is best-effort: an I/O failure tears the connection down
    /// and returns `Ok`, to be observed through `is_connected`. Publishing
    /// on an already torn-down connection is an error.
    fn publish(&self, channel: &str, data: &[u8]) -> Result<(), PublishError>;

    /// Subscribes `callback` to every channel matching `channel` from the
    /// start of its name.
    ///
    /// Returns `Ok(None)` when the connection is torn down (or tears down
    /// while subscribing). A pattern that fails to compile is an error.
    fn subscribe(
        &self,
        channel: &str,
        callback: Callback,
    ) -> Result<Option<Arc<Subscription>>, SubscribeError>;

    /// Returns whether the connection is still live.
    fn is_connected(&self) -> bool;

    /// Tears the connection down: closes the transport, unsubscribes every
    /// subscription, and waits for the receiver to exit. Idempotent.
    fn disconnect(&self);
}

/// Routes `connect` calls to registered providers and owns nothing else.
///
/// Providers are registered once and live for the registry's lifetime;
/// connections produced by them are independent of the registry.
pub struct Lcm {
    providers: HashMap<String, Box<dyn LcmProvider>>,
}

impl Lcm {
    /// Creates a registry with the built-in providers already registered.
    pub fn new() -> Self {
        let mut providers: HashMap<String, Box<dyn LcmProvider>> = HashMap::new();

        #[cfg(feature = "tcpq")]
        providers.insert("tcpq".into(), Box::new(TcpqProvider::new()));
        #[cfg(feature = "udpm")]
        providers.insert("udpm".into(), Box::new(UdpmProvider::new()));

        Lcm { providers }
    }

    /// Registers a provider under `name`.
    ///
    /// `name` is matched against URL schemes in [`connect`](Lcm::connect).
    /// Registering over an existing name fails unless `override_existing`
    /// is set.
    pub fn register_provider(
        &mut self,
        name: &str,
        provider: Box<dyn LcmProvider>,
        override_existing: bool,
    ) -> Result<(), RegisterError> {
        if self.providers.contains_key(name) && !override_existing {
            return Err(RegisterError::AlreadyRegistered(name.into()));
        }

        debug!("Registering provider \"{}\"", name);
        self.providers.insert(name.into(), provider);
        Ok(())
    }

    /// Connects using the provider matching the URL's scheme.
    ///
    /// A URL that cannot be parsed or carries no scheme is an error, as is
    /// a scheme with no registered provider. When the provider itself fails
    /// — a URL it rejects, a handshake failure, a transport that cannot be
    /// established right now — the result is `Ok(None)`, so callers can
    /// treat "could not connect" uniformly.
    pub fn connect(&self, url: &str) -> Result<Option<Box<dyn LcmConnection>>, ConnectError> {
        debug!("Connecting using \"{}\"", url);
        let parsed = Url::parse(url).map_err(|_| ConnectError::InvalidUrl)?;

        let provider = self
            .providers
            .get(parsed.scheme())
            .ok_or_else(|| ConnectError::UnknownProvider(parsed.scheme().into()))?;

        match provider.connect(&parsed) {
            Ok(connection) => Ok(Some(connection)),
            Err(err) => {
                debug!(
                    "Provider \"{}\" failed to connect: {}",
                    parsed.scheme(),
                    err
                );
                Ok(None)
            }
        }
    }

    /// Connects using the `LCM_DEFAULT_URL` environment variable.
    ///
    /// When the variable is missing or empty, the library default of
    /// `udpm://239.255.76.76:7667?ttl=1` is used instead.
    pub fn connect_default(&self) -> Result<Option<Box<dyn LcmConnection>>, ConnectError> {
        match env::var("LCM_DEFAULT_URL") {
            Ok(ref url) if !url.is_empty() => {
                debug!("LCM_DEFAULT_URL=\"{}\"", url);
                self.connect(url)
            }
            _ => {
                debug!("LCM_DEFAULT_URL not set. Using default settings.");
                self.connect(LCM_DEFAULT_URL)
            }
        }
    }
}

impl Default for Lcm {
    fn default() -> Self {
        Lcm::new()
    }
}
