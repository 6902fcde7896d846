//! Registry behavior: scheme dispatch, error taxonomy, and registration
//! collisions.

use std::io;
use url::Url;

use rlcm::error::{ConnectError, RegisterError};
use rlcm::{Lcm, LcmConnection, LcmProvider};

/// A provider whose connection attempts always fail, standing in for a
/// transport that is down.
struct BogusProvider;

impl LcmProvider for BogusProvider {
    fn connect(&self, _url: &Url) -> Result<Box<dyn LcmConnection>, ConnectError> {
        Err(ConnectError::IoError(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "bogus provider",
        )))
    }
}

#[test]
fn url_without_a_scheme_is_invalid() {
    let lcm = Lcm::new();

    let result = lcm.connect("127.0.0.1:7700");
    assert!(matches!(result, Err(ConnectError::InvalidUrl)));
}

#[test]
fn unknown_scheme_is_not_registered() {
    let lcm = Lcm::new();

    match lcm.connect("bogus://") {
        Err(ConnectError::UnknownProvider(scheme)) => assert_eq!(scheme, "bogus"),
        other => panic!("expected an unknown provider error, got {:?}", other.map(|c| c.is_some())),
    }
}

#[test]
fn failing_provider_yields_an_absent_connection() {
    let mut lcm = Lcm::new();
    lcm.register_provider("bogus", Box::new(BogusProvider), false)
        .unwrap();

    let connection = lcm.connect("bogus://").unwrap();
    assert!(connection.is_none());
}

#[test]
fn duplicate_registration_requires_override() {
    let mut lcm = Lcm::new();
    lcm.register_provider("bogus", Box::new(BogusProvider), false)
        .unwrap();

    let collision = lcm.register_provider("bogus", Box::new(BogusProvider), false);
    match collision {
        Err(RegisterError::AlreadyRegistered(name)) => assert_eq!(name, "bogus"),
        Ok(()) => panic!("registration should have collided"),
    }

    lcm.register_provider("bogus", Box::new(BogusProvider), true)
        .unwrap();
}

#[test]
fn built_in_providers_can_be_overridden() {
    let mut lcm = Lcm::new();

    assert!(lcm
        .register_provider("tcpq", Box::new(BogusProvider), false)
        .is_err());
    assert!(lcm
        .register_provider("tcpq", Box::new(BogusProvider), true)
        .is_ok());

    // The override is in effect: connecting now hits the bogus provider.
    assert!(lcm.connect("tcpq://127.0.0.1:7700").unwrap().is_none());
}
