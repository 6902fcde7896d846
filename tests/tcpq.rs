//! End-to-end tcpq tests against a minimal in-process relay.
//!
//! The relay speaks just enough of the protocol for these tests: it
//! performs the handshake, consumes subscribe/unsubscribe frames, and
//! forwards every publish to all connected clients. Channel filtering is
//! the client's job, which is exactly what is under test.

#![cfg(feature = "tcpq")]

mod common;

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use url::Url;

use common::wait_until;
use rlcm::error::{ConnectError, PublishError};
use rlcm::{Lcm, LcmConnection, LcmProvider, TcpqProvider};

const CLIENT_HELLO: [u8; 8] = [0x28, 0x76, 0x17, 0xFB, 0x00, 0x00, 0x01, 0x00];
const SERVER_HELLO: [u8; 8] = [0x28, 0x76, 0x17, 0xFA, 0x00, 0x00, 0x01, 0x00];

/// Starts a relay on an ephemeral port and returns its address.
fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let clients: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));

    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            let clients = Arc::clone(&clients);
            thread::spawn(move || serve_client(stream, &clients));
        }
    });

    address
}

fn serve_client(mut stream: TcpStream, clients: &Mutex<Vec<TcpStream>>) {
    let mut hello = [0; 8];
    if stream.read_exact(&mut hello).is_err() || hello != CLIENT_HELLO {
        return;
    }
    if stream.write_all(&SERVER_HELLO).is_err() {
        return;
    }

    clients.lock().unwrap().push(stream.try_clone().unwrap());

    loop {
        let frame_type = match stream.read_u32::<NetworkEndian>() {
            Ok(frame_type) => frame_type,
            Err(_) => break,
        };
        let channel_len = match stream.read_u32::<NetworkEndian>() {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let mut channel = vec![0; channel_len];
        if stream.read_exact(&mut channel).is_err() {
            break;
        }

        // Only publishes carry a data section and get forwarded; the relay
        // quietly accepts subscribe and unsubscribe frames.
        if frame_type != 1 {
            continue;
        }

        let data_len = match stream.read_u32::<NetworkEndian>() {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let mut data = vec![0; data_len];
        if stream.read_exact(&mut data).is_err() {
            break;
        }

        let mut delivery = Vec::with_capacity(12 + channel_len + data_len);
        delivery.write_u32::<NetworkEndian>(1).unwrap();
        delivery
            .write_u32::<NetworkEndian>(channel_len as u32)
            .unwrap();
        delivery.extend_from_slice(&channel);
        delivery.write_u32::<NetworkEndian>(data_len as u32).unwrap();
        delivery.extend_from_slice(&data);

        let mut clients = clients.lock().unwrap();
        clients.retain(|client| {
            let mut client: &TcpStream = client;
            client.write_all(&delivery).is_ok()
        });
    }
}

fn connect(address: SocketAddr) -> Box<dyn LcmConnection> {
    let lcm = Lcm::new();
    lcm.connect(&format!("tcpq://127.0.0.1:{}", address.port()))
        .unwrap()
        .unwrap()
}

/// Subscribes with a callback that sums little-endian u32 payloads.
fn subscribe_summing(
    connection: &dyn LcmConnection,
    channel: &str,
) -> (Arc<rlcm::Subscription>, Arc<AtomicU64>) {
    let sum = Arc::new(AtomicU64::new(0));
    let total = Arc::clone(&sum);

    let subscription = connection
        .subscribe(
            channel,
            Box::new(move |_channel, data| {
                let mut bytes = [0; 4];
                bytes.copy_from_slice(data);
                total.fetch_add(u64::from(u32::from_le_bytes(bytes)), Ordering::SeqCst);
            }),
        )
        .unwrap()
        .unwrap();

    (subscription, sum)
}

#[test]
fn publish_and_subscribe_round_trip() {
    let connection = connect(start_relay());
    let (subscription, sum) = subscribe_summing(connection.as_ref(), "test_channel");

    let mut rng = rand::thread_rng();
    let mut expected = 0;
    for _ in 0..100 {
        let value: u32 = rng.gen_range(0..=1_000);
        expected += u64::from(value);
        connection
            .publish("test_channel", &value.to_le_bytes())
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        sum.load(Ordering::SeqCst) == expected
    }));

    connection.disconnect();
    assert!(!connection.is_connected());
    assert!(!subscription.is_active());
}

#[test]
fn unsubscribed_channel_stays_silent() {
    let connection = connect(start_relay());

    let (subscription, sum) = subscribe_summing(connection.as_ref(), "test_channel");
    let (other, other_sum) = subscribe_summing(connection.as_ref(), "unrelated_channel");

    let mut expected = 0;
    for value in 1..=100u32 {
        expected += u64::from(value);
        connection
            .publish("test_channel", &value.to_le_bytes())
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        sum.load(Ordering::SeqCst) == expected
    }));

    assert!(subscription.is_active());
    subscription.unsubscribe();
    assert!(!subscription.is_active());

    for value in 1..=100u32 {
        connection
            .publish("test_channel", &value.to_le_bytes())
            .unwrap();
    }
    thread::sleep(Duration::from_millis(300));

    // The unsubscribed channel saw only the first batch, and the pattern
    // that never matched saw nothing at all.
    assert_eq!(sum.load(Ordering::SeqCst), expected);
    assert_eq!(other_sum.load(Ordering::SeqCst), 0);
    assert!(other.is_active());

    connection.disconnect();
}

#[test]
fn torn_down_connection_rejects_everything() {
    let connection = connect(start_relay());
    let subscription = connection
        .subscribe("test_channel", Box::new(|_, _| {}))
        .unwrap()
        .unwrap();

    for _ in 0..5 {
        subscription.unsubscribe();
    }
    for _ in 0..5 {
        connection.disconnect();
    }

    assert!(!connection.is_connected());
    assert!(connection
        .subscribe("test_channel", Box::new(|_, _| {}))
        .unwrap()
        .is_none());
    assert!(matches!(
        connection.publish("test_channel", &[0, 0, 0, 0]),
        Err(PublishError::NotConnected)
    ));
}

#[test]
fn threaded_publishers_all_arrive() {
    let connection: Arc<dyn LcmConnection> = Arc::from(connect(start_relay()));
    let (_subscription, sum) = subscribe_summing(connection.as_ref(), "test_channel");

    const PUBLISHERS: u32 = 10;
    const PER_PUBLISHER: u32 = 500;

    let workers: Vec<_> = (0..PUBLISHERS)
        .map(|worker| {
            let connection = Arc::clone(&connection);
            thread::spawn(move || {
                for index in (worker * PER_PUBLISHER)..((worker + 1) * PER_PUBLISHER) {
                    connection
                        .publish("test_channel", &index.to_le_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Sum of 0..5000.
    let expected = 12_497_500;
    assert!(wait_until(Duration::from_secs(20), || {
        sum.load(Ordering::SeqCst) == expected
    }));

    connection.disconnect();
}

#[test]
fn handshake_mismatch_fails_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    // A relay that garbles one byte of its hello.
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            let mut hello = [0; 8];
            if stream.read_exact(&mut hello).is_err() {
                continue;
            }
            let mut reply = SERVER_HELLO;
            reply[3] = 0xFF;
            let _ = stream.write_all(&reply);
        }
    });

    let url = format!("tcpq://127.0.0.1:{}", address.port());
    let provider = TcpqProvider::new();
    let result = provider.connect(&Url::parse(&url).unwrap());
    assert!(matches!(result, Err(ConnectError::InvalidHandshake)));

    // The registry folds the handshake failure into an absent connection.
    assert!(Lcm::new().connect(&url).unwrap().is_none());
}

#[test]
fn unreachable_relay_yields_an_absent_connection() {
    // Bind and drop a listener to get a port with nothing behind it.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let connection = Lcm::new()
        .connect(&format!("tcpq://127.0.0.1:{}", port))
        .unwrap();
    assert!(connection.is_none());
}

#[test]
fn provider_rejects_foreign_schemes() {
    let provider = TcpqProvider::new();
    let result = provider.connect(&Url::parse("bogus://127.0.0.1:7700").unwrap());

    match result {
        Err(ConnectError::WrongScheme { expected, found }) => {
            assert_eq!(expected, "tcpq");
            assert_eq!(found, "bogus");
        }
        _ => panic!("expected a scheme mismatch"),
    }
}
