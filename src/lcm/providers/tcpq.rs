//! The TCP queue relay provider.
//!
//! All traffic flows through a relay process over a single TCP stream.
//! After an 8-byte magic/version handshake, the client sends framed
//! publish, subscribe, and unsubscribe requests, and the relay pushes
//! framed message deliveries back down the same stream.

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use url::Url;

use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::lcm::{LcmConnection, LcmProvider};
use crate::message::LcmMessage;
use crate::subscription::{Callback, Subscription};

const PROVIDER_NAME: &str = "tcpq";
const DEFAULT_ADDRESS: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7700;

/// Magic number identifying the relay in its handshake reply.
const MAGIC_SERVER: u32 = 0x2876_17FA;
/// Magic number identifying a client in its handshake.
const MAGIC_CLIENT: u32 = 0x2876_17FB;
/// The protocol revision spoken on both sides of the handshake.
const PROTOCOL_VERSION: u32 = 0x0000_0100;

/// Frame type for a publish request.
const FRAME_PUBLISH: u32 = 1;
/// Frame type for a subscribe request.
const FRAME_SUBSCRIBE: u32 = 2;
/// Frame type for an unsubscribe request.
const FRAME_UNSUBSCRIBE: u32 = 3;

/// Provider for the TCP queue relay protocol.
///
/// Serves `tcpq://[host][:port]` URLs, defaulting to 127.0.0.1:7700.
pub struct TcpqProvider;

impl TcpqProvider {
    pub fn new() -> Self {
        TcpqProvider
    }
}

impl Default for TcpqProvider {
    fn default() -> Self {
        TcpqProvider::new()
    }
}

impl LcmProvider for TcpqProvider {
    fn connect(&self, url: &Url) -> Result<Box<dyn LcmConnection>, ConnectError> {
        if url.scheme() != PROVIDER_NAME {
            return Err(ConnectError::WrongScheme {
                expected: PROVIDER_NAME,
                found: url.scheme().into(),
            });
        }

        Ok(Box::new(TcpqConnection::new(url)?))
    }
}

/// A connection to a tcpq relay.
pub struct TcpqConnection {
    inner: Arc<Inner>,
}

impl TcpqConnection {
    fn new(url: &Url) -> Result<TcpqConnection, ConnectError> {
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => DEFAULT_ADDRESS.to_string(),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);

        debug!("Connecting to tcpq relay at {}:{}", host, port);
        let stream = TcpStream::connect((host.as_str(), port))?;
        perform_handshake(&stream)?;

        let inner = Arc::new(Inner {
            stream,
            outbound: Mutex::new(()),
            disconnected: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU32::new(0),
            receiver: Mutex::new(None),
        });

        debug!("Starting receiver thread");
        let receiver = Arc::clone(&inner);
        let handle = thread::spawn(move || receiver.receive_loop());
        *inner.receiver.lock().unwrap() = Some(handle);

        Ok(TcpqConnection { inner })
    }
}

impl LcmConnection for TcpqConnection {
    fn publish(&self, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        if !self.inner.is_connected() {
            return Err(PublishError::NotConnected);
        }

        trace!("Publishing {} bytes on channel \"{}\"", data.len(), channel);
        let frame = encode_publish_frame(channel, data);
        self.inner.send_frame(&frame, "publish");
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        callback: Callback,
    ) -> Result<Option<Arc<Subscription>>, SubscribeError> {
        if !self.inner.is_connected() {
            return Ok(None);
        }

        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let hook_inner = Arc::downgrade(&self.inner);
        let hook_channel = channel.to_string();
        let remove = Box::new(move || {
            if let Some(inner) = hook_inner.upgrade() {
                inner.remove_subscription(id, &hook_channel);
            }
        });

        let subscription = Arc::new(Subscription::new(channel, callback, remove)?);
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&subscription));

        let frame = encode_channel_frame(FRAME_SUBSCRIBE, channel);
        if !self.inner.send_frame(&frame, "subscribe") {
            return Ok(None);
        }

        Ok(Some(subscription))
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }
}

impl Drop for TcpqConnection {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

/// Connection state shared between user-facing handles, the receiver
/// thread, and subscription removal hooks (which hold it weakly).
struct Inner {
    stream: TcpStream,

    /// Serializes outbound frames. Publish, subscribe, and unsubscribe all
    /// write under this lock, so frames are atomic and totally ordered on
    /// the wire.
    outbound: Mutex<()>,

    disconnected: AtomicBool,

    /// The live subscriptions, keyed by their connection-local id.
    subscriptions: Mutex<HashMap<u32, Arc<Subscription>>>,
    next_subscription_id: AtomicU32,

    /// The receiver thread, joined on disconnect.
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    /// Writes one frame under the outbound lock.
    ///
    /// A write failure tears the connection down; returns whether the frame
    /// went out.
    fn send_frame(&self, frame: &[u8], what: &str) -> bool {
        let result = {
            let _outbound = self.outbound.lock().unwrap();
            (&self.stream).write_all(frame)
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                debug!("Failed to send the {} frame: {}", what, err);
                self.disconnect();
                false
            }
        }
    }

    /// Reads delivery frames and fans them out until the connection dies.
    fn receive_loop(&self) {
        while self.is_connected() {
            let message = match read_message(&mut (&self.stream)) {
                Ok(message) => message,
                Err(err) => {
                    if self.is_connected() {
                        debug!("Receiver failed to read a frame: {}", err);
                    }
                    break;
                }
            };

            trace!(
                "Received {} bytes on channel \"{}\"",
                message.data.len(),
                message.channel
            );
            let subscriptions = self.subscriptions.lock().unwrap();
            for subscription in subscriptions.values() {
                subscription.receive(&message.channel, &message.data);
            }
        }

        self.disconnect();
    }

    /// Removal hook target: drops the subscription from the live set and
    /// tells the relay.
    fn remove_subscription(&self, id: u32, channel: &str) {
        self.subscriptions.lock().unwrap().remove(&id);

        let frame = encode_channel_frame(FRAME_UNSUBSCRIBE, channel);
        self.send_frame(&frame, "unsubscribe");
    }

    /// Tears the connection down. Idempotent.
    fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Disconnecting from the tcpq relay");

        // Shutting down both directions is what unblocks the receiver's
        // pending read.
        let _ = self.stream.shutdown(Shutdown::Both);

        let subscriptions: Vec<_> = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.drain().map(|(_, sub)| sub).collect()
        };
        for subscription in subscriptions {
            subscription.unsubscribe();
        }

        // The receiver runs this same teardown after an I/O error; it must
        // not try to join itself.
        let receiver = self.receiver.lock().unwrap().take();
        if let Some(receiver) = receiver {
            if receiver.thread().id() != thread::current().id() {
                let _ = receiver.join();
            }
        }
    }
}

/// Sends the client magic and checks the relay's reply.
fn perform_handshake(mut stream: &TcpStream) -> Result<(), ConnectError> {
    stream.write_u32::<NetworkEndian>(MAGIC_CLIENT)?;
    stream.write_u32::<NetworkEndian>(PROTOCOL_VERSION)?;

    let magic = stream.read_u32::<NetworkEndian>()?;
    let version = stream.read_u32::<NetworkEndian>()?;
    if (magic, version) != (MAGIC_SERVER, PROTOCOL_VERSION) {
        return Err(ConnectError::InvalidHandshake);
    }

    debug!("Handshake with relay complete");
    Ok(())
}

/// Reads one inbound frame.
///
/// The leading frame type carries no information for a client; the relay
/// only ever pushes message deliveries.
fn read_message<R: Read>(reader: &mut R) -> io::Result<LcmMessage> {
    let _frame_type = reader.read_u32::<NetworkEndian>()?;

    let channel_len = reader.read_u32::<NetworkEndian>()? as usize;
    let mut channel = vec![0; channel_len];
    reader.read_exact(&mut channel)?;
    let channel = String::from_utf8(channel)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "channel name is not ASCII"))?;

    let data_len = reader.read_u32::<NetworkEndian>()? as usize;
    let mut data = vec![0; data_len];
    reader.read_exact(&mut data)?;

    Ok(LcmMessage { channel, data })
}

fn encode_publish_frame(channel: &str, data: &[u8]) -> Vec<u8> {
    let mut frame = encode_channel_frame(FRAME_PUBLISH, channel);
    frame.reserve(4 + data.len());

    // Writes to a `Vec` cannot fail.
    frame.write_u32::<NetworkEndian>(data.len() as u32).unwrap();
    frame.extend_from_slice(data);

    frame
}

fn encode_channel_frame(frame_type: u32, channel: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + channel.len());

    // Writes to a `Vec` cannot fail.
    frame.write_u32::<NetworkEndian>(frame_type).unwrap();
    frame
        .write_u32::<NetworkEndian>(channel.len() as u32)
        .unwrap();
    frame.extend_from_slice(channel.as_bytes());

    frame
}
