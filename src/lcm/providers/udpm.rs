//! The UDP multicast provider.
//!
//! Peers exchange datagrams directly over an IPv4 multicast group; there is
//! no relay and no subscription traffic on the wire. Payloads that fit
//! under the fragmentation threshold travel in a single "short" datagram;
//! anything larger is split into ordered fragments that receivers reassemble
//! per (sequence number, sender) pair.

use byteorder::{ByteOrder, NetworkEndian, WriteBytesExt};
use net2::UdpBuilder;
use std::cmp;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::str;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use url::Url;

use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::lcm::{LcmConnection, LcmProvider};
use crate::message::LcmMessage;
use crate::subscription::{Callback, Subscription};

const PROVIDER_NAME: &str = "udpm";
const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 76, 76);
const DEFAULT_PORT: u16 = 7667;
const DEFAULT_TTL: u32 = 1;

/// LCM's magic number for short messages ("LC02").
const MAGIC_SHORT: u32 = 0x4C43_3032;
/// LCM's magic number for message fragments ("LC03").
const MAGIC_LONG: u32 = 0x4C43_3033;

/// The header size for short datagrams: magic and sequence number.
const SHORT_HEADER_SIZE: usize = 8;
/// The header size for fragment datagrams.
const FRAG_HEADER_SIZE: usize = 20;

/// Encoded channel and data lengths below this go out as one short
/// datagram; anything at or above it is fragmented.
const FRAGMENTATION_THRESHOLD: usize = 64_000;
/// The fragment count field is 16 bits.
const MAX_FRAGMENT_COUNT: usize = 65_535;

/// The largest possible datagram.
const READ_BUFFER_SIZE: usize = 65_535;

/// Fragments of a large message arrive in a burst; ask for a receive
/// buffer that can absorb a few of them.
const RECV_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// How long the receiver waits on the socket before re-checking the
/// disconnect flag. Bounds teardown latency.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Provider for the UDP multicast protocol.
///
/// Serves `udpm://[group][:port][?ttl=N]` URLs, defaulting to
/// 239.255.76.76:7667 with a TTL of 1.
pub struct UdpmProvider;

impl UdpmProvider {
    pub fn new() -> Self {
        UdpmProvider
    }
}

impl Default for UdpmProvider {
    fn default() -> Self {
        UdpmProvider::new()
    }
}

impl LcmProvider for UdpmProvider {
    fn connect(&self, url: &Url) -> Result<Box<dyn LcmConnection>, ConnectError> {
        if url.scheme() != PROVIDER_NAME {
            return Err(ConnectError::WrongScheme {
                expected: PROVIDER_NAME,
                found: url.scheme().into(),
            });
        }

        Ok(Box::new(UdpmConnection::new(url)?))
    }
}

/// A connection bound to one multicast group.
pub struct UdpmConnection {
    inner: Arc<Inner>,
}

impl UdpmConnection {
    fn new(url: &Url) -> Result<UdpmConnection, ConnectError> {
        let address = match url.host_str() {
            Some(host) if !host.is_empty() => host
                .parse::<Ipv4Addr>()
                .map_err(|_| ConnectError::InvalidUrl)?,
            _ => DEFAULT_ADDRESS,
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let ttl = parse_ttl(url);

        debug!(
            "Starting udpm connection (group = {}, port = {}, ttl = {})",
            address, port, ttl
        );
        let socket = setup_udp_socket(address, port, ttl)?;

        let inner = Arc::new(Inner {
            socket,
            destination: SocketAddrV4::new(address, port),
            outbound: Mutex::new(0),
            disconnected: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU32::new(0),
            receiver: Mutex::new(None),
        });

        debug!("Starting receiver thread");
        let receiver = Arc::clone(&inner);
        let handle = thread::spawn(move || receiver.receive_loop());
        *inner.receiver.lock().unwrap() = Some(handle);

        Ok(UdpmConnection { inner })
    }
}

impl LcmConnection for UdpmConnection {
    fn publish(&self, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        if !self.inner.is_connected() {
            return Err(PublishError::NotConnected);
        }

        // The sequence number lives inside the outbound lock, so datagram
        // emission and the counter stay consistent under concurrent
        // publishers.
        let mut sequence_number = self.inner.outbound.lock().unwrap();

        let payload_length = channel.len() + 1 + data.len();
        let result = if payload_length < FRAGMENTATION_THRESHOLD {
            self.inner
                .send_short_datagram(*sequence_number, channel, data)
        } else {
            let fragment_count = fragment_count(payload_length);
            if fragment_count > MAX_FRAGMENT_COUNT {
                return Err(PublishError::TooManyFragments(fragment_count));
            }
            self.inner
                .send_fragments(*sequence_number, channel, data, fragment_count as u16)
        };

        if let Err(err) = result {
            drop(sequence_number);
            debug!("Failed to send datagram: {}", err);
            self.inner.disconnect();
            return Ok(());
        }

        *sequence_number = sequence_number.wrapping_add(1);
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
        // Subscriptions are local to this process; nothing goes on the
        // wire for them.
        let remove = Box::new(move || {
            if let Some(inner) = hook_inner.upgrade() {
                inner.subscriptions.lock().unwrap().remove(&id);
            }
        });

        let subscription = Arc::new(Subscription::new(channel, callback, remove)?);
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&subscription));

        Ok(Some(subscription))
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }
}

impl Drop for UdpmConnection {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

/// Connection state shared between user-facing handles, the receiver
/// thread, and subscription removal hooks (which hold it weakly).
struct Inner {
    socket: UdpSocket,

    /// The multicast group datagrams are sent to.
    destination: SocketAddrV4,

    /// Serializes datagram emission and guards the sequence number, which
    /// advances once per logical publish regardless of fragment count.
    outbound: Mutex<u32>,

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

    fn send_short_datagram(
        &self,
        sequence_number: u32,
        channel: &str,
        data: &[u8],
    ) -> io::Result<()> {
        trace!("Sending short datagram on channel \"{}\"", channel);
        let datagram = build_short_datagram(sequence_number, channel, data);

        let sent = self.socket.send_to(&datagram, self.destination)?;
        if sent != datagram.len() {
            warn!(
                "The number of bytes sent ({}) did not equal the size of the datagram ({}).",
                sent,
                datagram.len()
            );
        }
        Ok(())
    }

    fn send_fragments(
        &self,
        sequence_number: u32,
        channel: &str,
        data: &[u8],
        fragment_count: u16,
    ) -> io::Result<()> {
        trace!(
            "Sending {} fragment datagrams on channel \"{}\"",
            fragment_count,
            channel
        );

        let mut fragment_offset = 0;
        for fragment_index in 0..fragment_count {
            let (datagram, next_offset) = build_fragment_datagram(
                sequence_number,
                channel,
                data,
                fragment_index,
                fragment_count,
                fragment_offset,
            );
            fragment_offset = next_offset;

            let sent = self.socket.send_to(&datagram, self.destination)?;
            if sent != datagram.len() {
                warn!(
                    "The number of bytes sent ({}) did not equal the size of the datagram ({}).",
                    sent,
                    datagram.len()
                );
            }
        }

        Ok(())
    }

    /// Reads datagrams and fans reassembled messages out until the
    /// connection dies.
    ///
    /// The fragment buffers are owned by this thread alone.
    fn receive_loop(&self) {
        let mut fragments = HashMap::new();
        let mut buf = vec![0; READ_BUFFER_SIZE];

        while self.is_connected() {
            let (count, source) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    // Poll timeout; re-check the disconnect flag.
                    continue;
                }
                Err(err) => {
                    if self.is_connected() {
                        debug!("Receiver failed to read a datagram: {}", err);
                    }
                    break;
                }
            };

            if let Some(message) = process_datagram(&mut fragments, &buf[..count], source) {
                let subscriptions = self.subscriptions.lock().unwrap();
                for subscription in subscriptions.values() {
                    subscription.receive(&message.channel, &message.data);
                }
            }
        }

        self.disconnect();
    }

    /// Tears the connection down. Idempotent.
    ///
    /// There is no shutdown call for UDP sockets; the receiver notices the
    /// flag at its next poll timeout.
    fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Disconnecting from the multicast group");

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

/// Extracts the TTL from the URL's query.
///
/// The first `ttl` pair wins; a missing or malformed value falls back to
/// the default.
fn parse_ttl(url: &Url) -> u32 {
    use std::borrow::Borrow;

    for (key, value) in url.query_pairs() {
        match key.borrow() {
            "ttl" => return value.parse().unwrap_or(DEFAULT_TTL),
            _ => {}
        }
    }

    DEFAULT_TTL
}

/// Set up the multicast socket.
fn setup_udp_socket(address: Ipv4Addr, port: u16, ttl: u32) -> io::Result<UdpSocket> {
    let builder = UdpBuilder::new_v4()?;

    debug!("Setting SO_REUSEADDR");
    builder.reuse_address(true)?;

    #[cfg(unix)]
    {
        use net2::unix::UnixUdpBuilderExt;
        debug!("Setting SO_REUSEPORT");
        builder.reuse_port(true)?;
    }

    debug!("Binding UDP socket to {}:{}", address, port);
    let socket = builder.bind((address, port))?;

    debug!("Joining multicast group");
    socket.join_multicast_v4(&address, &Ipv4Addr::new(0, 0, 0, 0))?;

    debug!("Enabling multicast loopback");
    socket.set_multicast_loop_v4(true)?;

    debug!("Setting multicast packet TTL to {}", ttl);
    socket.set_multicast_ttl_v4(ttl)?;

    {
        use net2::UdpSocketExt;
        if let Err(err) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            warn!("Unable to grow the receive buffer: {}", err);
        }
    }

    socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;

    Ok(socket)
}

/// The number of fragments a payload of this length splits into.
fn fragment_count(payload_length: usize) -> usize {
    (payload_length + FRAGMENTATION_THRESHOLD - 1) / FRAGMENTATION_THRESHOLD
}

fn build_short_datagram(sequence_number: u32, channel: &str, data: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(SHORT_HEADER_SIZE + channel.len() + 1 + data.len());

    // Writes to a `Vec` cannot fail.
    datagram.write_u32::<NetworkEndian>(MAGIC_SHORT).unwrap();
    datagram
        .write_u32::<NetworkEndian>(sequence_number)
        .unwrap();
    datagram.extend_from_slice(channel.as_bytes());
    datagram.push(0);
    datagram.extend_from_slice(data);

    datagram
}

/// Builds the datagram for one fragment, returning it along with the data
/// offset where the next fragment starts.
///
/// Fragment 0 carries the null-terminated channel ahead of its data slice;
/// every later fragment is pure data. `fragment_offset` counts data bytes
/// only, so the channel never contributes to it.
fn build_fragment_datagram(
    sequence_number: u32,
    channel: &str,
    data: &[u8],
    fragment_index: u16,
    fragment_count: u16,
    fragment_offset: usize,
) -> (Vec<u8>, usize) {
    let mut datagram = Vec::with_capacity(FRAG_HEADER_SIZE + FRAGMENTATION_THRESHOLD);

    // Writes to a `Vec` cannot fail.
    datagram.write_u32::<NetworkEndian>(MAGIC_LONG).unwrap();
    datagram
        .write_u32::<NetworkEndian>(sequence_number)
        .unwrap();
    datagram.write_u32::<NetworkEndian>(data.len() as u32).unwrap();
    datagram
        .write_u32::<NetworkEndian>(fragment_offset as u32)
        .unwrap();
    datagram.write_u16::<NetworkEndian>(fragment_index).unwrap();
    datagram.write_u16::<NetworkEndian>(fragment_count).unwrap();

    let chunk_length = if fragment_index == 0 {
        datagram.extend_from_slice(channel.as_bytes());
        datagram.push(0);
        FRAGMENTATION_THRESHOLD - (channel.len() + 1)
    } else {
        cmp::min(FRAGMENTATION_THRESHOLD, data.len() - fragment_offset)
    };

    let chunk_end = cmp::min(fragment_offset + chunk_length, data.len());
    datagram.extend_from_slice(&data[fragment_offset..chunk_end]);

    (datagram, chunk_end)
}

/// A partially reassembled message.
struct FragmentBuffer {
    /// The channel this message will be delivered on.
    channel: String,

    /// The data received so far, in fragment order.
    data: Vec<u8>,

    /// The sequence number of this message.
    sequence_number: u32,

    /// The number of fragments still missing.
    fragments_remaining: u16,

    /// The index the next fragment must carry.
    next_fragment: u16,
}

/// Fragment buffers are kept per (sequence number, sender), so concurrent
/// senders sharing a sequence number cannot interfere.
type FragmentKey = (u32, SocketAddr);

/// Turns one datagram into a deliverable message, if it completes one.
fn process_datagram(
    fragments: &mut HashMap<FragmentKey, FragmentBuffer>,
    datagram: &[u8],
    source: SocketAddr,
) -> Option<LcmMessage> {
    if datagram.len() < SHORT_HEADER_SIZE {
        debug!("Datagram too short to be a message. Dropping.");
        return None;
    }

    match NetworkEndian::read_u32(&datagram[0..4]) {
        // The sequence number of short datagrams is unused on receive.
        MAGIC_SHORT => process_short_datagram(&datagram[SHORT_HEADER_SIZE..]),
        MAGIC_LONG => process_fragment(fragments, &datagram[4..], source),
        _ => {
            debug!("Invalid magic in datagram. Dropping.");
            None
        }
    }
}

fn process_short_datagram(payload: &[u8]) -> Option<LcmMessage> {
    let (channel, data) = split_channel(payload)?;

    Some(LcmMessage {
        channel: channel.into(),
        data: data.into(),
    })
}

fn process_fragment(
    fragments: &mut HashMap<FragmentKey, FragmentBuffer>,
    body: &[u8],
    source: SocketAddr,
) -> Option<LcmMessage> {
    if body.len() < FRAG_HEADER_SIZE - 4 {
        debug!("Fragment datagram too short. Dropping.");
        return None;
    }

    let sequence_number = NetworkEndian::read_u32(&body[0..4]);
    let _total_length = NetworkEndian::read_u32(&body[4..8]);
    let _fragment_offset = NetworkEndian::read_u32(&body[8..12]);
    let fragment_index = NetworkEndian::read_u16(&body[12..14]);
    let fragment_count = NetworkEndian::read_u16(&body[14..16]);
    let mut payload = &body[16..];

    trace!(
        "Received fragment {} of {} from {}",
        fragment_index,
        fragment_count,
        source
    );

    if fragment_count == 0 {
        debug!("Fragment datagram with a zero fragment count. Dropping.");
        return None;
    }

    let key = (sequence_number, source);

    if fragment_index == 0 {
        let (channel, data) = split_channel(payload)?;
        payload = data;

        // A fresh first fragment replaces whatever partial message was
        // sitting under this key.
        fragments.insert(
            key,
            FragmentBuffer {
                channel: channel.into(),
                data: Vec::new(),
                sequence_number,
                fragments_remaining: fragment_count,
                next_fragment: 0,
            },
        );
    }

    let buffer = match fragments.get_mut(&key) {
        Some(buffer) => buffer,
        None => {
            debug!("Fragment arrived before its first fragment. Dropping.");
            return None;
        }
    };

    if buffer.sequence_number != sequence_number || buffer.next_fragment != fragment_index {
        debug!(
            "Out-of-order fragment {} (expected {}). Dropping the message.",
            fragment_index, buffer.next_fragment
        );
        // The message cannot complete without the skipped fragment, and the
        // key is never reused, so the buffer would otherwise linger forever.
        fragments.remove(&key);
        return None;
    }

    buffer.data.extend_from_slice(payload);
    buffer.fragments_remaining -= 1;
    buffer.next_fragment += 1;

    if buffer.fragments_remaining > 0 {
        return None;
    }

    let buffer = fragments.remove(&key)?;
    trace!(
        "Message on channel \"{}\" fully reassembled ({} bytes)",
        buffer.channel,
        buffer.data.len()
    );

    Some(LcmMessage {
        channel: buffer.channel,
        data: buffer.data,
    })
}

/// Splits a datagram payload at the null terminator ending the channel
/// name.
fn split_channel(payload: &[u8]) -> Option<(&str, &[u8])> {
    let terminator = match payload.iter().position(|&b| b == 0) {
        Some(position) => position,
        None => {
            debug!("Unable to parse channel name in datagram. Dropping.");
            return None;
        }
    };

    match str::from_utf8(&payload[..terminator]) {
        Ok(channel) => Some((channel, &payload[terminator + 1..])),
        Err(_) => {
            debug!("Invalid UTF-8 in channel name. Dropping.");
            None
        }
    }
}
