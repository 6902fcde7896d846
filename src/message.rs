/// A single message as seen by subscribers.
///
/// Messages are transient: they are created by a connection's receiver,
/// queued per subscription, and handed to the user callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcmMessage {
    /// The ASCII channel name the message was published on.
    pub channel: String,

    /// The opaque payload.
    pub data: Vec<u8>,
}
