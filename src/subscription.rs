//! Channel subscriptions and their delivery pipeline.
//!
//! Each subscription owns a bounded queue and a worker thread. The
//! connection's receiver enqueues matching messages; the worker drains the
//! queue and invokes the user callback. This keeps user code off the
//! receiver thread, so one slow consumer cannot stall delivery to the rest
//! of the connection beyond the backpressure of its own queue.

use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::SubscribeError;
use crate::message::LcmMessage;

/// Callback invoked with the channel name and payload of every delivered
/// message.
///
/// Callbacks run on the subscription's worker thread and are expected to be
/// non-blocking. A callback is never invoked concurrently for a single
/// subscription, and invocations happen in enqueue order.
pub type Callback = Box<dyn Fn(&str, &[u8]) + Send + 'static>;

/// Capacity of the per-subscription delivery queue.
///
/// Once the worker falls this far behind, enqueueing blocks the receiver
/// until the callback catches up. The wire protocols offer no flow control,
/// so the bound trades receiver stall for memory.
const DELIVERY_QUEUE_DEPTH: usize = 1024;

/// A live subscription to a channel pattern.
///
/// Obtained from `LcmConnection::subscribe`. Dropping the handle does not
/// end delivery; call [`Subscription::unsubscribe`] (or disconnect the
/// owning connection, which unsubscribes everything).
pub struct Subscription {
    /// The pattern string exactly as supplied to `subscribe`.
    channel: String,

    /// The compiled channel pattern. Immutable for the subscription's
    /// lifetime.
    regex: Regex,

    /// Set exactly once, by `unsubscribe`.
    inactive: AtomicBool,

    /// Sending half of the delivery queue. `None` is the teardown sentinel.
    queue: mpsc::SyncSender<Option<LcmMessage>>,

    /// One-shot hook that detaches this subscription from its owning
    /// connection.
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    /// The worker thread, taken and joined on unsubscribe.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Compiles the channel pattern and starts the delivery worker.
    ///
    /// The `remove` hook is invoked exactly once, from `unsubscribe`, and is
    /// how the owning connection learns that the subscription is gone. It
    /// must not keep a strong reference back to the connection.
    pub(crate) fn new(
        channel: &str,
        callback: Callback,
        remove: Box<dyn FnOnce() + Send>,
    ) -> Result<Subscription, SubscribeError> {
        let regex = Regex::new(channel)?;
        let (queue, feed) = mpsc::sync_channel::<Option<LcmMessage>>(DELIVERY_QUEUE_DEPTH);

        debug!("Starting delivery worker for pattern \"{}\"", channel);
        let worker = thread::spawn(move || {
            // A `None` is the teardown sentinel. A closed queue means every
            // sender is gone, so nothing further can arrive either way.
            while let Ok(Some(message)) = feed.recv() {
                callback(&message.channel, &message.data);
            }
            trace!("Delivery worker exiting");
        });

        Ok(Subscription {
            channel: channel.into(),
            regex,
            inactive: AtomicBool::new(false),
            queue,
            remove: Mutex::new(Some(remove)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Offers a message to this subscription.
    ///
    /// The message is queued for delivery if the subscription is active and
    /// the channel matches the pattern. Blocks when the queue is full.
    pub(crate) fn receive(&self, channel: &str, data: &[u8]) {
        if !self.is_active() || !self.matches(channel) {
            return;
        }

        let message = LcmMessage {
            channel: channel.into(),
            data: data.into(),
        };

        // A send error means the worker is already gone; the message has
        // nowhere to go.
        let _ = self.queue.send(Some(message));
    }

    /// Whether the pattern matches the channel name.
    ///
    /// Patterns bind at the start of the name but are not required to
    /// consume all of it: the pattern "POSE" matches the channel
    /// "POSE_BODY" and does not match "BODY_POSE".
    fn matches(&self, channel: &str) -> bool {
        // The leftmost match starts at 0 exactly when some match does.
        self.regex
            .find(channel)
            .map_or(false, |m| m.start() == 0)
    }

    /// Returns whether the subscription is still delivering messages.
    pub fn is_active(&self) -> bool {
        !self.inactive.load(Ordering::SeqCst)
    }

    /// Returns the pattern string this subscription was created with.
    pub fn get_channel(&self) -> &str {
        &self.channel
    }

    /// Stops delivery and detaches this subscription from its connection.
    ///
    /// Safe to call any number of times; only the first call does anything.
    /// Messages already queued are still handed to the callback before the
    /// worker exits, and the call returns only once it has. Must not be
    /// called from inside the callback itself.
    pub fn unsubscribe(&self) {
        if self.inactive.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Unsubscribing from pattern \"{}\"", self.channel);
        if let Some(remove) = self.remove.lock().unwrap().take() {
            remove();
        }

        let _ = self.queue.send(None);

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}
