//! A pluggable publish/subscribe client for the LCM ecosystem.
//!
//! Peers exchange opaque byte payloads tagged with ASCII channel names.
//! Subscribers supply a regular expression and receive every message whose
//! channel matches it from the start of the name. Two wire protocols are
//! provided out of the box: `tcpq`, a request/response protocol spoken to a
//! TCP queue relay, and `udpm`, a peer-to-peer UDP multicast protocol with
//! fragmentation for large payloads.
//!
//! The [`Lcm`] registry is the front door. It maps URL schemes to providers
//! and hands out connections:
//!
//! ```no_run
//! use rlcm::{Lcm, LcmConnection};
//!
//! let lcm = Lcm::new();
//! let connection = lcm.connect("udpm://239.255.76.76:7667?ttl=1")
//!     .expect("malformed URL")
//!     .expect("transport unavailable");
//!
//! let subscription = connection
//!     .subscribe("POSE.*", Box::new(|channel, data| {
//!         println!("{}: {} bytes", channel, data.len());
//!     }))
//!     .expect("invalid channel pattern")
//!     .expect("connection torn down");
//!
//! connection.publish("POSE_BODY", b"...").expect("not connected");
//!
//! subscription.unsubscribe();
//! connection.disconnect();
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate failure;

pub mod error;

mod message;
pub use crate::message::LcmMessage;

mod subscription;
pub use crate::subscription::{Callback, Subscription};

mod lcm;
pub use crate::lcm::{Lcm, LcmConnection, LcmProvider};
#[cfg(feature = "tcpq")]
pub use crate::lcm::providers::tcpq::TcpqProvider;
#[cfg(feature = "udpm")]
pub use crate::lcm::providers::udpm::UdpmProvider;
