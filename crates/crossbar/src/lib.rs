//! Bidirectional, strongly-typed message bus over TCP.
//!
//! Each [`Bus`] optionally listens on an endpoint, initiates outbound
//! connections, and exchanges length-framed messages over optional TLS with
//! a shared-secret handshake. A single callback observes every connection
//! lifecycle transition and every inbound message in a total order, always
//! from the same thread.

mod bus;
mod codec;
mod conn;
mod error;
mod event;
mod event_loop;
mod frame;
mod io_loop;
mod queue;
mod timer;
mod transport;
mod wake;

pub use bus::{Bus, BusConfig, Schedule};
#[cfg(feature = "bitcode")]
pub use codec::BitcodeCodec;
pub use codec::{MessageCodec, Utf8Codec};
pub use conn::{ConnectionId, Endpoint};
pub use error::{BusError, CodecError, CorruptStream};
pub use event::BusEvent;
pub use frame::{FrameBuffer, encode_frame};
pub use queue::ByteLimitedQueue;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// A poisoned guard is still structurally sound here: both loops are built
/// to keep running after a caught panic in their own bodies.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
