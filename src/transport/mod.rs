//! The interface between an endpoint and the transports that move its messages
//!
//! An endpoint never names a concrete transport. It holds an ordered list of adapters and uses
//! them to
//!
//! - make progress (`poll()`), which is where arrivals are handed back to the endpoint through
//!   `Endpoint::incoming()` and its relatives,
//! - start sends and sender-initiated cancellations,
//! - keep a parallel posted queue in sync (`on_post()`, `withdraw()`), for transports that match
//!   receives themselves.
//!
//! Arrivals carry a [`Payload`] that selects how data is delivered once a receive matches: eager
//! data is copied, a rendezvous is pulled later through its [`PendingTransfer`]. A transport with
//! its own posted queue completes receives through `Endpoint::complete_foreign()`.

use std::fmt;
use std::sync::Arc;

use crate::datatype::Format;
use crate::endpoint::Endpoint;
use crate::envelope::{Envelope, MatchKey, SendHandle};
use crate::error::Result;
use crate::request::{Owner, RequestCell};
use crate::Rank;

pub mod foreign;
pub mod mem;

/// Transport traits
pub mod traits {
    pub use super::{PendingTransfer, Transport};
}

/// The kind of transport that delivered a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// A device that copies or pulls bytes, like a TCP or shared memory channel
    Device,
    /// A vendor MPI library with its own posted queue
    VendorMpi,
    /// Handed in directly through `Endpoint::incoming()`
    Unknown,
}

/// How long a poll may take.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollMode {
    /// The transport may block until something happens or its own timeout elapses.
    Blocking,
    /// Return right away.
    NonBlocking,
}

/// What a poll achieved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Nothing happened.
    Idle,
    /// At least one message or control packet was handled.
    Advanced,
}

impl Progress {
    /// `true` for `Progress::Advanced`
    pub fn advanced(self) -> bool {
        self == Progress::Advanced
    }
}

/// The data of an arrival, as far as it is known when the envelope arrives.
pub enum Payload {
    /// The whole message, in the sender's format
    Eager(Vec<u8>),
    /// Only a request to send; the data is pulled once a receive matches
    Rendezvous(Box<dyn PendingTransfer>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Eager(data) => write!(f, "Eager({} bytes)", data.len()),
            Payload::Rendezvous(_) => write!(f, "Rendezvous"),
        }
    }
}

/// A matched rendezvous whose data still has to be pulled.
pub trait PendingTransfer: Send {
    /// Advance the exchange without blocking. Returns the data once it has arrived.
    ///
    /// The first call happens right after the match and is expected to ask the sender for the
    /// data.
    fn test(&mut self, endpoint: &Endpoint) -> Result<Option<Vec<u8>>>;
}

/// A receive sitting in the posted queue, as shown to transports that keep a posted queue of
/// their own.
#[derive(Clone)]
pub struct PostedReceive(pub(crate) Arc<RequestCell>);

impl PostedReceive {
    /// Identity of the receive within its endpoint
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// The receive pattern, wildcards included
    pub fn key(&self) -> MatchKey {
        self.0.key.unmasked()
    }

    /// Does an arrival with `key` satisfy this receive?
    pub fn matches(&self, key: &MatchKey) -> bool {
        self.0.key.matches(&key.masked())
    }

    /// `true` once a transport, the core or a cancellation has taken the receive.
    pub fn is_taken(&self) -> bool {
        self.0.owner() != Owner::Pending
    }

    /// `true` if both refer to the same receive
    pub fn same(&self, other: &PostedReceive) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PostedReceive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostedReceive")
            .field("id", &self.id())
            .field("key", &self.key())
            .finish()
    }
}

/// A send an endpoint asks a transport to carry.
#[derive(Debug)]
pub struct OutgoingSend {
    /// Destination rank
    pub dest: Rank,
    /// The envelope to announce
    pub envelope: Envelope,
    /// The packed data, in `envelope.format`
    pub data: Vec<u8>,
}

/// A transport adapter.
///
/// Implementations must be safe to call from several threads at once; an endpoint may be driven
/// by every thread that waits on one of its requests.
pub trait Transport: Send + Sync {
    /// What kind of transport this is
    fn kind(&self) -> TransportKind;

    /// `true` if sends to `rank` can go through this transport
    fn reaches(&self, rank: Rank) -> bool;

    /// The data format of the endpoint at `rank`, if known
    fn peer_format(&self, rank: Rank) -> Option<Format>;

    /// `true` if every peer reachable through this transport uses the native format
    fn peers_native(&self) -> bool {
        true
    }

    /// Handle whatever has arrived, handing arrivals to `endpoint`.
    fn poll(&self, endpoint: &Endpoint, mode: PollMode) -> Result<Progress>;

    /// Start carrying `send`. The transport reports local completion through
    /// `Endpoint::outgoing_complete()`.
    fn start_send(&self, endpoint: &Endpoint, send: OutgoingSend) -> Result<()>;

    /// Ask `dest` to drop the unmatched message of `send`. The answer is reported through
    /// `Endpoint::anti_send_result()`.
    fn send_anti_send(&self, endpoint: &Endpoint, dest: Rank, send: SendHandle) -> Result<()>;

    /// A receive was appended to the posted queue.
    fn on_post(&self, _posted: &PostedReceive) -> Result<()> {
        Ok(())
    }

    /// A receive left the posted queue through some other path.
    fn withdraw(&self, _posted: &PostedReceive) {}
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport({:?})", self.kind())
    }
}
