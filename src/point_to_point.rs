//! Point to point communication
//!
//! Endpoints of communication are described by types that implement the `Source` and
//! `Destination` traits. Communication operations are implemented as default methods on those
//! traits, on top of the untyped operations of `Endpoint`.
//!
//! # Unfinished features
//!
//! - Buffered, synchronous and ready send modes
//! - Matched probe and matched receive
//! - Persistent requests

use std::mem;

use crate::datatype::{BufferDesc, Equivalence};
use crate::endpoint::Endpoint;
use crate::envelope::MatchKey;
use crate::error::Result;
use crate::request::{RecvRequest, SendRequest, SendStatus, Status};
use crate::transmute::EquivalenceFromAnyBytes;
use crate::{ContextId, Rank, Tag, ANY_SOURCE, ANY_TAG, DEFAULT_CONTEXT};

/// Point to point communication traits
pub mod traits {
    pub use super::{AsEndpoint, Destination, Source};
}

/// Something that is bound to an endpoint and a matching context
pub trait AsEndpoint {
    /// The endpoint operations run on
    fn as_endpoint(&self) -> &Endpoint;

    /// The context messages are matched in
    fn context(&self) -> ContextId;
}

/// Something that can be used as the source in a point to point receive operation
///
/// # Examples
///
/// - A `Process` used as a source for a receive operation will receive data only from the
/// identified endpoint.
/// - An `AnyProcess` receives from every endpoint.
pub trait Source: AsEndpoint {
    /// `Rank` that identifies the source
    fn source_rank(&self) -> Rank;

    /// The receive pattern for `tag`
    fn match_key(&self, tag: Tag) -> MatchKey {
        MatchKey::new(self.context(), tag, self.source_rank())
    }

    /// Probe a source for incoming messages.
    ///
    /// Blocks until a message with tag `tag` is available and returns its `Status` without
    /// receiving it. A later receive with the same pattern is not guaranteed to get that message
    /// if other threads receive from the same endpoint.
    fn probe_with_tag(&self, tag: Tag) -> Result<Status> {
        self.as_endpoint().probe(self.match_key(tag))
    }

    /// Probe a source for incoming messages with any tag.
    fn probe(&self) -> Result<Status> {
        self.probe_with_tag(ANY_TAG)
    }

    /// Probe a source for incoming messages without blocking.
    ///
    /// Returns `None` if no message with tag `tag` is available.
    fn immediate_probe_with_tag(&self, tag: Tag) -> Result<Option<Status>> {
        self.as_endpoint().immediate_probe(self.match_key(tag))
    }

    /// Probe a source for incoming messages with any tag without blocking.
    fn immediate_probe(&self) -> Result<Option<Status>> {
        self.immediate_probe_with_tag(ANY_TAG)
    }

    /// Initiate receiving up to `count` instances of `Msg` with tag `tag`.
    fn immediate_receive_with_tag<Msg>(&self, count: usize, tag: Tag) -> Result<RecvRequest>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        let buffer = BufferDesc::new(count, Msg::equivalent_datatype())?;
        self.as_endpoint()
            .immediate_receive_datatype(self.match_key(tag), buffer)
    }

    /// Initiate receiving up to `count` instances of `Msg` with any tag.
    fn immediate_receive<Msg>(&self, count: usize) -> Result<RecvRequest>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        self.immediate_receive_with_tag::<Msg>(count, ANY_TAG)
    }

    /// Receive a message into a buffer.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` into `buf`. Completion-time
    /// failures such as truncation are reported through `Status::error()`.
    fn receive_into_with_tag<Msg>(&self, buf: &mut [Msg], tag: Tag) -> Result<Status>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        let received = self
            .immediate_receive_with_tag::<Msg>(buf.len(), tag)?
            .wait();
        received.copy_into(buf);
        Ok(received.into_parts().0)
    }

    /// Receive a message with any tag into a buffer.
    fn receive_into<Msg>(&self, buf: &mut [Msg]) -> Result<Status>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        self.receive_into_with_tag(buf, ANY_TAG)
    }

    /// Receive a message containing a single instance of type `Msg`.
    fn receive_with_tag<Msg>(&self, tag: Tag) -> Result<(Msg, Status)>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        // any byte pattern is a valid Msg
        let mut msg: Msg = unsafe { mem::zeroed() };
        let status = self.receive_into_with_tag(std::slice::from_mut(&mut msg), tag)?;
        Ok((msg, status))
    }

    /// Receive a message containing a single instance of type `Msg` with any tag.
    fn receive<Msg>(&self) -> Result<(Msg, Status)>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        self.receive_with_tag(ANY_TAG)
    }

    /// Receive a message containing multiple instances of type `Msg` into a `Vec`.
    ///
    /// The message is probed first and then received from the source and tag the probe
    /// reported, so the vector is sized to fit.
    ///
    /// The probe does not reserve the message. If another thread receives on the same source
    /// and tag in between, this call gets the next matching message instead, and a larger one
    /// is truncated (`ErrorKind::Truncate` in the status). This is the behavior of a plain MPI
    /// probe followed by a receive; callers sharing a source and tag across threads should size
    /// their own buffers.
    fn receive_vec_with_tag<Msg>(&self, tag: Tag) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        let probed = self.probe_with_tag(tag)?;
        let datatype = Msg::equivalent_datatype();
        let count = usize::try_from(probed.count(&datatype)).unwrap_or(0);
        let key = MatchKey::new(self.context(), probed.tag(), probed.source_rank());
        let received = self
            .as_endpoint()
            .immediate_receive_datatype(key, BufferDesc::new(count, datatype)?)?
            .wait();
        // any byte pattern is a valid Msg
        let mut buf: Vec<Msg> = (0..count).map(|_| unsafe { mem::zeroed() }).collect();
        received.copy_into(&mut buf[..]);
        Ok((buf, received.into_parts().0))
    }

    /// Receive a message containing multiple instances of type `Msg` with any tag.
    fn receive_vec<Msg>(&self) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence + EquivalenceFromAnyBytes,
    {
        self.receive_vec_with_tag(ANY_TAG)
    }
}

/// Something that can be used as the destination in a point to point send operation
pub trait Destination: AsEndpoint {
    /// `Rank` that identifies the destination
    fn destination_rank(&self) -> Rank;

    /// Initiate sending the contents of `buf` with tag `tag`.
    ///
    /// The data is packed right away, so `buf` may be reused as soon as this returns.
    fn immediate_send_with_tag<Msg: Equivalence>(
        &self,
        buf: &[Msg],
        tag: Tag,
    ) -> Result<SendRequest> {
        self.as_endpoint()
            .immediate_send_slice(self.destination_rank(), self.context(), tag, buf)
    }

    /// Initiate sending the contents of `buf` with the default tag.
    fn immediate_send<Msg: Equivalence>(&self, buf: &[Msg]) -> Result<SendRequest> {
        self.immediate_send_with_tag(buf, Tag::default())
    }

    /// Send the contents of `buf` with tag `tag`.
    ///
    /// Blocks until the send has settled. For messages the transport sends by rendezvous that
    /// means until the destination has matched it.
    fn send_with_tag<Msg: Equivalence>(&self, buf: &[Msg], tag: Tag) -> Result<SendStatus> {
        Ok(self.immediate_send_with_tag(buf, tag)?.wait())
    }

    /// Send the contents of `buf` with the default tag.
    fn send<Msg: Equivalence>(&self, buf: &[Msg]) -> Result<SendStatus> {
        self.send_with_tag(buf, Tag::default())
    }
}

/// Identifies a single endpoint as seen from another one
#[derive(Copy, Clone, Debug)]
pub struct Process<'a> {
    endpoint: &'a Endpoint,
    rank: Rank,
    context: ContextId,
}

impl<'a> Process<'a> {
    pub(crate) fn new(endpoint: &'a Endpoint, rank: Rank) -> Process<'a> {
        Process {
            endpoint,
            rank,
            context: DEFAULT_CONTEXT,
        }
    }

    /// The same process, matched in context `context`.
    pub fn in_context(self, context: ContextId) -> Process<'a> {
        Process { context, ..self }
    }

    /// The process rank
    pub fn rank(&self) -> Rank {
        self.rank
    }
}

impl<'a> AsEndpoint for Process<'a> {
    fn as_endpoint(&self) -> &Endpoint {
        self.endpoint
    }

    fn context(&self) -> ContextId {
        self.context
    }
}

impl<'a> Source for Process<'a> {
    fn source_rank(&self) -> Rank {
        self.rank
    }
}

impl<'a> Destination for Process<'a> {
    fn destination_rank(&self) -> Rank {
        self.rank
    }
}

/// Identifies an arbitrary endpoint as a source
#[derive(Copy, Clone, Debug)]
pub struct AnyProcess<'a> {
    endpoint: &'a Endpoint,
    context: ContextId,
}

impl<'a> AnyProcess<'a> {
    pub(crate) fn new(endpoint: &'a Endpoint) -> AnyProcess<'a> {
        AnyProcess {
            endpoint,
            context: DEFAULT_CONTEXT,
        }
    }

    /// Any process, matched in context `context`.
    pub fn in_context(self, context: ContextId) -> AnyProcess<'a> {
        AnyProcess { context, ..self }
    }
}

impl<'a> AsEndpoint for AnyProcess<'a> {
    fn as_endpoint(&self) -> &Endpoint {
        self.endpoint
    }

    fn context(&self) -> ContextId {
        self.context
    }
}

impl<'a> Source for AnyProcess<'a> {
    fn source_rank(&self) -> Rank {
        ANY_SOURCE
    }
}
