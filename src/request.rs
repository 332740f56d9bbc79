//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_receive()` return request objects that own the
//! buffers involved in the operation. The buffer is handed back by a completion operation, either
//! [`wait()`](struct.RecvRequest.html#method.wait) or
//! [`test()`](struct.RecvRequest.html#method.test).
//!
//! A receive that is dropped before it completes is cancelled. If it has already been matched,
//! the transfer runs to completion in the background and its buffer is freed afterwards.
//!
//! Internally every receive and every unexpected arrival is a `RequestCell`. Completion is a
//! publication event: the status and the received bytes are written first, then the completion
//! flag is set with release ordering, so whoever observes `complete == true` also observes the
//! final status.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conv::ConvUtil;
use log::warn;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};

use crate::datatype::{bytes_of_mut, BufferDesc, Datatype, Equivalence, Format};
use crate::endpoint::Endpoint;
use crate::envelope::{Envelope, MaskedKey, MatchKey, SendHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::transmute::EquivalenceFromAnyBytes;
use crate::transport::{Payload, PendingTransfer, TransportKind};
use crate::{Count, Rank, Tag, MSG_CANCELLED};

/// Which queue a request record is made for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Posted,
    Unexpected,
}

/// Who has taken a queued request out of the matching race.
///
/// Every request starts `Pending`. Exactly one party moves it out of `Pending`, with a single
/// compare-and-set, and that party is responsible for removing it from every queue it is in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Owner {
    Pending = 0,
    Core = 1,
    Foreign = 2,
    Cancelled = 3,
}

impl Owner {
    fn from_u8(raw: u8) -> Owner {
        match raw {
            1 => Owner::Core,
            2 => Owner::Foreign,
            3 => Owner::Cancelled,
            _ => Owner::Pending,
        }
    }
}

/// One-shot cleanup run on the transition to complete. Receives the data format of the bytes in
/// the staging buffer, or `None` if nothing was delivered.
pub(crate) type Finish = Box<dyn FnOnce(&mut RecvTarget, Option<Format>) -> Result<()> + Send>;

/// Where the bytes of a posted receive go.
pub(crate) struct RecvTarget {
    /// The caller's buffer
    pub buffer: BufferDesc,
    /// Intermediate storage when the bytes need unpacking first
    pub staging: Option<Vec<u8>>,
    /// Number of wire bytes the receive accepts
    pub capacity: usize,
    /// Wire size of one element, truncation keeps whole elements
    pub element: usize,
    /// Receiving into `Datatype::packed()`, the first byte of `buffer` is the format header
    pub packed: bool,
}

/// A rendezvous that has been matched but whose payload has not been pulled yet.
pub(crate) struct Rendezvous {
    pub envelope: Envelope,
    pub transfer: Box<dyn PendingTransfer>,
}

pub(crate) struct PostedBody {
    pub target: Option<RecvTarget>,
    pub status: Option<Status>,
    pub format: Option<Format>,
    pub finish: Option<Finish>,
    pub pending: Option<Rendezvous>,
    pub transport: TransportKind,
}

pub(crate) struct UnexpectedBody {
    pub envelope: Envelope,
    pub payload: Option<Payload>,
    pub transport: TransportKind,
}

pub(crate) enum Body {
    Posted(PostedBody),
    Unexpected(UnexpectedBody),
}

/// A request record, shared between the caller's handle, the queues and the transports.
pub(crate) struct RequestCell {
    pub id: u64,
    pub role: Role,
    /// The receive pattern of a posted record, the concrete key of an unexpected one
    pub key: MaskedKey,
    /// The send an unexpected record belongs to
    pub sender: Option<SendHandle>,
    owner: AtomicU8,
    complete: AtomicBool,
    body: Mutex<Body>,
    done: Condvar,
}

impl RequestCell {
    pub(crate) fn posted(
        id: u64,
        key: &MatchKey,
        target: RecvTarget,
        finish: Option<Finish>,
    ) -> Arc<RequestCell> {
        Arc::new(RequestCell {
            id,
            role: Role::Posted,
            key: key.masked(),
            sender: None,
            owner: AtomicU8::new(Owner::Pending as u8),
            complete: AtomicBool::new(false),
            body: Mutex::new(Body::Posted(PostedBody {
                target: Some(target),
                status: None,
                format: None,
                finish,
                pending: None,
                transport: TransportKind::Unknown,
            })),
            done: Condvar::new(),
        })
    }

    pub(crate) fn unexpected(
        id: u64,
        envelope: Envelope,
        payload: Payload,
        transport: TransportKind,
    ) -> Arc<RequestCell> {
        Arc::new(RequestCell {
            id,
            role: Role::Unexpected,
            key: envelope.key.masked(),
            sender: Some(envelope.sender),
            owner: AtomicU8::new(Owner::Pending as u8),
            complete: AtomicBool::new(false),
            body: Mutex::new(Body::Unexpected(UnexpectedBody {
                envelope,
                payload: Some(payload),
                transport,
            })),
            done: Condvar::new(),
        })
    }

    pub(crate) fn owner(&self) -> Owner {
        Owner::from_u8(self.owner.load(Ordering::Acquire))
    }

    /// Move the request out of `Pending`. Returns `false` if someone else got there first.
    pub(crate) fn try_claim(&self, to: Owner) -> bool {
        self.owner
            .compare_exchange(
                Owner::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn lock_posted(&self) -> Result<MappedMutexGuard<'_, PostedBody>> {
        MutexGuard::try_map(self.body.lock(), |body| match body {
            Body::Posted(posted) => Some(posted),
            Body::Unexpected(_) => None,
        })
        .map_err(|_| Error::intern(format!("request {} is not a posted receive", self.id)))
    }

    pub(crate) fn lock_unexpected(&self) -> Result<MappedMutexGuard<'_, UnexpectedBody>> {
        MutexGuard::try_map(self.body.lock(), |body| match body {
            Body::Unexpected(unexpected) => Some(unexpected),
            Body::Posted(_) => None,
        })
        .map_err(|_| Error::intern(format!("request {} is not an unexpected arrival", self.id)))
    }

    /// Run the finish step, record `status` and publish completion.
    ///
    /// `posted` must be the locked body of this cell.
    pub(crate) fn complete_with(&self, posted: &mut PostedBody, mut status: Status) {
        if self.is_complete() {
            warn!("request {} completed twice, keeping the first status", self.id);
            return;
        }
        if let Some(finish) = posted.finish.take() {
            if let Some(target) = posted.target.as_mut() {
                if let Err(e) = finish(target, posted.format) {
                    if status.failure.is_none() {
                        status.failure = Some(e);
                    }
                }
            }
        }
        posted.pending = None;
        posted.status = Some(status);
        self.complete.store(true, Ordering::Release);
        self.done.notify_all();
    }

    /// Block for at most `timeout` unless the request is already complete.
    pub(crate) fn wait_complete(&self, timeout: Duration) {
        let mut body = self.body.lock();
        if !self.is_complete() {
            self.done.wait_for(&mut body, timeout);
        }
    }

    /// Take the status and buffer out of a completed posted receive.
    pub(crate) fn take_result(&self) -> Received {
        match self.lock_posted() {
            Ok(mut posted) => {
                let status = posted.status.take().unwrap_or_else(|| {
                    let key = self.key.unmasked();
                    Status::failed(key.source, key.tag, Error::intern("no status"))
                });
                let buffer = posted
                    .target
                    .take()
                    .map(|t| t.buffer)
                    .unwrap_or_else(|| BufferDesc::null(0, Datatype::packed()));
                Received {
                    status,
                    buffer,
                    transport: posted.transport,
                }
            }
            Err(e) => Received {
                status: Status::failed(self.key.unmasked().source, self.key.unmasked().tag, e),
                buffer: BufferDesc::null(0, Datatype::packed()),
                transport: TransportKind::Unknown,
            },
        }
    }
}

impl fmt::Debug for RequestCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCell")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("key", &self.key)
            .field("owner", &self.owner())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Describes the result of a receive or a probe
#[derive(Clone, PartialEq, Eq)]
pub struct Status {
    source: Rank,
    tag: Tag,
    count: usize,
    failure: Option<Error>,
}

impl Status {
    pub(crate) fn new(source: Rank, tag: Tag, count: usize) -> Status {
        Status {
            source,
            tag,
            count,
            failure: None,
        }
    }

    pub(crate) fn failed(source: Rank, tag: Tag, error: Error) -> Status {
        Status {
            source,
            tag,
            count: 0,
            failure: Some(error),
        }
    }

    pub(crate) fn cancelled(source: Rank) -> Status {
        Status {
            source,
            tag: MSG_CANCELLED,
            count: 0,
            failure: Some(Error::Cancelled),
        }
    }

    pub(crate) fn with_failure(mut self, error: Error) -> Status {
        self.failure = Some(error);
        self
    }

    /// The rank of the message source
    pub fn source_rank(&self) -> Rank {
        self.source
    }

    /// The message tag, `MSG_CANCELLED` for a cancelled receive
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Number of bytes delivered, or announced when returned by a probe
    pub fn byte_count(&self) -> usize {
        self.count
    }

    /// Number of whole elements of `datatype` contained in the message
    pub fn count(&self, datatype: &Datatype) -> Count {
        if datatype.size() == 0 {
            return 0;
        }
        (self.count / datatype.size())
            .value_as::<Count>()
            .unwrap_or(Count::MAX)
    }

    /// The error class of the operation, `ErrorKind::Success` if it succeeded
    pub fn error(&self) -> ErrorKind {
        self.failure
            .as_ref()
            .map_or(ErrorKind::Success, Error::kind)
    }

    /// `true` if the receive was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(Error::Cancelled))
    }

    /// Turn a failed status into its error.
    pub fn into_result(self) -> Result<Status> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status {{ source_rank: {}, tag: {}, bytes: {}, error: {:?} }}",
            self.source,
            self.tag,
            self.count,
            self.error()
        )
    }
}

/// The outcome of a completed receive: its status and the buffer it received into.
#[derive(Debug)]
pub struct Received {
    status: Status,
    buffer: BufferDesc,
    transport: TransportKind,
}

impl Received {
    /// The completion status
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// The receive buffer, laid out as its datatype describes
    pub fn buffer(&self) -> &BufferDesc {
        &self.buffer
    }

    /// The storage of the receive buffer
    pub fn bytes(&self) -> &[u8] {
        self.buffer.bytes()
    }

    /// Which kind of transport delivered the message
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Copy the received elements into `buf`, returning the number of bytes copied.
    pub fn copy_into<T>(&self, buf: &mut [T]) -> usize
    where
        T: Equivalence + EquivalenceFromAnyBytes,
    {
        let dst = bytes_of_mut(buf);
        let src = self.buffer.bytes();
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Split into status and buffer.
    pub fn into_parts(self) -> (Status, BufferDesc) {
        (self.status, self.buffer)
    }
}

/// A request object for a non-blocking receive
///
/// # Examples
///
/// ```
/// use mpi_match::environment::Universe;
/// use mpi_match::traits::*;
///
/// let universe = Universe::new(2).unwrap();
/// let (a, b) = (universe.endpoint(0).unwrap(), universe.endpoint(1).unwrap());
///
/// let request = b.process_at_rank(0).immediate_receive_with_tag::<u32>(4, 3).unwrap();
/// a.process_at_rank(1).send_with_tag(&[1u32, 2, 3, 4][..], 3).unwrap();
/// let received = request.wait();
/// assert_eq!(received.status().byte_count(), 16);
/// ```
#[must_use]
pub struct RecvRequest {
    endpoint: Endpoint,
    cell: Option<Arc<RequestCell>>,
}

impl RecvRequest {
    pub(crate) fn new(endpoint: Endpoint, cell: Arc<RequestCell>) -> RecvRequest {
        RecvRequest {
            endpoint,
            cell: Some(cell),
        }
    }

    /// Identity of the request within its endpoint.
    pub fn id(&self) -> u64 {
        self.cell.as_ref().map_or(0, |c| c.id)
    }

    /// Wait for the receive to finish, driving the transports meanwhile.
    pub fn wait(mut self) -> Received {
        match self.cell.take() {
            Some(cell) => {
                self.endpoint.wait_until_complete(&cell);
                cell.take_result()
            }
            None => unreachable!("request handle without a request"),
        }
    }

    /// Test whether the receive has finished.
    ///
    /// If it has, returns the result, otherwise hands the request back. Drives the transports
    /// once without blocking.
    pub fn test(mut self) -> std::result::Result<Received, Self> {
        let done = match self.cell.as_ref() {
            Some(cell) => self.endpoint.test_complete(cell),
            None => false,
        };
        if done {
            if let Some(cell) = self.cell.take() {
                return Ok(cell.take_result());
            }
        }
        Err(self)
    }

    /// Cancel the receive.
    ///
    /// An unmatched receive is completed right away with a cancelled status. Cancelling a
    /// receive that has already been matched or completed does nothing: it completes normally.
    pub fn cancel(&self) -> Result<()> {
        match self.cell.as_ref() {
            Some(cell) => self.endpoint.cancel_recv(cell),
            None => Ok(()),
        }
    }
}

impl Drop for RecvRequest {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            if !cell.is_complete() {
                warn!("receive request {} dropped before completion, cancelling", cell.id);
                if let Err(e) = self.endpoint.cancel_recv(&cell) {
                    warn!("cancelling dropped request {} failed: {}", cell.id, e);
                }
            }
        }
    }
}

impl fmt::Debug for RecvRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvRequest")
            .field("rank", &self.endpoint.rank())
            .field("request", &self.cell)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AntiSend {
    NotRequested,
    Outstanding,
    Settled,
}

struct SendState {
    complete: bool,
    cancelled: bool,
    anti_send: AntiSend,
}

/// Sender-side record of a send.
pub(crate) struct SendCell {
    pub id: u64,
    pub dest: Rank,
    pub key: MatchKey,
    pub len: usize,
    state: Mutex<SendState>,
    done: Condvar,
}

/// What the `keep_send_q` inspection shows about an active send.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SendInfo {
    /// Request identity, also the `id` of its `SendHandle`
    pub request: u64,
    /// Destination rank
    pub dest: Rank,
    /// Matching key the message carries
    pub key: MatchKey,
    /// Payload length in bytes
    pub len: usize,
    /// The data has left the sender
    pub complete: bool,
    /// An anti-send is waiting for its result
    pub cancel_pending: bool,
}

impl SendCell {
    pub(crate) fn new(id: u64, dest: Rank, key: MatchKey, len: usize) -> Arc<SendCell> {
        Arc::new(SendCell {
            id,
            dest,
            key,
            len,
            state: Mutex::new(SendState {
                complete: false,
                cancelled: false,
                anti_send: AntiSend::NotRequested,
            }),
            done: Condvar::new(),
        })
    }

    /// A send is settled once its data is gone and no anti-send is outstanding.
    pub(crate) fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.complete && state.anti_send != AntiSend::Outstanding
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub(crate) fn info(&self) -> SendInfo {
        let state = self.state.lock();
        SendInfo {
            request: self.id,
            dest: self.dest,
            key: self.key,
            len: self.len,
            complete: state.complete,
            cancel_pending: state.anti_send == AntiSend::Outstanding,
        }
    }

    /// Mark the data as gone. Returns `true` if this settles the send.
    pub(crate) fn mark_complete(&self) -> bool {
        let mut state = self.state.lock();
        state.complete = true;
        let settled = state.anti_send != AntiSend::Outstanding;
        self.done.notify_all();
        settled
    }

    /// Returns `false` if an anti-send was already requested.
    pub(crate) fn begin_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.anti_send != AntiSend::NotRequested {
            return false;
        }
        state.anti_send = AntiSend::Outstanding;
        true
    }

    /// Record the receiver's answer to the anti-send. Returns `true` if this settles the send.
    pub(crate) fn settle_cancel(&self, cancelled: bool) -> bool {
        let mut state = self.state.lock();
        state.anti_send = AntiSend::Settled;
        if cancelled {
            state.cancelled = true;
            state.complete = true;
        }
        self.done.notify_all();
        state.complete
    }

    /// Undo `begin_cancel()` when the anti-send could not be emitted.
    pub(crate) fn abort_cancel(&self) {
        let mut state = self.state.lock();
        state.anti_send = AntiSend::NotRequested;
        self.done.notify_all();
    }

    pub(crate) fn wait_settled(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if !(state.complete && state.anti_send != AntiSend::Outstanding) {
            self.done.wait_for(&mut state, timeout);
        }
    }
}

/// The outcome of a settled send.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SendStatus {
    cancelled: bool,
}

impl SendStatus {
    /// `true` if the receiver removed the message before it was matched.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// A request object for a non-blocking send
#[must_use]
pub struct SendRequest {
    endpoint: Endpoint,
    cell: Option<Arc<SendCell>>,
}

impl SendRequest {
    pub(crate) fn new(endpoint: Endpoint, cell: Arc<SendCell>) -> SendRequest {
        SendRequest {
            endpoint,
            cell: Some(cell),
        }
    }

    /// The handle the receiver sees this send as.
    pub fn handle(&self) -> SendHandle {
        SendHandle {
            origin: self.endpoint.rank(),
            id: self.cell.as_ref().map_or(0, |c| c.id),
        }
    }

    /// Wait until the data has left and any cancellation has been answered.
    pub fn wait(mut self) -> SendStatus {
        match self.cell.take() {
            Some(cell) => {
                self.endpoint.wait_until_settled(&cell);
                SendStatus {
                    cancelled: cell.is_cancelled(),
                }
            }
            None => unreachable!("request handle without a request"),
        }
    }

    /// Test whether the send has settled, handing the request back if it has not.
    pub fn test(mut self) -> std::result::Result<SendStatus, Self> {
        let settled = match self.cell.as_ref() {
            Some(cell) => self.endpoint.test_settled(cell),
            None => false,
        };
        if settled {
            if let Some(cell) = self.cell.take() {
                return Ok(SendStatus {
                    cancelled: cell.is_cancelled(),
                });
            }
        }
        Err(self)
    }

    /// Ask the receiver to drop the message if it has not been matched yet.
    ///
    /// Cancellation is advisory: the outcome is only known once the request has settled, see
    /// `SendStatus::is_cancelled()`.
    pub fn cancel(&self) -> Result<()> {
        match self.cell.as_ref() {
            Some(cell) => self.endpoint.cancel_send(cell),
            None => Ok(()),
        }
    }
}

impl Drop for SendRequest {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            if !cell.is_settled() {
                warn!("send request {} dropped before it settled", cell.id);
            }
        }
    }
}

impl fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest")
            .field("rank", &self.endpoint.rank())
            .field("request", &self.cell.as_ref().map(|c| c.info()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(len: usize) -> RecvTarget {
        RecvTarget {
            buffer: BufferDesc::new(len, u8::equivalent_datatype()).unwrap(),
            staging: None,
            capacity: len,
            element: 1,
            packed: false,
        }
    }

    #[test]
    fn exactly_one_claim_wins() {
        let cell = RequestCell::posted(1, &MatchKey::new(0, 1, 1), target(4), None);
        assert_eq!(cell.owner(), Owner::Pending);
        assert!(cell.try_claim(Owner::Foreign));
        assert!(!cell.try_claim(Owner::Core));
        assert!(!cell.try_claim(Owner::Cancelled));
        assert_eq!(cell.owner(), Owner::Foreign);
    }

    #[test]
    fn finish_runs_once_before_completion() {
        let dt = Datatype::vector(2, 1, 2, &u16::equivalent_datatype()).unwrap();
        let held = dt.clone();
        let finish: Finish = Box::new(move |target, format| {
            assert_eq!(format, None);
            assert_eq!(held.ref_count(), 2);
            target.capacity = 0;
            Ok(())
        });
        let cell = RequestCell::posted(2, &MatchKey::new(0, 1, 1), target(4), Some(finish));
        assert_eq!(dt.ref_count(), 2);
        {
            let mut posted = cell.lock_posted().unwrap();
            cell.complete_with(&mut posted, Status::cancelled(1));
            assert!(posted.finish.is_none());
            cell.complete_with(&mut posted, Status::new(1, 1, 4));
        }
        assert!(cell.is_complete());
        assert_eq!(dt.ref_count(), 1);

        let received = cell.take_result();
        assert!(received.status().is_cancelled());
        assert_eq!(received.status().tag(), MSG_CANCELLED);
    }

    #[test]
    fn finish_failure_lands_in_status() {
        let finish: Finish = Box::new(|_, _| Err(Error::intern("undecodable")));
        let cell = RequestCell::posted(3, &MatchKey::new(0, 5, 2), target(1), Some(finish));
        let mut posted = cell.lock_posted().unwrap();
        cell.complete_with(&mut posted, Status::new(2, 5, 1));
        let status = posted.status.clone().unwrap();
        assert_eq!(status.error(), ErrorKind::Intern);
        assert_eq!(status.source_rank(), 2);
        assert_eq!(status.tag(), 5);
    }

    #[test]
    fn status_counts_elements() {
        let status = Status::new(0, 0, 12);
        assert_eq!(status.count(&u32::equivalent_datatype()), 3);
        assert_eq!(status.count(&f64::equivalent_datatype()), 1);
        assert!(status.clone().into_result().is_ok());
        let truncated = status.with_failure(Error::Truncate {
            received: 12,
            capacity: 8,
        });
        assert_eq!(truncated.error(), ErrorKind::Truncate);
        assert!(truncated.into_result().is_err());
    }

    #[test]
    fn send_cell_settles_after_anti_send() {
        let cell = SendCell::new(9, 1, MatchKey::new(0, 7, 0), 3);
        assert!(cell.mark_complete());
        assert!(cell.begin_cancel());
        assert!(!cell.begin_cancel());
        assert!(!cell.is_settled());
        assert!(cell.info().cancel_pending);
        assert!(cell.settle_cancel(true));
        assert!(cell.is_settled());
        assert!(cell.is_cancelled());
    }
}
