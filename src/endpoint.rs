//! Endpoints: the receive coordinator and the send side
//!
//! An `Endpoint` owns the posted and unexpected queues of one rank, the transports it talks
//! through and the codec that converts typed data. It is cheap to clone; clones share
//! everything.
//!
//! Receives go through `immediate_receive_contig()` or `immediate_receive_datatype()`, which
//! search the unexpected queue and post on a miss in one critical section. Transports hand
//! arrivals in through `incoming()`, which searches the posted queue and enqueues on a miss, also
//! in one critical section. Whichever side finds the other delivers the data.
//!
//! Nothing runs in the background. Progress happens when a caller waits, tests or probes, or when
//! it calls `progress()` itself.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::codec::{Codec, NativeCodec};
use crate::datatype::{bytes_of, BufferDesc, Equivalence, Format};
use crate::envelope::{Envelope, MatchKey, SendHandle};
use crate::environment::Config;
use crate::error::{Error, Result};
use crate::point_to_point::{AnyProcess, Process};
use crate::queue::{QueueId, QueueVisitor, Queues};
use crate::request::{
    Finish, Owner, Received, RecvRequest, RecvTarget, Rendezvous, RequestCell, SendCell, SendInfo,
    SendRequest, SendStatus, Status,
};
use crate::transport::{
    OutgoingSend, Payload, PendingTransfer, PollMode, PostedReceive, Progress, Transport,
    TransportKind,
};
use crate::{ContextId, Rank, Tag, ANY_SOURCE};

/// How long a waiter sleeps when polling found nothing to do.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Non-blocking polls tried before a blocking progress call over several transports gives up.
const SPIN_POLLS: usize = 64;

struct Inner {
    rank: Rank,
    format: Format,
    config: Config,
    queues: Queues,
    transports: SmallVec<[Arc<dyn Transport>; 2]>,
    codec: Arc<dyn Codec>,
    next_id: AtomicU64,
    sends: Mutex<HashMap<u64, Arc<SendCell>>>,
    send_q: Option<Mutex<VecDeque<Arc<SendCell>>>>,
    anti_sends: AtomicUsize,
    transfers: Mutex<Vec<Arc<RequestCell>>>,
}

/// Builds an `Endpoint`.
pub struct EndpointBuilder {
    rank: Rank,
    format: Format,
    config: Option<Config>,
    codec: Option<Arc<dyn Codec>>,
    transports: SmallVec<[Arc<dyn Transport>; 2]>,
}

impl EndpointBuilder {
    /// Pack outgoing data in `format` instead of the native one.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Use `config` instead of `Config::global()`.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `codec` instead of `NativeCodec`.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Append a transport. Transports are polled, and sends routed, in the order added.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Build the endpoint.
    pub fn build(self) -> Result<Endpoint> {
        if self.rank < 0 {
            return Err(Error::Rank(self.rank));
        }
        let config = self.config.unwrap_or_else(Config::global);
        Ok(Endpoint(Arc::new(Inner {
            rank: self.rank,
            format: self.format,
            queues: Queues::new(&config),
            send_q: if config.keep_send_q {
                Some(Mutex::new(VecDeque::new()))
            } else {
                None
            },
            config,
            transports: self.transports,
            codec: self.codec.unwrap_or_else(|| Arc::new(NativeCodec)),
            next_id: AtomicU64::new(1),
            sends: Mutex::new(HashMap::new()),
            anti_sends: AtomicUsize::new(0),
            transfers: Mutex::new(Vec::new()),
        })))
    }
}

/// One rank's matching engine
///
/// # Examples
///
/// An endpoint without transports is driven by hand:
///
/// ```
/// use mpi_match::datatype::Format;
/// use mpi_match::endpoint::Endpoint;
/// use mpi_match::envelope::{Envelope, MatchKey, SendHandle};
/// use mpi_match::transport::Payload;
///
/// let endpoint = Endpoint::builder(0).build().unwrap();
/// let request = endpoint.immediate_receive_contig(MatchKey::new(0, 7, 2), 16).unwrap();
///
/// let envelope = Envelope {
///     key: MatchKey::new(0, 7, 2),
///     len: 3,
///     format: Format::native(),
///     sender: SendHandle { origin: 2, id: 1 },
/// };
/// endpoint.incoming(envelope, Payload::Eager(b"abc".to_vec())).unwrap();
///
/// let received = request.wait();
/// assert_eq!(received.status().byte_count(), 3);
/// assert_eq!(&received.bytes()[..3], b"abc");
/// ```
#[derive(Clone)]
pub struct Endpoint(Arc<Inner>);

impl Endpoint {
    /// Start building the endpoint of `rank`.
    pub fn builder(rank: Rank) -> EndpointBuilder {
        EndpointBuilder {
            rank,
            format: Format::native(),
            config: None,
            codec: None,
            transports: SmallVec::new(),
        }
    }

    /// The rank of this endpoint
    pub fn rank(&self) -> Rank {
        self.0.rank
    }

    /// The format this endpoint packs outgoing data in
    pub fn format(&self) -> Format {
        self.0.format
    }

    /// The configuration this endpoint was built with
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// The codec used for typed data
    pub fn codec(&self) -> &dyn Codec {
        &*self.0.codec
    }

    /// A handle for talking to the endpoint at `rank` in the default context.
    pub fn process_at_rank(&self, rank: Rank) -> Process<'_> {
        Process::new(self, rank)
    }

    /// A handle for receiving from any rank in the default context.
    pub fn any_process(&self) -> AnyProcess<'_> {
        AnyProcess::new(self)
    }

    fn next_id(&self) -> u64 {
        self.0.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn source_format(&self, source: Rank) -> Format {
        self.0
            .transports
            .iter()
            .find_map(|t| t.peer_format(source))
            .unwrap_or(self.0.format)
    }

    fn peers_native(&self, source: Rank) -> bool {
        if source == ANY_SOURCE {
            self.0.transports.iter().all(|t| t.peers_native())
        } else {
            self.source_format(source).is_native()
        }
    }

    /// Receive at most `maxlen` bytes matching `key`, blocking until done.
    pub fn receive_contig(&self, key: MatchKey, maxlen: usize) -> Result<Received> {
        Ok(self.immediate_receive_contig(key, maxlen)?.wait())
    }

    /// Post a receive of at most `maxlen` bytes matching `key`.
    pub fn immediate_receive_contig(&self, key: MatchKey, maxlen: usize) -> Result<RecvRequest> {
        key.check_pattern()?;
        let target = RecvTarget {
            buffer: BufferDesc::new(maxlen, u8::equivalent_datatype())?,
            staging: None,
            capacity: maxlen,
            element: 1,
            packed: false,
        };
        self.post(key, target, None)
    }

    /// Receive into `buffer`, blocking until done.
    pub fn receive_datatype(&self, key: MatchKey, buffer: BufferDesc) -> Result<Received> {
        Ok(self.immediate_receive_datatype(key, buffer)?.wait())
    }

    /// Post a receive into `buffer`.
    ///
    /// Contiguous buffers that need no conversion are written directly. Anything else goes
    /// through a staging buffer that is unpacked into `buffer` when the receive completes. The
    /// receive accepts `count` elements in the sender's format; if more arrive, as many whole
    /// elements as fit are delivered and the status reports `ErrorKind::Truncate`.
    pub fn immediate_receive_datatype(
        &self,
        key: MatchKey,
        buffer: BufferDesc,
    ) -> Result<RecvRequest> {
        key.check_pattern()?;
        buffer.validate()?;
        let datatype = buffer.datatype().clone();
        let count = buffer.count();

        if datatype.is_packed() {
            let target = RecvTarget {
                capacity: count.saturating_sub(1),
                element: 1,
                staging: None,
                packed: true,
                buffer,
            };
            return self.post(key, target, None);
        }

        if datatype.is_contiguous()
            && (!datatype.is_format_sensitive() || self.peers_native(key.source))
        {
            let target = RecvTarget {
                capacity: count * datatype.size(),
                element: datatype.size(),
                staging: None,
                packed: false,
                buffer,
            };
            return self.post(key, target, None);
        }

        let src_format = self.source_format(key.source);
        let capacity = self.0.codec.sizeof_remote(&datatype, count, src_format);
        let element = self.0.codec.sizeof_remote(&datatype, 1, src_format);
        let codec = Arc::clone(&self.0.codec);
        let finish: Finish = Box::new(move |target, format| {
            let (Some(format), Some(staging)) = (format, target.staging.take()) else {
                return Ok(());
            };
            codec.unpack(&staging, format, target.buffer.bytes_mut(), &datatype, count)?;
            Ok(())
        });
        let target = RecvTarget {
            capacity,
            element,
            staging: Some(Vec::new()),
            packed: false,
            buffer,
        };
        self.post(key, target, Some(finish))
    }

    fn post(
        &self,
        key: MatchKey,
        target: RecvTarget,
        finish: Option<Finish>,
    ) -> Result<RecvRequest> {
        let cell = RequestCell::posted(self.next_id(), &key, target, finish);
        let found = self.0.queues.lock().search_unexpected_and_post(&cell)?;
        match found {
            Some(arrival) => {
                trace!(
                    "rank {}: receive {} on {} matched arrival {}",
                    self.rank(),
                    cell.id,
                    key,
                    arrival.id
                );
                self.push(&cell, &arrival)?;
            }
            None => {
                trace!("rank {}: receive {} on {} posted", self.rank(), cell.id, key);
                let posted = PostedReceive(Arc::clone(&cell));
                for transport in &self.0.transports {
                    if let Err(e) = transport.on_post(&posted) {
                        warn!(
                            "rank {}: {:?} transport refused receive {}: {}",
                            self.rank(),
                            transport.kind(),
                            cell.id,
                            e
                        );
                    }
                }
            }
        }
        Ok(RecvRequest::new(self.clone(), cell))
    }

    /// Deliver the payload of `arrival` into the matched receive `posted`.
    fn push(&self, posted: &Arc<RequestCell>, arrival: &Arc<RequestCell>) -> Result<()> {
        let (envelope, payload, kind) = {
            let mut body = arrival.lock_unexpected()?;
            (body.envelope, body.payload.take(), body.transport)
        };
        match payload {
            Some(Payload::Eager(data)) => self.deliver(posted, &envelope, &data, kind),
            Some(Payload::Rendezvous(transfer)) => {
                self.begin_transfer(posted, envelope, transfer, kind)
            }
            None => Err(Error::intern(format!(
                "arrival {} has no payload",
                arrival.id
            ))),
        }
    }

    fn deliver(
        &self,
        posted: &RequestCell,
        envelope: &Envelope,
        data: &[u8],
        kind: TransportKind,
    ) -> Result<()> {
        let mut body = posted.lock_posted()?;
        body.transport = kind;
        body.format = Some(envelope.format);
        let status = match body.target.as_mut() {
            Some(target) => self.copy_out(target, envelope, data),
            None => Status::failed(
                envelope.key.source,
                envelope.key.tag,
                Error::intern("receive has no buffer"),
            ),
        };
        trace!(
            "rank {}: receive {} completes with {:?}",
            self.rank(),
            posted.id,
            status
        );
        posted.complete_with(&mut body, status);
        Ok(())
    }

    /// Copy as much of `data` as the receive accepts, whole elements only when truncating.
    fn copy_out(&self, target: &mut RecvTarget, envelope: &Envelope, data: &[u8]) -> Status {
        let received = data.len();
        let mut n = received.min(target.capacity);
        let mut failure = None;
        if received > target.capacity {
            if target.element > 0 {
                n -= n % target.element;
            }
            failure = Some(Error::Truncate {
                received,
                capacity: target.capacity,
            });
        }

        let count = if target.packed {
            match target.buffer.bytes_mut().split_first_mut() {
                Some((header, body)) => {
                    *header = envelope.format.byte();
                    body[..n].copy_from_slice(&data[..n]);
                    n + 1
                }
                None => 0,
            }
        } else if let Some(staging) = target.staging.as_mut() {
            staging.clear();
            if staging.try_reserve_exact(n).is_err() {
                failure = Some(Error::Exhausted);
                0
            } else {
                staging.extend_from_slice(&data[..n]);
                n
            }
        } else {
            let datatype = target.buffer.datatype().clone();
            let out = target.buffer.bytes_mut();
            out[..n].copy_from_slice(&data[..n]);
            if !envelope.format.is_native() && datatype.is_format_sensitive() {
                let raw = out[..n].to_vec();
                let elements = n / datatype.size().max(1);
                if let Err(e) = self
                    .0
                    .codec
                    .unpack(&raw, envelope.format, out, &datatype, elements)
                {
                    failure.get_or_insert(e);
                }
            }
            n
        };

        let status = Status::new(envelope.key.source, envelope.key.tag, count);
        match failure {
            Some(e) => status.with_failure(e),
            None => status,
        }
    }

    fn begin_transfer(
        &self,
        posted: &Arc<RequestCell>,
        envelope: Envelope,
        transfer: Box<dyn PendingTransfer>,
        kind: TransportKind,
    ) -> Result<()> {
        {
            let mut body = posted.lock_posted()?;
            body.transport = kind;
            body.pending = Some(Rendezvous { envelope, transfer });
        }
        debug!(
            "rank {}: receive {} pulls {} bytes from send {:?}",
            self.rank(),
            posted.id,
            envelope.len,
            envelope.sender
        );
        self.0.transfers.lock().push(Arc::clone(posted));
        self.advance_transfer(posted);
        Ok(())
    }

    /// Drive the rendezvous of `cell` once. Returns `true` if it finished.
    fn advance_transfer(&self, cell: &Arc<RequestCell>) -> bool {
        let (pending, kind) = match cell.lock_posted() {
            Ok(mut body) => (body.pending.take(), body.transport),
            Err(_) => return false,
        };
        // whoever took `pending` drives it, everyone else moves on
        let Some(mut rendezvous) = pending else {
            return false;
        };
        match rendezvous.transfer.test(self) {
            Ok(Some(data)) => {
                if let Err(e) = self.deliver(cell, &rendezvous.envelope, &data, kind) {
                    warn!("rank {}: receive {} lost its data: {}", self.rank(), cell.id, e);
                }
            }
            Ok(None) => {
                if let Ok(mut body) = cell.lock_posted() {
                    body.pending = Some(rendezvous);
                }
                return false;
            }
            Err(e) => {
                warn!(
                    "rank {}: rendezvous for receive {} failed: {}",
                    self.rank(),
                    cell.id,
                    e
                );
                if let Ok(mut body) = cell.lock_posted() {
                    let key = rendezvous.envelope.key;
                    cell.complete_with(&mut body, Status::failed(key.source, key.tag, e));
                }
            }
        }
        self.0.transfers.lock().retain(|c| !Arc::ptr_eq(c, cell));
        true
    }

    fn advance_transfers(&self) -> bool {
        let cells: SmallVec<[Arc<RequestCell>; 4]> =
            self.0.transfers.lock().iter().cloned().collect();
        let mut advanced = false;
        for cell in &cells {
            advanced |= self.advance_transfer(cell);
        }
        advanced
    }

    fn poll(&self, transport: &Arc<dyn Transport>, mode: PollMode) -> bool {
        match transport.poll(self, mode) {
            Ok(progress) => progress.advanced(),
            Err(e) => {
                warn!(
                    "rank {}: {:?} transport failed to make progress: {}",
                    self.rank(),
                    transport.kind(),
                    e
                );
                false
            }
        }
    }

    fn poll_all(&self) -> bool {
        let mut advanced = false;
        for transport in &self.0.transports {
            advanced |= self.poll(transport, PollMode::NonBlocking);
        }
        advanced
    }

    /// Drive the transports and any matched rendezvous.
    ///
    /// With a single transport a blocking call lets that transport block. With several, they
    /// are polled without blocking until one of them reports work or a bounded number of rounds
    /// has passed. Transport failures are logged and do not stop the other transports.
    pub fn progress(&self, mode: PollMode) -> Progress {
        let transports = &self.0.transports;
        let mut advanced = self.advance_transfers();
        match (transports.len(), mode) {
            (0, _) => {}
            (1, PollMode::Blocking) if !advanced => {
                advanced = self.poll(&transports[0], PollMode::Blocking);
            }
            (_, PollMode::Blocking) if !advanced => {
                for _ in 0..SPIN_POLLS {
                    if self.poll_all() {
                        advanced = true;
                        break;
                    }
                    thread::yield_now();
                }
            }
            _ => advanced |= self.poll_all(),
        }
        if advanced {
            self.advance_transfers();
            Progress::Advanced
        } else {
            Progress::Idle
        }
    }

    fn idle(&self) {
        if self.0.transports.is_empty() {
            thread::sleep(IDLE_WAIT);
        } else {
            thread::yield_now();
        }
    }

    pub(crate) fn wait_until_complete(&self, cell: &RequestCell) {
        while !cell.is_complete() {
            if !self.progress(PollMode::Blocking).advanced() {
                cell.wait_complete(IDLE_WAIT);
            }
        }
    }

    pub(crate) fn test_complete(&self, cell: &RequestCell) -> bool {
        if cell.is_complete() {
            return true;
        }
        self.progress(PollMode::NonBlocking);
        cell.is_complete()
    }

    fn search_probe(&self, key: &MatchKey) -> Result<Option<Status>> {
        let found = self.0.queues.lock().search_unexpected(&key.masked(), false);
        match found {
            Some(arrival) => {
                let body = arrival.lock_unexpected()?;
                let envelope = body.envelope;
                Ok(Some(Status::new(
                    envelope.key.source,
                    envelope.key.tag,
                    envelope.len,
                )))
            }
            None => Ok(None),
        }
    }

    /// Wait for a message matching `key` without receiving it.
    pub fn probe(&self, key: MatchKey) -> Result<Status> {
        key.check_pattern()?;
        loop {
            if let Some(status) = self.search_probe(&key)? {
                return Ok(status);
            }
            if !self.progress(PollMode::Blocking).advanced() {
                self.idle();
            }
        }
    }

    /// Look for a message matching `key` without receiving it.
    ///
    /// The queues are searched, the transports are driven once without blocking, and the
    /// queues are searched again.
    pub fn immediate_probe(&self, key: MatchKey) -> Result<Option<Status>> {
        key.check_pattern()?;
        if let Some(status) = self.search_probe(&key)? {
            return Ok(Some(status));
        }
        if self.progress(PollMode::NonBlocking).advanced() {
            self.search_probe(&key)
        } else {
            Ok(None)
        }
    }

    /// Hand in an arrival that did not come through a registered transport.
    pub fn incoming(&self, envelope: Envelope, payload: Payload) -> Result<()> {
        self.incoming_from(TransportKind::Unknown, envelope, payload)
    }

    /// Hand in an arrival delivered by a transport of kind `kind`.
    ///
    /// The posted queue is searched; on a hit the payload is delivered right away, otherwise
    /// the arrival is appended to the unexpected queue.
    pub fn incoming_from(
        &self,
        kind: TransportKind,
        envelope: Envelope,
        payload: Payload,
    ) -> Result<()> {
        envelope.key.check_concrete()?;
        let arrival = RequestCell::unexpected(self.next_id(), envelope, payload, kind);
        let matched = {
            let mut queues = self.0.queues.lock();
            match queues.search_posted(&arrival.key) {
                Some(posted) => Some(posted),
                None => {
                    if let Err(e) = queues.enqueue_unexpected(Arc::clone(&arrival)) {
                        warn!(
                            "rank {}: lost arrival on {} from send {:?}: {}",
                            self.rank(),
                            envelope.key,
                            envelope.sender,
                            e
                        );
                        return Err(e);
                    }
                    None
                }
            }
        };
        match matched {
            Some(posted) => {
                trace!(
                    "rank {}: arrival on {} matched receive {}",
                    self.rank(),
                    envelope.key,
                    posted.id
                );
                self.withdraw(&posted);
                self.push(&posted, &arrival)
            }
            None => {
                trace!(
                    "rank {}: arrival on {} is unexpected",
                    self.rank(),
                    envelope.key
                );
                Ok(())
            }
        }
    }

    /// Complete a posted receive on behalf of a transport with its own posted queue.
    ///
    /// Returns `false` if the receive was already taken by the core, another transport or a
    /// cancellation, in which case the caller keeps its message.
    pub fn complete_foreign(
        &self,
        posted: &PostedReceive,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<bool> {
        let cell = &posted.0;
        if !cell.try_claim(Owner::Foreign) {
            return Ok(false);
        }
        let removed = self.0.queues.lock().remove(cell, QueueId::Posted);
        if let Err(e) = removed {
            // the claim is ours, so nobody else will ever complete it
            let mut body = cell.lock_posted()?;
            let failed = Status::failed(envelope.key.source, envelope.key.tag, e.clone());
            cell.complete_with(&mut body, failed);
            return Err(e);
        }
        self.withdraw(cell);
        self.deliver(cell, envelope, data, TransportKind::VendorMpi)?;
        Ok(true)
    }

    fn withdraw(&self, cell: &Arc<RequestCell>) {
        let posted = PostedReceive(Arc::clone(cell));
        for transport in &self.0.transports {
            transport.withdraw(&posted);
        }
    }

    pub(crate) fn cancel_recv(&self, cell: &Arc<RequestCell>) -> Result<()> {
        if cell.is_complete() {
            return Ok(());
        }
        if !cell.try_claim(Owner::Cancelled) {
            trace!(
                "rank {}: receive {} already matched, cancel ignored",
                self.rank(),
                cell.id
            );
            return Ok(());
        }
        let removed = self.0.queues.lock().remove(cell, QueueId::Posted);
        if let Err(e) = removed {
            // the claim is ours, so nobody else will ever complete it
            let mut body = cell.lock_posted()?;
            let key = cell.key.unmasked();
            let failed = Status::failed(key.source, key.tag, e.clone());
            cell.complete_with(&mut body, failed);
            return Err(e);
        }
        self.withdraw(cell);
        let mut body = cell.lock_posted()?;
        cell.complete_with(&mut body, Status::cancelled(cell.key.unmasked().source));
        debug!("rank {}: receive {} cancelled", self.rank(), cell.id);
        Ok(())
    }

    /// Send `data` as raw bytes to `dest`, blocking until the send has settled.
    pub fn send_bytes(
        &self,
        dest: Rank,
        context: ContextId,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<SendStatus> {
        Ok(self.immediate_send_bytes(dest, context, tag, data)?.wait())
    }

    /// Start sending `data` as raw bytes to `dest`.
    pub fn immediate_send_bytes(
        &self,
        dest: Rank,
        context: ContextId,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<SendRequest> {
        let key = MatchKey::new(context, tag, self.rank());
        self.start_send(dest, key, data, self.0.format)
    }

    /// Send the contents of `buffer` to `dest`, blocking until the send has settled.
    pub fn send_datatype(
        &self,
        dest: Rank,
        context: ContextId,
        tag: Tag,
        buffer: &BufferDesc,
    ) -> Result<SendStatus> {
        Ok(self.immediate_send_datatype(dest, context, tag, buffer)?.wait())
    }

    /// Start sending the contents of `buffer` to `dest`.
    ///
    /// A `Datatype::packed()` buffer is sent as is, minus its format header, which becomes the
    /// format of the message.
    pub fn immediate_send_datatype(
        &self,
        dest: Rank,
        context: ContextId,
        tag: Tag,
        buffer: &BufferDesc,
    ) -> Result<SendRequest> {
        buffer.validate()?;
        let key = MatchKey::new(context, tag, self.rank());
        if buffer.datatype().is_packed() {
            let bytes = buffer.bytes();
            let bytes = &bytes[..buffer.count().min(bytes.len())];
            let Some((&header, body)) = bytes.split_first() else {
                return Err(Error::Buffer("packed buffer has no format header"));
            };
            let format = Format::from_byte(header)
                .ok_or_else(|| Error::intern(format!("unknown data format 0x{:x}", header)))?;
            return self.start_send(dest, key, body.to_vec(), format);
        }
        let data = self.0.codec.pack(
            buffer.bytes(),
            buffer.datatype(),
            buffer.count(),
            self.0.format,
        )?;
        self.start_send(dest, key, data, self.0.format)
    }

    pub(crate) fn immediate_send_slice<T: Equivalence>(
        &self,
        dest: Rank,
        context: ContextId,
        tag: Tag,
        buf: &[T],
    ) -> Result<SendRequest> {
        let data = self.0.codec.pack(
            bytes_of(buf),
            &T::equivalent_datatype(),
            buf.len(),
            self.0.format,
        )?;
        let key = MatchKey::new(context, tag, self.rank());
        self.start_send(dest, key, data, self.0.format)
    }

    fn route(&self, dest: Rank) -> Result<&Arc<dyn Transport>> {
        self.0
            .transports
            .iter()
            .find(|t| t.reaches(dest))
            .ok_or(Error::Rank(dest))
    }

    fn start_send(
        &self,
        dest: Rank,
        key: MatchKey,
        data: Vec<u8>,
        format: Format,
    ) -> Result<SendRequest> {
        key.check_concrete()?;
        let transport = self.route(dest)?;
        let id = self.next_id();
        let cell = SendCell::new(id, dest, key, data.len());
        self.0.sends.lock().insert(id, Arc::clone(&cell));
        if let Some(send_q) = &self.0.send_q {
            send_q.lock().push_back(Arc::clone(&cell));
        }

        let envelope = Envelope {
            key,
            len: data.len(),
            format,
            sender: SendHandle {
                origin: self.rank(),
                id,
            },
        };
        trace!(
            "rank {}: send {} of {} bytes on {} to rank {}",
            self.rank(),
            id,
            envelope.len,
            key,
            dest
        );
        let send = OutgoingSend {
            dest,
            envelope,
            data,
        };
        if let Err(e) = transport.start_send(self, send) {
            self.retire_send(&cell);
            return Err(e);
        }
        Ok(SendRequest::new(self.clone(), cell))
    }

    fn retire_send(&self, cell: &Arc<SendCell>) {
        self.0.sends.lock().remove(&cell.id);
        if let Some(send_q) = &self.0.send_q {
            send_q.lock().retain(|c| !Arc::ptr_eq(c, cell));
        }
    }

    /// A transport reports that the data of send `send_id` has left this endpoint.
    pub fn outgoing_complete(&self, send_id: u64) {
        let cell = self.0.sends.lock().get(&send_id).cloned();
        match cell {
            Some(cell) => {
                if cell.mark_complete() {
                    self.retire_send(&cell);
                }
            }
            None => warn!(
                "rank {}: completion for unknown send {}",
                self.rank(),
                send_id
            ),
        }
    }

    pub(crate) fn cancel_send(&self, cell: &Arc<SendCell>) -> Result<()> {
        if !cell.begin_cancel() {
            return Ok(());
        }
        // an eager send may already be retired, it is active again until the result arrives
        let revived = self.0.sends.lock().insert(cell.id, Arc::clone(cell)).is_none();
        if let (true, Some(send_q)) = (revived, &self.0.send_q) {
            send_q.lock().push_back(Arc::clone(cell));
        }
        self.0.anti_sends.fetch_add(1, Ordering::SeqCst);

        let handle = SendHandle {
            origin: self.rank(),
            id: cell.id,
        };
        let emitted = self
            .route(cell.dest)
            .and_then(|t| t.send_anti_send(self, cell.dest, handle));
        if let Err(e) = emitted {
            cell.abort_cancel();
            self.0.anti_sends.fetch_sub(1, Ordering::SeqCst);
            if cell.is_settled() {
                self.retire_send(cell);
            }
            return Err(e);
        }
        debug!(
            "rank {}: anti-send for send {} to rank {}",
            self.rank(),
            cell.id,
            cell.dest
        );
        Ok(())
    }

    /// The receiver of an anti-send asks to remove the unmatched arrival of `sender`.
    ///
    /// Returns `true` if the arrival was found and dropped.
    pub fn incoming_anti_send(&self, sender: SendHandle) -> Result<bool> {
        let removed = {
            let mut queues = self.0.queues.lock();
            match queues.find_unexpected_from(sender) {
                Some(arrival) if arrival.try_claim(Owner::Cancelled) => {
                    Some(queues.remove(&arrival, QueueId::Unexpected)?)
                }
                _ => None,
            }
        };
        debug!(
            "rank {}: anti-send for {:?} {}",
            self.rank(),
            sender,
            if removed.is_some() {
                "removed the message"
            } else {
                "came too late"
            }
        );
        Ok(removed.is_some())
    }

    /// A transport reports the receiver's answer to the anti-send of send `send_id`.
    pub fn anti_send_result(&self, send_id: u64, cancelled: bool) {
        let cell = self.0.sends.lock().get(&send_id).cloned();
        let Some(cell) = cell else {
            warn!(
                "rank {}: anti-send result for unknown send {}",
                self.rank(),
                send_id
            );
            return;
        };
        let settled = cell.settle_cancel(cancelled);
        let _ = self
            .0
            .anti_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if settled {
            self.retire_send(&cell);
        }
    }

    /// Number of anti-sends still waiting for their result
    pub fn outstanding_anti_sends(&self) -> usize {
        self.0.anti_sends.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_until_settled(&self, cell: &SendCell) {
        while !cell.is_settled() {
            if !self.progress(PollMode::Blocking).advanced() {
                cell.wait_settled(IDLE_WAIT);
            }
        }
    }

    pub(crate) fn test_settled(&self, cell: &SendCell) -> bool {
        if cell.is_settled() {
            return true;
        }
        self.progress(PollMode::NonBlocking);
        cell.is_settled()
    }

    /// Shut the endpoint down.
    ///
    /// Waits until every anti-send has been answered, then empties both queues. Receives that
    /// were still posted complete as cancelled, unexpected arrivals are dropped.
    pub fn finalize(&self) -> Result<()> {
        while self.outstanding_anti_sends() > 0 {
            if !self.progress(PollMode::Blocking).advanced() {
                self.idle();
            }
        }
        let (posted, unexpected) = self.0.queues.lock().drain();
        for cell in &posted {
            if cell.try_claim(Owner::Cancelled) {
                self.withdraw(cell);
                let mut body = cell.lock_posted()?;
                cell.complete_with(&mut body, Status::cancelled(cell.key.unmasked().source));
            }
        }
        debug!(
            "rank {}: finalized, {} posted receives cancelled, {} unexpected arrivals dropped",
            self.rank(),
            posted.len(),
            unexpected.len()
        );
        Ok(())
    }

    /// Visit every element of `queue`, head first.
    ///
    /// The queues are locked while the visitor runs; it must not call back into the endpoint.
    pub fn inspect(&self, queue: QueueId, visitor: &mut dyn QueueVisitor) {
        self.0.queues.lock().visit(queue, visitor)
    }

    /// Number of elements in `queue`
    pub fn queue_len(&self, queue: QueueId) -> usize {
        self.0.queues.lock().len(queue)
    }

    /// Log both queues at debug level if `debug_queues` is set.
    pub fn dump_queues(&self) {
        self.0.queues.lock().dump();
    }

    /// Visit every active send, oldest first. Returns `false`, visiting nothing, unless the
    /// endpoint was built with `keep_send_q`.
    pub fn inspect_sends(&self, mut visitor: impl FnMut(&SendInfo)) -> bool {
        match &self.0.send_q {
            Some(send_q) => {
                for cell in send_q.lock().iter() {
                    visitor(&cell.info());
                }
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("rank", &self.0.rank)
            .field("format", &self.0.format)
            .field("transports", &self.0.transports)
            .finish()
    }
}
