//! An in-process device connecting endpoints through channels
//!
//! Every rank owns an inbox, a crossbeam channel that all other ranks can push packets into.
//! Messages up to the eager limit travel in one packet. Larger ones announce themselves with a
//! request to send; the data stays with the sender until the receiver has matched the request
//! and answers with a clear to send naming a pull slot, which the data packet then fills.
//!
//! ```text
//! sender                      receiver
//!   | -- RequestToSend ------->  |   (arrival, payload = pull)
//!   |                            |   matched by a receive
//!   | <------- ClearToSend ----  |
//!   | -- Data ---------------->  |   pull slot filled, receive completes
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::datatype::Format;
use crate::endpoint::Endpoint;
use crate::envelope::{Envelope, SendHandle};
use crate::error::{Error, Result};
use crate::transport::{
    OutgoingSend, Payload, PendingTransfer, PollMode, Progress, Transport, TransportKind,
};
use crate::Rank;

/// Messages larger than this many bytes use the rendezvous protocol by default.
pub const DEFAULT_EAGER_LIMIT: usize = 16 * 1024;

/// Default upper bound on a single blocking poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug)]
enum Packet {
    Eager {
        envelope: Envelope,
        data: Vec<u8>,
    },
    RequestToSend {
        envelope: Envelope,
    },
    ClearToSend {
        send: SendHandle,
        pull: u64,
        reply_to: Rank,
    },
    Data {
        pull: u64,
        data: Vec<u8>,
    },
    AntiSend {
        send: SendHandle,
        reply_to: Rank,
    },
    AntiSendResult {
        send_id: u64,
        cancelled: bool,
    },
}

struct Fabric {
    inboxes: Vec<(Sender<Packet>, Receiver<Packet>)>,
    /// Held while a rank drains its inbox, so packets reach the endpoint in arrival order
    draining: Vec<Mutex<()>>,
    formats: Vec<Format>,
    eager_limit: AtomicUsize,
    poll_timeout: AtomicU64,
    next_pull: AtomicU64,
    /// Receiver side: data of matched rendezvous, by pull id
    pulls: Mutex<HashMap<u64, Option<Vec<u8>>>>,
    /// Sender side: data waiting for a clear to send, by (origin, send id)
    staged: Mutex<HashMap<(Rank, u64), Vec<u8>>>,
}

impl Fabric {
    fn eager_limit(&self) -> usize {
        self.eager_limit.load(Ordering::Relaxed)
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_nanos(self.poll_timeout.load(Ordering::Relaxed))
    }

    fn post(&self, dest: Rank, packet: Packet) -> Result<()> {
        let index = usize::try_from(dest).map_err(|_| Error::Rank(dest))?;
        let (sender, _) = self.inboxes.get(index).ok_or(Error::Rank(dest))?;
        sender
            .send(packet)
            .map_err(|_| Error::Transport(format!("inbox of rank {} is closed", dest)))
    }
}

/// A set of in-process endpoints' channels.
///
/// # Examples
///
/// ```
/// use mpi_match::datatype::Format;
/// use mpi_match::endpoint::Endpoint;
/// use mpi_match::transport::mem::MemFabric;
///
/// let fabric = MemFabric::new(&[Format::native(); 2]).with_eager_limit(64);
/// let endpoint = Endpoint::builder(0)
///     .transport(fabric.transport(0).unwrap())
///     .build()
///     .unwrap();
/// assert_eq!(endpoint.rank(), 0);
/// ```
#[derive(Clone)]
pub struct MemFabric {
    shared: Arc<Fabric>,
}

impl MemFabric {
    /// A fabric with one rank per entry of `formats`, each using that data format.
    pub fn new(formats: &[Format]) -> MemFabric {
        MemFabric {
            shared: Arc::new(Fabric {
                inboxes: formats.iter().map(|_| unbounded()).collect(),
                draining: formats.iter().map(|_| Mutex::new(())).collect(),
                formats: formats.to_vec(),
                eager_limit: AtomicUsize::new(DEFAULT_EAGER_LIMIT),
                poll_timeout: AtomicU64::new(DEFAULT_POLL_TIMEOUT.as_nanos() as u64),
                next_pull: AtomicU64::new(1),
                pulls: Mutex::new(HashMap::new()),
                staged: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Use rendezvous for messages longer than `bytes`.
    pub fn with_eager_limit(self, bytes: usize) -> MemFabric {
        self.shared.eager_limit.store(bytes, Ordering::Relaxed);
        self
    }

    /// Bound a single blocking poll by `timeout`.
    pub fn with_poll_timeout(self, timeout: Duration) -> MemFabric {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.shared.poll_timeout.store(nanos, Ordering::Relaxed);
        self
    }

    /// Number of ranks
    pub fn size(&self) -> usize {
        self.shared.inboxes.len()
    }

    /// Data format of `rank`
    pub fn format(&self, rank: Rank) -> Option<Format> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.shared.formats.get(r).copied())
    }

    /// The transport the endpoint at `rank` should use.
    pub fn transport(&self, rank: Rank) -> Result<Arc<dyn Transport>> {
        if self.format(rank).is_none() {
            return Err(Error::Rank(rank));
        }
        Ok(Arc::new(MemTransport {
            fabric: Arc::clone(&self.shared),
            rank,
        }))
    }
}

/// One rank's view of a `MemFabric`.
struct MemTransport {
    fabric: Arc<Fabric>,
    rank: Rank,
}

impl MemTransport {
    fn inbox(&self) -> Result<&Receiver<Packet>> {
        usize::try_from(self.rank)
            .ok()
            .and_then(|r| self.fabric.inboxes.get(r))
            .map(|(_, receiver)| receiver)
            .ok_or(Error::Rank(self.rank))
    }

    fn draining(&self) -> Result<&Mutex<()>> {
        usize::try_from(self.rank)
            .ok()
            .and_then(|r| self.fabric.draining.get(r))
            .ok_or(Error::Rank(self.rank))
    }

    fn handle(&self, endpoint: &Endpoint, packet: Packet) -> Result<()> {
        trace!("rank {} handles {:?}", self.rank, packet);
        match packet {
            Packet::Eager { envelope, data } => {
                endpoint.incoming_from(TransportKind::Device, envelope, Payload::Eager(data))
            }
            Packet::RequestToSend { envelope } => {
                let pull = MemPull {
                    fabric: Arc::clone(&self.fabric),
                    receiver: self.rank,
                    sender: envelope.sender,
                    pull: None,
                };
                endpoint.incoming_from(
                    TransportKind::Device,
                    envelope,
                    Payload::Rendezvous(Box::new(pull)),
                )
            }
            Packet::ClearToSend {
                send,
                pull,
                reply_to,
            } => {
                let data = self.fabric.staged.lock().remove(&(send.origin, send.id));
                match data {
                    Some(data) => {
                        self.fabric.post(reply_to, Packet::Data { pull, data })?;
                        endpoint.outgoing_complete(send.id);
                    }
                    None => debug!("clear to send for send {} without data", send.id),
                }
                Ok(())
            }
            Packet::Data { pull, data } => {
                let mut pulls = self.fabric.pulls.lock();
                match pulls.get_mut(&pull) {
                    Some(slot) => *slot = Some(data),
                    None => debug!("data for abandoned pull {}", pull),
                }
                Ok(())
            }
            Packet::AntiSend { send, reply_to } => {
                let cancelled = endpoint.incoming_anti_send(send)?;
                self.fabric.post(
                    reply_to,
                    Packet::AntiSendResult {
                        send_id: send.id,
                        cancelled,
                    },
                )
            }
            Packet::AntiSendResult { send_id, cancelled } => {
                if cancelled {
                    self.fabric.staged.lock().remove(&(self.rank, send_id));
                }
                endpoint.anti_send_result(send_id, cancelled);
                Ok(())
            }
        }
    }
}

impl Transport for MemTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Device
    }

    fn reaches(&self, rank: Rank) -> bool {
        usize::try_from(rank).map_or(false, |r| r < self.fabric.inboxes.len())
    }

    fn peer_format(&self, rank: Rank) -> Option<Format> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.fabric.formats.get(r).copied())
    }

    fn peers_native(&self) -> bool {
        self.fabric.formats.iter().all(|f| f.is_native())
    }

    fn poll(&self, endpoint: &Endpoint, mode: PollMode) -> Result<Progress> {
        let inbox = self.inbox()?;
        // another thread is draining this inbox and hands its packets over in order
        let Some(_draining) = self.draining()?.try_lock() else {
            return Ok(Progress::Idle);
        };
        let mut progress = Progress::Idle;
        if mode == PollMode::Blocking {
            match inbox.recv_timeout(self.fabric.poll_timeout()) {
                Ok(packet) => {
                    self.handle(endpoint, packet)?;
                    progress = Progress::Advanced;
                }
                Err(RecvTimeoutError::Timeout) => return Ok(Progress::Idle),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport("inbox disconnected".to_owned()))
                }
            }
        }
        while let Ok(packet) = inbox.try_recv() {
            self.handle(endpoint, packet)?;
            progress = Progress::Advanced;
        }
        Ok(progress)
    }

    fn start_send(&self, endpoint: &Endpoint, send: OutgoingSend) -> Result<()> {
        let OutgoingSend {
            dest,
            envelope,
            data,
        } = send;
        if data.len() <= self.fabric.eager_limit() {
            self.fabric.post(dest, Packet::Eager { envelope, data })?;
            endpoint.outgoing_complete(envelope.sender.id);
        } else {
            self.fabric
                .staged
                .lock()
                .insert((envelope.sender.origin, envelope.sender.id), data);
            if let Err(e) = self.fabric.post(dest, Packet::RequestToSend { envelope }) {
                self.fabric
                    .staged
                    .lock()
                    .remove(&(envelope.sender.origin, envelope.sender.id));
                return Err(e);
            }
        }
        Ok(())
    }

    fn send_anti_send(&self, _endpoint: &Endpoint, dest: Rank, send: SendHandle) -> Result<()> {
        self.fabric.post(
            dest,
            Packet::AntiSend {
                send,
                reply_to: self.rank,
            },
        )
    }
}

/// Receiver side of a matched rendezvous.
struct MemPull {
    fabric: Arc<Fabric>,
    receiver: Rank,
    sender: SendHandle,
    pull: Option<u64>,
}

impl PendingTransfer for MemPull {
    fn test(&mut self, _endpoint: &Endpoint) -> Result<Option<Vec<u8>>> {
        let pull = match self.pull {
            Some(pull) => pull,
            None => {
                let pull = self.fabric.next_pull.fetch_add(1, Ordering::Relaxed);
                self.fabric.pulls.lock().insert(pull, None);
                self.pull = Some(pull);
                self.fabric.post(
                    self.sender.origin,
                    Packet::ClearToSend {
                        send: self.sender,
                        pull,
                        reply_to: self.receiver,
                    },
                )?;
                return Ok(None);
            }
        };
        let mut pulls = self.fabric.pulls.lock();
        match pulls.get_mut(&pull) {
            Some(slot) => match slot.take() {
                Some(data) => {
                    pulls.remove(&pull);
                    self.pull = None;
                    Ok(Some(data))
                }
                None => Ok(None),
            },
            None => Err(Error::intern(format!("pull slot {} vanished", pull))),
        }
    }
}

impl Drop for MemPull {
    fn drop(&mut self) {
        if let Some(pull) = self.pull.take() {
            self.fabric.pulls.lock().remove(&pull);
        }
    }
}
