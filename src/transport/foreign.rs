//! A transport with a posted queue of its own
//!
//! Vendor MPI libraries match receives themselves. To let such a library satisfy a receive that
//! is also sitting in the endpoint's posted queue, `ForeignQueue` mirrors every posted receive in
//! a list of its own. Whichever side matches first claims the receive and tears down the other
//! registration: the core withdraws it from here, this transport removes it from the core's
//! posted queue through `Endpoint::complete_foreign()`.
//!
//! Messages enter through a [`ForeignInjector`], which stands in for the vendor library's
//! progress engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;
use parking_lot::Mutex;

use crate::datatype::Format;
use crate::endpoint::Endpoint;
use crate::envelope::{Envelope, SendHandle};
use crate::error::{Error, Result};
use crate::transport::{
    OutgoingSend, PollMode, PostedReceive, Progress, Transport, TransportKind,
};
use crate::Rank;

const BLOCKING_WAIT: Duration = Duration::from_millis(1);

type Message = (Envelope, Vec<u8>);

#[derive(Default)]
struct ForeignState {
    posted: VecDeque<PostedReceive>,
    arrived: VecDeque<Message>,
}

/// Receive-only transport that keeps a parallel posted queue.
pub struct ForeignQueue {
    inbox: Receiver<Message>,
    state: Mutex<ForeignState>,
    polling: Mutex<()>,
}

/// Hands messages to a `ForeignQueue`.
#[derive(Clone, Debug)]
pub struct ForeignInjector(Sender<Message>);

impl ForeignInjector {
    /// Make a message with `envelope` and `data` available to the next poll.
    pub fn deliver(&self, envelope: Envelope, data: Vec<u8>) -> Result<()> {
        envelope.key.check_concrete()?;
        self.0
            .send((envelope, data))
            .map_err(|_| Error::Transport("foreign queue is gone".to_owned()))
    }
}

impl ForeignQueue {
    /// A new queue and the injector feeding it.
    pub fn new() -> (Arc<ForeignQueue>, ForeignInjector) {
        let (sender, receiver) = unbounded();
        let queue = ForeignQueue {
            inbox: receiver,
            state: Mutex::new(ForeignState::default()),
            polling: Mutex::new(()),
        };
        (Arc::new(queue), ForeignInjector(sender))
    }

    /// Number of receives mirrored here
    pub fn posted_len(&self) -> usize {
        self.state.lock().posted.len()
    }

    /// Number of messages that arrived and found no receive yet
    pub fn arrived_len(&self) -> usize {
        self.state.lock().arrived.len()
    }

    /// First (arrival, receive) pair that matches, in arrival order then posting order. Receives
    /// that someone else has taken are dropped on the way.
    fn next_match(&self) -> Option<(usize, PostedReceive)> {
        let mut state = self.state.lock();
        state.posted.retain(|p| !p.is_taken());
        let ForeignState { posted, arrived } = &mut *state;
        for (i, (envelope, _)) in arrived.iter().enumerate() {
            if let Some(j) = posted.iter().position(|p| p.matches(&envelope.key)) {
                return posted.remove(j).map(|p| (i, p));
            }
        }
        None
    }
}

impl Transport for ForeignQueue {
    fn kind(&self) -> TransportKind {
        TransportKind::VendorMpi
    }

    fn reaches(&self, _rank: Rank) -> bool {
        false
    }

    fn peer_format(&self, _rank: Rank) -> Option<Format> {
        None
    }

    fn poll(&self, endpoint: &Endpoint, mode: PollMode) -> Result<Progress> {
        let Some(_polling) = self.polling.try_lock() else {
            return Ok(Progress::Idle);
        };
        let mut progress = Progress::Idle;

        let first = match mode {
            PollMode::Blocking if self.state.lock().arrived.is_empty() => {
                self.inbox.recv_timeout(BLOCKING_WAIT).ok()
            }
            _ => None,
        };
        {
            let mut state = self.state.lock();
            for message in first.into_iter().chain(self.inbox.try_iter()) {
                state.arrived.push_back(message);
                progress = Progress::Advanced;
            }
        }

        while let Some((i, posted)) = self.next_match() {
            let Some((envelope, data)) = self.state.lock().arrived.remove(i) else {
                break;
            };
            if endpoint.complete_foreign(&posted, &envelope, &data)? {
                trace!("foreign queue completed receive {}", posted.id());
                progress = Progress::Advanced;
            } else {
                // the core got there first, try the next receive
                self.state.lock().arrived.insert(i, (envelope, data));
            }
        }
        Ok(progress)
    }

    fn start_send(&self, _endpoint: &Endpoint, send: OutgoingSend) -> Result<()> {
        Err(Error::Transport(format!(
            "foreign queue cannot send to rank {}",
            send.dest
        )))
    }

    fn send_anti_send(&self, _endpoint: &Endpoint, dest: Rank, _send: SendHandle) -> Result<()> {
        Err(Error::Transport(format!(
            "foreign queue cannot cancel sends to rank {}",
            dest
        )))
    }

    fn on_post(&self, posted: &PostedReceive) -> Result<()> {
        self.state.lock().posted.push_back(posted.clone());
        Ok(())
    }

    fn withdraw(&self, posted: &PostedReceive) {
        self.state.lock().posted.retain(|p| !p.same(posted));
    }
}
