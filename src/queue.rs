//! The posted and unexpected queues of an endpoint
//!
//! Both queues are singly linked FIFO lists threaded through one slab of elements. An element
//! caches the masked matching key of its request so that a search never has to touch the request
//! itself. Freed elements go onto a free list and are reused before the slab grows.
//!
//! The queues of an endpoint sit behind one lock, see [`Queues`]. Every operation here is a
//! single critical section, which is what makes "search the unexpected queue, else append to the
//! posted queue" atomic with respect to an arrival doing the mirror image.

use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::envelope::{MaskedKey, SendHandle};
use crate::environment::Config;
use crate::error::{Error, Result};
use crate::request::{Owner, RequestCell};
use crate::{ContextId, Rank, Tag};

/// Queue traits
pub mod traits {
    pub use super::QueueVisitor;
}

/// Names one of the two queues of an endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Receives waiting for a message
    Posted,
    /// Messages waiting for a receive
    Unexpected,
}

/// What inspection shows about one queue element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ElementInfo {
    /// Identity of the request the element holds
    pub request: u64,
    /// Matching context
    pub context: ContextId,
    /// Tag, `0` under a wildcard
    pub tag: Tag,
    /// Tag mask, `0` for a wildcard and all ones otherwise
    pub tagmask: Tag,
    /// Source rank, `0` under a wildcard
    pub source: Rank,
    /// Source mask, `0` for a wildcard and all ones otherwise
    pub srcmask: Rank,
}

impl fmt::Display for ElementInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request {}: context = {}, tag = {}, tagmask = {:#x}, src = {}, srcmask = {:#x}",
            self.request, self.context, self.tag, self.tagmask, self.source, self.srcmask
        )
    }
}

/// Receives queue elements in FIFO order during inspection.
pub trait QueueVisitor {
    /// Called once per element, head first.
    fn visit(&mut self, element: &ElementInfo);
}

impl<F: FnMut(&ElementInfo)> QueueVisitor for F {
    fn visit(&mut self, element: &ElementInfo) {
        self(element)
    }
}

struct Element {
    key: MaskedKey,
    request: Option<Arc<RequestCell>>,
    next: Option<usize>,
}

/// Backing storage for queue elements with a free list.
struct ElementSlab {
    elements: Vec<Element>,
    free: Option<usize>,
    growth: usize,
    limit: Option<usize>,
}

impl ElementSlab {
    fn new(config: &Config) -> ElementSlab {
        let mut slab = ElementSlab {
            elements: Vec::new(),
            free: None,
            growth: config.element_slab_growth.max(1),
            limit: config.element_slab_limit,
        };
        let initial = match slab.limit {
            Some(limit) => config.element_slab_initial.min(limit),
            None => config.element_slab_initial,
        };
        // an initial slab that cannot be had simply starts empty
        let _ = slab.grow(initial);
        slab
    }

    fn capacity(&self) -> usize {
        self.elements.len()
    }

    fn grow(&mut self, by: usize) -> Result<()> {
        let by = match self.limit {
            Some(limit) => by.min(limit.saturating_sub(self.elements.len())),
            None => by,
        };
        if by == 0 {
            return Err(Error::Exhausted);
        }
        self.elements
            .try_reserve_exact(by)
            .map_err(|_| Error::Exhausted)?;
        let start = self.elements.len();
        for i in start..start + by {
            let next = if i + 1 < start + by {
                Some(i + 1)
            } else {
                self.free
            };
            self.elements.push(Element {
                key: MaskedKey {
                    context: 0,
                    tag: 0,
                    tagmask: 0,
                    source: 0,
                    srcmask: 0,
                },
                request: None,
                next,
            });
        }
        self.free = Some(start);
        Ok(())
    }

    fn alloc(&mut self, key: MaskedKey, request: Arc<RequestCell>) -> Result<usize> {
        if self.free.is_none() {
            self.grow(self.growth)?;
        }
        let index = self.free.ok_or(Error::Exhausted)?;
        let element = &mut self.elements[index];
        self.free = element.next;
        element.key = key;
        element.request = Some(request);
        element.next = None;
        Ok(index)
    }

    fn release(&mut self, index: usize) -> Option<Arc<RequestCell>> {
        let element = &mut self.elements[index];
        let request = element.request.take();
        element.next = self.free;
        self.free = Some(index);
        request
    }
}

#[derive(Default)]
struct Queue {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Queue {
    fn append(&mut self, slab: &mut ElementSlab, index: usize) {
        match self.tail {
            Some(tail) => slab.elements[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    /// Unlink `index`, whose predecessor is `prev`, and recycle its element.
    fn unlink(
        &mut self,
        slab: &mut ElementSlab,
        prev: Option<usize>,
        index: usize,
    ) -> Option<Arc<RequestCell>> {
        let next = slab.elements[index].next;
        match prev {
            Some(prev) => slab.elements[prev].next = next,
            None => self.head = next,
        }
        if self.tail == Some(index) {
            self.tail = prev;
        }
        self.len -= 1;
        slab.release(index)
    }

    /// First element, with its predecessor, for which `hit` holds.
    fn find(
        &self,
        slab: &ElementSlab,
        mut hit: impl FnMut(&Element) -> bool,
    ) -> Option<(Option<usize>, usize)> {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let element = &slab.elements[index];
            if hit(element) {
                return Some((prev, index));
            }
            prev = cursor;
            cursor = element.next;
        }
        None
    }

    fn iter<'a>(&self, slab: &'a ElementSlab) -> impl Iterator<Item = &'a Element> + 'a {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let element = &slab.elements[index];
            cursor = element.next;
            Some(element)
        })
    }
}

fn is_live(element: &Element) -> bool {
    element
        .request
        .as_ref()
        .map_or(false, |r| r.owner() == Owner::Pending)
}

/// The two queues of one endpoint and the slab behind them.
pub(crate) struct MatchQueues {
    slab: ElementSlab,
    posted: Queue,
    unexpected: Queue,
    debug: bool,
}

impl MatchQueues {
    pub(crate) fn new(config: &Config) -> MatchQueues {
        MatchQueues {
            slab: ElementSlab::new(config),
            posted: Queue::default(),
            unexpected: Queue::default(),
            debug: config.debug_queues,
        }
    }

    fn queue(&self, id: QueueId) -> &Queue {
        match id {
            QueueId::Posted => &self.posted,
            QueueId::Unexpected => &self.unexpected,
        }
    }

    /// First unexpected arrival whose key falls under the receive pattern `key`.
    ///
    /// Arrivals that another party has already taken are skipped. With `consume` the arrival is
    /// claimed and unlinked.
    pub(crate) fn search_unexpected(
        &mut self,
        key: &MaskedKey,
        consume: bool,
    ) -> Option<Arc<RequestCell>> {
        loop {
            let (prev, index) = self
                .unexpected
                .find(&self.slab, |e| is_live(e) && key.matches(&e.key))?;
            let request = self.slab.elements[index].request.clone()?;
            if !consume {
                return Some(request);
            }
            // claims made outside the lock make the entry invisible to the next round
            if request.try_claim(Owner::Core) {
                self.unexpected.unlink(&mut self.slab, prev, index)?;
                return Some(request);
            }
        }
    }

    /// Consume the first matching unexpected arrival, or append `posted` to the posted queue.
    ///
    /// On a hit `posted` is claimed by the core and not enqueued.
    pub(crate) fn search_unexpected_and_post(
        &mut self,
        posted: &Arc<RequestCell>,
    ) -> Result<Option<Arc<RequestCell>>> {
        if let Some(found) = self.search_unexpected(&posted.key, true) {
            if !posted.try_claim(Owner::Core) {
                return Err(Error::intern(format!(
                    "request {} was claimed before it was posted",
                    posted.id
                )));
            }
            return Ok(Some(found));
        }
        let index = self.slab.alloc(posted.key, Arc::clone(posted))?;
        self.posted.append(&mut self.slab, index);
        Ok(None)
    }

    /// Claim and dequeue the first posted receive whose pattern covers the arrival key `key`.
    pub(crate) fn search_posted(&mut self, key: &MaskedKey) -> Option<Arc<RequestCell>> {
        loop {
            let (prev, index) = self
                .posted
                .find(&self.slab, |e| is_live(e) && e.key.matches(key))?;
            let request = self.slab.elements[index].request.clone()?;
            // the loser of a claim leaves the element for the winner to remove
            if request.try_claim(Owner::Core) {
                self.posted.unlink(&mut self.slab, prev, index)?;
                return Some(request);
            }
        }
    }

    pub(crate) fn enqueue_unexpected(&mut self, request: Arc<RequestCell>) -> Result<()> {
        let index = self.slab.alloc(request.key, request)?;
        self.unexpected.append(&mut self.slab, index);
        Ok(())
    }

    /// Remove `request` from the queue `id` by identity.
    ///
    /// Fails with `Error::Intern` if it is not there, which callers use to learn that someone
    /// else dequeued it first.
    pub(crate) fn remove(
        &mut self,
        request: &Arc<RequestCell>,
        id: QueueId,
    ) -> Result<Arc<RequestCell>> {
        let queue = match id {
            QueueId::Posted => &mut self.posted,
            QueueId::Unexpected => &mut self.unexpected,
        };
        let found = queue.find(&self.slab, |e| {
            e.request.as_ref().map_or(false, |r| Arc::ptr_eq(r, request))
        });
        match found {
            Some((prev, index)) => queue
                .unlink(&mut self.slab, prev, index)
                .ok_or_else(|| Error::intern("queue element without a request")),
            None => Err(Error::intern(format!(
                "request {} is not in the {:?} queue",
                request.id, id
            ))),
        }
    }

    /// The queued unexpected arrival that belongs to the send `sender`.
    pub(crate) fn find_unexpected_from(&self, sender: SendHandle) -> Option<Arc<RequestCell>> {
        self.unexpected
            .iter(&self.slab)
            .filter_map(|e| e.request.as_ref())
            .find(|r| r.sender == Some(sender))
            .cloned()
    }

    /// Number of elements in queue `id`.
    pub(crate) fn len(&self, id: QueueId) -> usize {
        self.queue(id).len
    }

    /// Number of elements the slab holds, queued or free.
    pub(crate) fn slab_capacity(&self) -> usize {
        self.slab.capacity()
    }

    /// Visit every element of queue `id`, head first.
    pub(crate) fn visit(&self, id: QueueId, visitor: &mut dyn QueueVisitor) {
        for element in self.queue(id).iter(&self.slab) {
            let Some(request) = element.request.as_ref() else {
                continue;
            };
            visitor.visit(&ElementInfo {
                request: request.id,
                context: element.key.context,
                tag: element.key.tag,
                tagmask: element.key.tagmask,
                source: element.key.source,
                srcmask: element.key.srcmask,
            });
        }
    }

    /// Log every element of both queues when `debug_queues` is set. Returns the number of
    /// elements logged.
    pub(crate) fn dump(&self) -> usize {
        if !self.debug {
            return 0;
        }
        debug!("queue slab holds {} elements", self.slab_capacity());
        let mut logged = 0;
        for id in [QueueId::Posted, QueueId::Unexpected] {
            debug!("{:?} queue ({} elements):", id, self.len(id));
            self.visit(id, &mut |e: &ElementInfo| {
                debug!("  {}", e);
                logged += 1;
            });
        }
        logged
    }

    /// Empty both queues, returning (posted, unexpected) requests in FIFO order.
    pub(crate) fn drain(&mut self) -> (Vec<Arc<RequestCell>>, Vec<Arc<RequestCell>>) {
        let mut drained = (Vec::new(), Vec::new());
        for (queue, out) in [
            (&mut self.posted, &mut drained.0),
            (&mut self.unexpected, &mut drained.1),
        ] {
            while let Some(head) = queue.head {
                out.extend(queue.unlink(&mut self.slab, None, head));
            }
        }
        drained
    }
}

/// The queues of an endpoint behind their lock.
pub(crate) struct Queues(Mutex<MatchQueues>);

impl Queues {
    pub(crate) fn new(config: &Config) -> Queues {
        Queues(Mutex::new(MatchQueues::new(config)))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MatchQueues> {
        self.0.lock()
    }
}
