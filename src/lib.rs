#![warn(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]

//! Point to point message matching for MPI-style endpoints
//!
//! This crate implements the part of an MPI library that sits between the receive API and the
//! transports that move bytes: it reconciles locally posted receives with arriving envelopes
//! under the MPI matching rules.
//!
//! Every endpoint owns two FIFO queues, the *posted* queue of receives that have not been matched
//! yet and the *unexpected* queue of arrivals that had no posted receive waiting for them. A
//! receive first searches the unexpected queue and, on a miss, is appended to the posted queue in
//! the same critical section. An arrival does the mirror image. Wildcards (`ANY_TAG`,
//! `ANY_SOURCE`) are only allowed on receives and never reorder matches: the first matching
//! element in insertion order always wins.
//!
//! # Usage
//!
//! ```
//! use mpi_match::environment::Universe;
//! use mpi_match::traits::*;
//!
//! let universe = Universe::new(2).unwrap();
//! let (a, b) = (universe.endpoint(0).unwrap(), universe.endpoint(1).unwrap());
//!
//! a.process_at_rank(1).send_with_tag(&[4.0f64, 8.0, 15.0][..], 7).unwrap();
//!
//! let mut msg = [0.0f64; 3];
//! let status = b.process_at_rank(0).receive_into_with_tag(&mut msg[..], 7).unwrap();
//! assert_eq!(msg, [4.0, 8.0, 15.0]);
//! assert_eq!(status.tag(), 7);
//! ```
//!
//! # Features
//!
//! - blocking and non-blocking receive into contiguous and typed buffers
//! - blocking and non-blocking probe
//! - receive cancellation and sender-initiated (anti-send) cancellation
//! - transports that deliver by copy, by rendezvous, or through a foreign posted queue
//! - heterogeneous data formats through a pluggable codec
//!
//! Not supported: collectives, communicator construction, datatype registries and topologies.

pub mod checked_bool;
pub mod codec;
pub mod datatype;
pub mod endpoint;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod point_to_point;
pub mod queue;
pub mod request;
pub mod transmute;
pub mod transport;

pub use crate::checked_bool::Bool;
pub use crate::error::{Error, ErrorKind, Result};

/// Commonly used traits
pub mod traits {
    pub use crate::datatype::traits::*;
    pub use crate::point_to_point::traits::*;
    pub use crate::queue::traits::*;
    pub use crate::transmute::traits::*;
    pub use crate::transport::traits::*;
}

/// Encodes number of values in multi-value messages.
pub type Count = i32;
/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;
/// Identifies an endpoint within a set of connected endpoints.
pub type Rank = i32;
/// Identifies a matching scope, the equivalent of a communicator's context id.
pub type ContextId = u32;

/// Wildcard tag, only valid on receives and probes.
pub const ANY_TAG: Tag = -1;
/// Wildcard source, only valid on receives and probes.
pub const ANY_SOURCE: Rank = -2;
/// Tag reported in the status of a cancelled receive.
pub const MSG_CANCELLED: Tag = -3;
/// Context used by the `Process` and `AnyProcess` helpers unless told otherwise.
pub const DEFAULT_CONTEXT: ContextId = 0;
