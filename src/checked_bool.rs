//! A checked boolean element type.
//!
//! A Rust `bool` may only ever hold `0` or `1`, so receiving a peer's bytes straight into a `bool`
//! would be undefined behavior. `Bool` is a byte that is checked when it is read instead. The codec
//! applies the same check to every `ElementKind::Bool` it unpacks, so a typed receive through a
//! staging buffer fails with `ErrorKind::Intern` rather than producing an invalid value.
//!
//! `Bool` is exported directly from root of the crate.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

use crate::{
    datatype::Datatype,
    traits::{Equivalence, EquivalenceFromAnyBytes},
};

/// A boolean as it travels between endpoints: one byte, `0` or `1` when valid.
#[derive(Copy, Clone, Debug, Default)]
#[repr(transparent)]
pub struct Bool(u8);

/// A byte that does not encode a boolean.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("Bool contained illegal value 0x{0:x}")]
pub struct BoolError(u8);

impl BoolError {
    /// The offending byte.
    pub fn invalid_value(&self) -> u8 {
        self.0
    }
}

impl Bool {
    /// Constructs a `Bool` object
    pub fn new(value: bool) -> Self {
        Self(value as u8)
    }

    /// Reinterpret a received byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// The byte as it travels on the wire.
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// The value, or the offending byte if this `Bool` does not hold `0` or `1`.
    pub fn valid(&self) -> Result<bool, BoolError> {
        match self.0 {
            0 => Ok(false),
            1 => Ok(true),
            x => Err(BoolError(x)),
        }
    }
}

unsafe impl Equivalence for Bool {
    fn equivalent_datatype() -> Datatype {
        bool::equivalent_datatype()
    }
}

unsafe impl EquivalenceFromAnyBytes for Bool {}

impl From<bool> for Bool {
    fn from(b: bool) -> Self {
        Bool::new(b)
    }
}

impl TryFrom<Bool> for bool {
    type Error = BoolError;

    fn try_from(b: Bool) -> Result<bool, BoolError> {
        b.valid()
    }
}

impl fmt::Display for Bool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.valid() {
            Ok(b) => b.fmt(f),
            Err(_) => f.write_str("invalid"),
        }
    }
}

/// Like a float NaN, an invalid `Bool` is unequal to everything, itself included.
impl PartialEq for Bool {
    fn eq(&self, other: &Self) -> bool {
        self.0 <= 1 && self.0 == other.0
    }
}

/// Invalid values are unordered.
impl PartialOrd for Bool {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.0 > 1 || other.0 > 1 {
            None
        } else {
            Some(self.0.cmp(&other.0))
        }
    }
}

impl PartialEq<bool> for Bool {
    fn eq(&self, other: &bool) -> bool {
        *self == Bool::new(*other)
    }
}

impl PartialEq<Bool> for bool {
    fn eq(&self, other: &Bool) -> bool {
        Bool::new(*self) == *other
    }
}

impl PartialOrd<bool> for Bool {
    fn partial_cmp(&self, other: &bool) -> Option<Ordering> {
        self.partial_cmp(&Bool::new(*other))
    }
}

impl PartialOrd<Bool> for bool {
    fn partial_cmp(&self, other: &Bool) -> Option<Ordering> {
        Bool::new(*self).partial_cmp(other)
    }
}
