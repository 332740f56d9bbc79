//! Matching keys and envelopes
//!
//! A matching key is the triple (context, tag, source). Receives may use `ANY_TAG` and
//! `ANY_SOURCE`, arrivals always carry concrete values. Internally a wildcard is encoded as a
//! zero mask so that matching reduces to
//!
//! ```text
//! context == stored.context
//!     && ((tag ^ stored.tag) & stored.tagmask) == 0
//!     && ((source ^ stored.source) & stored.srcmask) == 0
//! ```

use std::fmt;

use crate::datatype::Format;
use crate::error::{Error, Result};
use crate::{ContextId, Rank, Tag, ANY_SOURCE, ANY_TAG};

/// The (context, tag, source) triple messages are matched on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatchKey {
    /// Matching scope
    pub context: ContextId,
    /// Message tag, or `ANY_TAG` on a receive
    pub tag: Tag,
    /// Sending rank, or `ANY_SOURCE` on a receive
    pub source: Rank,
}

impl MatchKey {
    /// Construct a key.
    pub fn new(context: ContextId, tag: Tag, source: Rank) -> MatchKey {
        MatchKey {
            context,
            tag,
            source,
        }
    }

    /// `true` if the key has no wildcards.
    pub fn is_concrete(&self) -> bool {
        self.tag >= 0 && self.source >= 0
    }

    /// Check a key used to post a receive or to probe.
    pub fn check_pattern(&self) -> Result<()> {
        if self.tag < 0 && self.tag != ANY_TAG {
            return Err(Error::Tag(self.tag));
        }
        if self.source < 0 && self.source != ANY_SOURCE {
            return Err(Error::Rank(self.source));
        }
        Ok(())
    }

    /// Check a key carried by an arrival.
    pub fn check_concrete(&self) -> Result<()> {
        if self.tag < 0 {
            return Err(Error::Tag(self.tag));
        }
        if self.source < 0 {
            return Err(Error::Rank(self.source));
        }
        Ok(())
    }

    pub(crate) fn masked(&self) -> MaskedKey {
        let (tag, tagmask) = if self.tag == ANY_TAG {
            (0, 0)
        } else {
            (self.tag, !0)
        };
        let (source, srcmask) = if self.source == ANY_SOURCE {
            (0, 0)
        } else {
            (self.source, !0)
        };
        MaskedKey {
            context: self.context,
            tag,
            tagmask,
            source,
            srcmask,
        }
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(context {}, ", self.context)?;
        if self.tag == ANY_TAG {
            write!(f, "any tag, ")?;
        } else {
            write!(f, "tag {}, ", self.tag)?;
        }
        if self.source == ANY_SOURCE {
            write!(f, "any source)")
        } else {
            write!(f, "source {})", self.source)
        }
    }
}

/// A key with its wildcard masks, as cached in queue elements.
///
/// Invariant: `tag & !tagmask == 0` and `source & !srcmask == 0`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct MaskedKey {
    pub context: ContextId,
    pub tag: Tag,
    pub tagmask: Tag,
    pub source: Rank,
    pub srcmask: Rank,
}

impl MaskedKey {
    /// The key with wildcards restored.
    pub fn unmasked(&self) -> MatchKey {
        MatchKey {
            context: self.context,
            tag: if self.tagmask == 0 { ANY_TAG } else { self.tag },
            source: if self.srcmask == 0 {
                ANY_SOURCE
            } else {
                self.source
            },
        }
    }

    /// Does the concrete key `other` fall under this pattern?
    #[inline]
    pub fn matches(&self, other: &MaskedKey) -> bool {
        self.context == other.context
            && ((other.tag ^ self.tag) & self.tagmask) == 0
            && ((other.source ^ self.source) & self.srcmask) == 0
    }
}

/// Sender-side identity of a send, used by the anti-send protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SendHandle {
    /// Rank of the sending endpoint
    pub origin: Rank,
    /// Request id, unique within the sending endpoint
    pub id: u64,
}

/// Everything known about a message before its payload is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Concrete matching key
    pub key: MatchKey,
    /// Payload length in bytes, in the sender's format
    pub len: usize,
    /// Data format of the payload
    pub format: Format,
    /// The send this message belongs to
    pub sender: SendHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_satisfy_invariant() {
        for key in [
            MatchKey::new(0, 7, 2),
            MatchKey::new(0, ANY_TAG, 2),
            MatchKey::new(3, 7, ANY_SOURCE),
            MatchKey::new(3, ANY_TAG, ANY_SOURCE),
        ] {
            let m = key.masked();
            assert_eq!(m.tag & !m.tagmask, 0);
            assert_eq!(m.source & !m.srcmask, 0);
            assert_eq!(m.unmasked(), key);
        }
    }

    #[test]
    fn wildcards_match() {
        let arrival = MatchKey::new(0, 7, 2).masked();
        assert!(MatchKey::new(0, 7, 2).masked().matches(&arrival));
        assert!(MatchKey::new(0, ANY_TAG, 2).masked().matches(&arrival));
        assert!(MatchKey::new(0, 7, ANY_SOURCE).masked().matches(&arrival));
        assert!(MatchKey::new(0, ANY_TAG, ANY_SOURCE).masked().matches(&arrival));
        assert!(!MatchKey::new(1, ANY_TAG, ANY_SOURCE).masked().matches(&arrival));
        assert!(!MatchKey::new(0, 8, 2).masked().matches(&arrival));
        assert!(!MatchKey::new(0, 7, 3).masked().matches(&arrival));
    }

    #[test]
    fn key_checks() {
        assert!(MatchKey::new(0, ANY_TAG, ANY_SOURCE).check_pattern().is_ok());
        assert_eq!(MatchKey::new(0, -7, 0).check_pattern(), Err(Error::Tag(-7)));
        assert_eq!(MatchKey::new(0, 1, -9).check_pattern(), Err(Error::Rank(-9)));
        assert_eq!(MatchKey::new(0, ANY_TAG, 0).check_concrete(), Err(Error::Tag(ANY_TAG)));
        assert_eq!(MatchKey::new(0, 2, 1).to_string(), "(context 0, tag 2, source 1)");
    }
}
