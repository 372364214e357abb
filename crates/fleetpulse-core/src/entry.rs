//! Append-log entry identifiers.
//!
//! Entries are addressed by `<ms>-<seq>`: the millisecond the entry was
//! appended plus a sequence number disambiguating entries within the same
//! millisecond. Ids are strictly increasing within one log, so ordering by
//! `(ms, seq)` is log order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// The default id is [`EntryId::MIN`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than this one. The largest possible id
    /// is its own successor.
    pub fn next(&self) -> Self {
        match (self.seq.checked_add(1), self.ms.checked_add(1)) {
            (Some(seq), _) => Self { ms: self.ms, seq },
            (None, Some(ms)) => Self { ms, seq: 0 },
            (None, None) => *self,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            // A bare millisecond value addresses sequence 0.
            None => (s, "0"),
        };
        let ms = ms
            .parse::<u64>()
            .map_err(|_| CoreError::InvalidEntryId(s.to_string()))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| CoreError::InvalidEntryId(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: EntryId = "1700000000123-4".parse().unwrap();
        assert_eq!(id, EntryId::new(1_700_000_000_123, 4));
        assert_eq!(id.to_string(), "1700000000123-4");
    }

    #[test]
    fn test_parse_bare_millis() {
        let id: EntryId = "42".parse().unwrap();
        assert_eq!(id, EntryId::new(42, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("abc-1".parse::<EntryId>().is_err());
        assert!("1-x".parse::<EntryId>().is_err());
        assert!("".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_ordering_is_log_order() {
        let a = EntryId::new(10, 5);
        let b = EntryId::new(10, 6);
        let c = EntryId::new(11, 0);
        assert!(a < b && b < c);
        assert_eq!(a.next(), b);
        assert_eq!(EntryId::new(3, u64::MAX).next(), EntryId::new(4, 0));
    }

    #[test]
    fn test_next_saturates_at_largest_id() {
        let last = EntryId::new(u64::MAX, u64::MAX);
        assert_eq!(last.next(), last);
        assert_eq!(EntryId::new(u64::MAX, 1).next(), EntryId::new(u64::MAX, 2));
    }

    #[test]
    fn test_default_is_min() {
        assert_eq!(EntryId::default(), EntryId::MIN);
        assert!(EntryId::default() < EntryId::new(0, 1));
    }
}
