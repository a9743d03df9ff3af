use serde::{Serialize, Deserialize};
use std::fmt;

/// Logical cluster timestamp: seconds plus an increment within the second.
///
/// Ordering is lexicographic on (secs, inc), which is what the commit
/// timestamp rule `commitTimestamp = max(prepareTimestamps)` relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    pub secs: u32,
    pub inc: u32,
}

impl LogicalTimestamp {
    pub const fn new(secs: u32, inc: u32) -> Self {
        LogicalTimestamp { secs, inc }
    }

    /// Pack into a single u64 (secs in the high half)
    pub fn as_u64(&self) -> u64 {
        ((self.secs as u64) << 32) | self.inc as u64
    }

    pub fn from_u64(value: u64) -> Self {
        LogicalTimestamp {
            secs: (value >> 32) as u32,
            inc: value as u32,
        }
    }

    /// Smallest timestamp after this one; the increment rolls over into the
    /// next second
    pub fn next(&self) -> Self {
        Self::from_u64(self.as_u64().saturating_add(1))
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}
