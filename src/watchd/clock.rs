use std::fmt;
use std::str::FromStr;

use crate::error::WatchdError;

/// A point in a root's event log: "everything up to `ticks` is reflected".
///
/// Tokens compare first by process identity and root instance, then by tick,
/// so two tokens from the same watch order the way their observations did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockToken {
    pub start_epoch_secs: u64,
    pub pid: u32,
    pub root_number: u64,
    pub ticks: u64,
}

impl ClockToken {
    /// True when `other` was issued by this process for this root instance,
    /// which is what makes a tick comparison meaningful.
    pub fn same_instance(&self, other: &ClockToken) -> bool {
        self.start_epoch_secs == other.start_epoch_secs
            && self.pid == other.pid
            && self.root_number == other.root_number
    }
}

impl fmt::Display for ClockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "c:{}:{}:{}:{}",
            self.start_epoch_secs, self.pid, self.root_number, self.ticks
        )
    }
}

impl FromStr for ClockToken {
    type Err = WatchdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || WatchdError::invalid(format!("invalid clock string `{raw}`"));
        let mut parts = raw.split(':');
        if parts.next() != Some("c") {
            return Err(invalid());
        }
        let mut next_u64 = || -> Result<u64, WatchdError> {
            parts
                .next()
                .and_then(|part| part.parse::<u64>().ok())
                .ok_or_else(invalid)
        };
        let start_epoch_secs = next_u64()?;
        let pid = u32::try_from(next_u64()?).map_err(|_| invalid())?;
        let root_number = next_u64()?;
        let ticks = next_u64()?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(ClockToken {
            start_epoch_secs,
            pid,
            root_number,
            ticks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ClockToken;

    fn token(ticks: u64) -> ClockToken {
        ClockToken {
            start_epoch_secs: 1_700_000_000,
            pid: 77,
            root_number: 3,
            ticks,
        }
    }

    #[test]
    fn display_and_parse_agree() {
        let parsed: ClockToken = "c:1700000000:77:3:12".parse().expect("parse");
        assert_eq!(parsed, token(12));
        assert_eq!(token(12).to_string(), "c:1700000000:77:3:12");
    }

    #[test]
    fn later_ticks_order_after_earlier_ones() {
        assert!(token(5) < token(6));
        assert!(token(5).same_instance(&token(9)));
    }

    #[test]
    fn other_root_instance_is_not_comparable() {
        let mut other = token(5);
        other.root_number = 4;
        assert!(!token(5).same_instance(&other));
    }

    #[test]
    fn rejects_malformed_strings() {
        for raw in ["", "n:foo", "c:1:2:3", "c:1:2:3:4:5", "c:a:2:3:4"] {
            assert!(raw.parse::<ClockToken>().is_err(), "{raw} should fail");
        }
    }
}
