use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::{WatchdError, WatchdResult};
use crate::watchd::clock::ClockToken;
use crate::watchd::cookie::CookieState;
use crate::watchd::root::Root;
use crate::watchd::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Issued,
    WaitingOnCookie,
    Resolved,
    TimedOut,
    Aborted,
}

/// One synchronized read of a root's clock.
///
/// A positive timeout always goes through `WaitingOnCookie`; a zero timeout
/// resolves immediately with whatever the view already reflects.
#[derive(Debug)]
pub struct SyncRequest<'a> {
    root: &'a Root,
    timeout: Duration,
    issued_at: Instant,
    phase: SyncPhase,
}

impl<'a> SyncRequest<'a> {
    pub fn new(root: &'a Root, timeout: Duration) -> Self {
        Self {
            root,
            timeout,
            issued_at: Instant::now(),
            phase: SyncPhase::Issued,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn run(&mut self) -> WatchdResult<ClockToken> {
        if self.root.is_cancelled() {
            return Err(WatchdError::NotWatched(self.root.path().display().to_string()));
        }
        if self.timeout.is_zero() {
            self.phase = SyncPhase::Resolved;
            return Ok(self.root.clock());
        }

        let deadline = self.issued_at + self.timeout;
        let cookies = self.root.cookies();
        let cookie = cookies.plant()?;
        self.phase = SyncPhase::WaitingOnCookie;

        match cookies.wait(&cookie, deadline) {
            CookieState::Observed => {
                self.phase = SyncPhase::Resolved;
                Ok(self.root.clock())
            }
            CookieState::TimedOut => {
                self.phase = SyncPhase::TimedOut;
                Err(WatchdError::SyncTimeout {
                    timeout_ms: util::millis(self.timeout),
                    elapsed_ms: util::millis(self.issued_at.elapsed()),
                })
            }
            CookieState::Aborted | CookieState::Pending => {
                self.phase = SyncPhase::Aborted;
                Err(WatchdError::SyncAborted {
                    root: self.root.path().display().to_string(),
                })
            }
        }
    }
}

/// Produce a clock for `root` that reflects every change made before this
/// call, waiting at most `timeout`.
pub fn sync_to_now(root: &Root, timeout: Duration) -> WatchdResult<ClockToken> {
    let mut request = SyncRequest::new(root, timeout);
    let result = request.run();
    tracing::debug!(
        root = %root.path().display(),
        phase = ?request.phase(),
        timeout_ms = util::millis(timeout),
        "sync finished"
    );
    result
}

/// Read a `sync_timeout` request field. Absent means `default_ms`.
pub fn parse_sync_timeout(value: Option<&Value>, default_ms: u64) -> WatchdResult<Duration> {
    let Some(value) = value else {
        return Ok(Duration::from_millis(default_ms));
    };
    if let Some(ms) = value.as_u64() {
        return Ok(Duration::from_millis(ms));
    }
    if value.as_i64().is_some_and(|ms| ms < 0) {
        return Err(WatchdError::invalid("sync_timeout must be >= 0"));
    }
    Err(WatchdError::invalid(format!(
        "sync_timeout must be an integer value >= 0, got {value}"
    )))
}
