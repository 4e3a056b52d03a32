//! Foreground presence reporting and failure reporting

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use viska_xmpp_core::Jid;

use crate::error::ServiceError;

/// Told how many sessions are ONLINE, for process-priority upkeep
pub trait PresenceReporter: Send + Sync {
    fn report_online(&self, count: usize);

    /// No session is registered any more
    fn report_idle(&self);
}

/// Receives per-identity failures that are not returned to a caller
pub trait ErrorSink: Send + Sync {
    fn report(&self, identity: Option<&Jid>, error: &ServiceError);
}

/// Default sink: log and move on
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, identity: Option<&Jid>, error: &ServiceError) {
        match identity {
            Some(identity) => warn!(%identity, error = %error, "{}", error.user_message()),
            None => warn!(error = %error, "{}", error.user_message()),
        }
    }
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPresence;

impl PresenceReporter for NoopPresence {
    fn report_online(&self, _count: usize) {}

    fn report_idle(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reported {
    Online(usize),
    Idle,
}

/// Forwards registry snapshots to a [`PresenceReporter`], only on change
pub struct PresenceTracker {
    reporter: Arc<dyn PresenceReporter>,
    last: Mutex<Option<Reported>>,
}

impl PresenceTracker {
    pub fn new(reporter: Arc<dyn PresenceReporter>) -> Self {
        Self {
            reporter,
            last: Mutex::new(None),
        }
    }

    /// `online` ONLINE sessions out of `registered` entries
    pub fn refresh(&self, online: usize, registered: usize) {
        let next = if registered == 0 {
            Reported::Idle
        } else {
            Reported::Online(online)
        };
        {
            let mut last = self.last.lock();
            if *last == Some(next) {
                return;
            }
            *last = Some(next);
        }
        debug!(online, registered, "presence changed");
        match next {
            Reported::Online(count) => self.reporter.report_online(count),
            Reported::Idle => self.reporter.report_idle(),
        }
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker").field("last", &*self.last.lock()).finish()
    }
}
