//! Request/acknowledgement correlation
//!
//! A [`CorrelationRegistry`] maps each outstanding [`CorrelationId`] to the completion channel of
//! the caller waiting on it. Every entry is resolved exactly once: by the transport, by a
//! deadline sweep, or by cancellation. Late or duplicate resolutions find no entry and are
//! ignored.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::message::ServiceResponse;
use crate::{Error, Result};

/// Token linking a request to its acknowledgement or response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(CorrelationId)
    }
}

/// Successful completion of a submitted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Id the operation was submitted under
    pub correlation_id: CorrelationId,
    /// Response body for request/response operations such as twin reads
    pub response: Option<ServiceResponse>,
}

/// Sending half of a pending operation
pub type Completion = oneshot::Sender<Result<Delivered>>;

/// Longest distance ahead of now a deadline is placed
const MAX_DEADLINE: Duration = Duration::from_secs(86400 * 365);

/// `start + timeout`, clamped so oversized timeouts cannot overflow the clock
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start + timeout.min(MAX_DEADLINE)
}

/// A registered correlation awaiting resolution
#[derive(Debug)]
pub struct PendingCorrelation {
    completion: Completion,
    deadline: Instant,
}

impl PendingCorrelation {
    fn complete(self, id: CorrelationId, outcome: Result<Option<ServiceResponse>>) {
        let result = outcome.map(|response| Delivered {
            correlation_id: id,
            response,
        });
        // The caller may have dropped its handle
        if self.completion.send(result).is_err() {
            trace!("Completion for {} has no listener", id);
        }
    }
}

/// Outstanding correlations of one connection
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: HashMap<CorrelationId, PendingCorrelation>,
}

impl CorrelationRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`. A duplicate id is rejected and its completion is resolved with the error.
    pub fn register(
        &mut self,
        id: CorrelationId,
        completion: Completion,
        deadline: Instant,
    ) -> Result<()> {
        if self.pending.contains_key(&id) {
            warn!("Correlation id {} is already registered", id);
            let _ = completion.send(Err(Error::DuplicateCorrelationId(id)));
            return Err(Error::DuplicateCorrelationId(id));
        }
        self.pending
            .insert(id, PendingCorrelation { completion, deadline });
        Ok(())
    }

    /// Resolve `id`. Returns `false` when the id is unknown, which happens for acknowledgements
    /// arriving after a timeout or a duplicate acknowledgement.
    pub fn resolve(&mut self, id: CorrelationId, outcome: Result<Option<ServiceResponse>>) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                pending.complete(id, outcome);
                true
            }
            None => {
                debug!("Ignoring resolution of unknown correlation id {}", id);
                false
            }
        }
    }

    /// Resolve every entry whose deadline is at or before `now` with [`Error::Timeout`]
    pub fn sweep(&mut self, now: Instant) -> Vec<CorrelationId> {
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            warn!("Correlation {} timed out", id);
            self.resolve(*id, Err(Error::Timeout));
        }
        expired
    }

    /// Resolve every entry with `error`
    pub fn drain(&mut self, error: &Error) -> usize {
        let count = self.pending.len();
        for (id, pending) in self.pending.drain() {
            pending.complete(id, Err(error.clone()));
        }
        count
    }

    /// Earliest deadline among outstanding entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Whether `id` is outstanding
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
