//! Coalescing timer for snapshot writes.

use packsync_core::Time;

/// Collapses a burst of writes into one, after a quiet period.
///
/// Every [`touch`](Self::touch) pushes the deadline back, but never past
/// `max_wait` after the first touch of the burst, so a steady stream of
/// updates still gets written out regularly.
#[derive(Debug, Clone)]
pub struct PersistDebouncer {
    quiet: chrono::Duration,
    max_wait: chrono::Duration,
    first: Option<Time>,
    last: Option<Time>,
}

impl PersistDebouncer {
    /// Create a debouncer with the given quiet period. The burst limit
    /// defaults to four quiet periods.
    pub fn new(quiet: chrono::Duration) -> Self {
        Self {
            quiet,
            max_wait: quiet * 4,
            first: None,
            last: None,
        }
    }

    /// Set the longest a write may be held back by a continuous burst.
    pub fn with_max_wait(mut self, max_wait: chrono::Duration) -> Self {
        self.max_wait = max_wait.max(self.quiet);
        self
    }

    /// Record a change at `now`.
    pub fn touch(&mut self, now: Time) {
        self.first.get_or_insert(now);
        self.last = Some(now);
    }

    /// Whether a write is owed at all.
    pub fn is_armed(&self) -> bool {
        self.last.is_some()
    }

    /// When the owed write becomes due.
    pub fn deadline(&self) -> Option<Time> {
        let (first, last) = (self.first?, self.last?);
        Some((last + self.quiet).min(first + self.max_wait))
    }

    /// Whether the quiet period, or the burst limit, has elapsed.
    pub fn is_due(&self, now: Time) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Forget the pending write (it happened, or is no longer wanted).
    pub fn disarm(&mut self) {
        self.first = None;
        self.last = None;
    }
}
