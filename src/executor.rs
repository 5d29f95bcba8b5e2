//! Sequential page retrieval with retry and cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::compiler::{CompiledRequest, Cursor, PageRequest};
use crate::error::{AflowError, Result};
use crate::transport::{Connection, RawPage, RawRecord, Transport};

/// How often a backoff sleep checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt of a page.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, or the
    /// server's `Retry-After`, capped at `max_delay`.
    pub fn delay(&self, retry: usize, retry_after: Option<Duration>) -> Duration {
        let exp = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        retry_after.unwrap_or(backoff).min(self.max_delay)
    }
}

/// Cancellation flag shared between a result stream and whoever wants to
/// stop it, possibly from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when
    /// the sleep was cut short.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub pages: usize,
    pub retries: usize,
}

#[derive(Debug)]
enum State {
    Pending(Option<Cursor>),
    Exhausted,
    Failed,
    Cancelled,
}

/// Lazy stream of raw records for one compiled query.
///
/// Holds at most one page in memory. A page is requested only when the
/// buffer is empty and the caller asks for the next record.
pub struct Pages<T: Transport> {
    transport: T,
    connection: Option<T::Connection>,
    compiled: Arc<CompiledRequest>,
    policy: RetryPolicy,
    cancel: CancelToken,
    buffer: VecDeque<RawRecord>,
    state: State,
    total: Option<u64>,
    stats: ExecutionStats,
}

pub fn execute<T: Transport>(
    transport: T,
    compiled: Arc<CompiledRequest>,
    policy: RetryPolicy,
    cancel: CancelToken,
) -> Pages<T> {
    Pages {
        transport,
        connection: None,
        compiled,
        policy,
        cancel,
        buffer: VecDeque::new(),
        state: State::Pending(None),
        total: None,
        stats: ExecutionStats::default(),
    }
}

impl<T: Transport> Pages<T> {
    pub fn compiled(&self) -> &CompiledRequest {
        &self.compiled
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    /// Total reported by the first page, if any page reported one.
    pub fn total_matches(&self) -> Option<u64> {
        self.total
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, State::Cancelled) || self.cancel.is_cancelled()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Raises the cancellation flag and releases the connection now rather
    /// than on the next pull.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.state = State::Cancelled;
        self.buffer.clear();
        self.release();
    }

    fn release(&mut self) {
        if self.connection.take().is_some() {
            debug!("transport connection released");
        }
    }

    fn fetch_next(&mut self) -> Result<()> {
        let cursor = match std::mem::replace(&mut self.state, State::Exhausted) {
            State::Pending(cursor) => cursor,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        let compiled = Arc::clone(&self.compiled);
        let request = compiled.page(cursor.as_ref())?;
        let page = match self.send_with_retry(&request)? {
            Some(page) => page,
            None => {
                self.state = State::Cancelled;
                return Ok(());
            }
        };
        self.stats.pages += 1;

        debug!(
            page = self.stats.pages,
            records = page.records.len(),
            total = ?page.total_matches,
            "page fetched"
        );

        if let Some(total) = page.total_matches {
            match self.total {
                Some(expected) if expected != total => {
                    return Err(AflowError::PaginationInconsistency(format!(
                        "total matches changed from {} to {} at page {}",
                        expected, total, self.stats.pages
                    )));
                }
                _ => self.total = Some(total),
            }
        }

        match page.next_cursor {
            Some(token) if page.records.is_empty() => {
                return Err(AflowError::PaginationInconsistency(format!(
                    "empty page {} still points to `{}`",
                    self.stats.pages, token
                )));
            }
            Some(token) => {
                if cursor.as_ref().map(Cursor::token) == Some(token.as_str()) {
                    return Err(AflowError::PaginationInconsistency(format!(
                        "cursor `{}` did not advance",
                        token
                    )));
                }
                self.state = State::Pending(Some(compiled.cursor(token)));
            }
            _ => self.release(),
        }

        self.buffer.extend(page.records);
        Ok(())
    }

    /// `Ok(None)` means the query was cancelled while waiting to retry. A
    /// connection that failed a request is dropped and reopened.
    fn send_with_retry(&mut self, request: &PageRequest<'_>) -> Result<Option<RawPage>> {
        let mut retry = 0;
        loop {
            let outcome = match self.connection.take() {
                Some(conn) => Ok(conn),
                None => self.transport.connect(),
            }
            .and_then(|mut conn| {
                let result = conn.send(request);
                if result.is_ok() {
                    self.connection = Some(conn);
                }
                result
            });

            let err = match outcome {
                Ok(page) => return Ok(Some(page)),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err.into());
            }
            if retry >= self.policy.max_retries {
                return Err(AflowError::TransientFetchFailure {
                    attempts: retry + 1,
                    source: err,
                });
            }

            let delay = self.policy.delay(retry, err.retry_after());
            retry += 1;
            self.stats.retries += 1;
            warn!(retry, ?delay, error = %err, "transient fetch failure, retrying");

            if !self.cancel.sleep(delay) {
                return Ok(None);
            }
        }
    }
}

impl<T: Transport> Iterator for Pages<T> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.is_cancelled() {
                if !matches!(self.state, State::Cancelled) {
                    debug!(pages = self.stats.pages, "query cancelled");
                    self.state = State::Cancelled;
                }
                self.buffer.clear();
                self.release();
                return None;
            }

            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }

            if !matches!(self.state, State::Pending(_)) {
                self.release();
                return None;
            }

            if let Err(err) = self.fetch_next() {
                self.state = State::Failed;
                self.buffer.clear();
                self.release();
                return Some(Err(err));
            }
        }
    }
}

impl<T: Transport> Drop for Pages<T> {
    fn drop(&mut self) {
        self.release();
    }
}
