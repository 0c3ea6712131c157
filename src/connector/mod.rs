/*! The per-algorithm submission gateway to the broker

A [BrokerConnector] owns one [BufferPort] and submits contiguous
ranges of work items through it. Collection of the processed returns
is governed by an adaptive time budget: the connector waits without
limit (or up to a configurable deadline) for the *first* item of a
submission, measures its turn-around time, and grants every further
item a deadline proportional to that measurement. A wait factor,
adjusted by a hysteresis rule across submissions, scales the
proportion to the observed load of the evaluation resources.

Three submission modes trade completeness against latency:

- [SubmissionMode::AcceptOlder]: incomplete returns are tolerated and
  stragglers from earlier submissions are kept.
- [SubmissionMode::RejectOlder]: incomplete returns are tolerated,
  stragglers are discarded.
- [SubmissionMode::ExpectFull]: every submitted item must return;
  missing items are resubmitted up to a configurable number of times,
  and the caller's range is either completely replaced in position
  order or left untouched.
*/

use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::Display;
use itertools::Itertools;
use log::debug;
use thiserror::Error;

use crate::broker::{Broker, BufferPort};
use crate::item::{CourtierId, WorkItem};

/// Default scaling applied to the first item's turn-around time.
pub const DEFAULT_WAIT_FACTOR: f64 = 1.0;
/// Default lower boundary for the wait factor adaption.
pub const DEFAULT_MIN_WAIT_FACTOR: f64 = 0.0;
/// Default upper boundary for the wait factor adaption.
pub const DEFAULT_MAX_WAIT_FACTOR: f64 = 10.0;
/// Default step of the wait factor adaption.
pub const DEFAULT_WAIT_FACTOR_INCREMENT: f64 = 0.1;
/// Default number of resubmissions in [SubmissionMode::ExpectFull].
pub const DEFAULT_MAX_RESUBMISSIONS: usize = 5;
/// If a complete submission needed less than this fraction of its
/// timeout budget, the wait factor is lowered.
pub const MIN_PERCENTAGE_OF_TIMEOUT: f64 = 0.7;
/// Queue capacity of a connector's buffer port.
pub const DEFAULT_PORT_CAPACITY: usize = 4096;

/// Ceiling substituted when the deadline arithmetic would overflow a
/// [Duration].
const MAX_SCALED_WAIT: Duration = Duration::from_secs(86_400);

/// Governs what a [BrokerConnector::work_on] call accepts and
/// guarantees. See the module documentation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum SubmissionMode {
    AcceptOlder,
    RejectOlder,
    ExpectFull,
}

/// Fatal failure of a [BrokerConnector::work_on] call.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// The very first item of a fresh submission did not return
    /// within the configured deadline.
    #[error("first work item of submission {submission} did not return within {timeout:?}")]
    FirstItemTimeout {
        submission: u32,
        timeout: Duration,
    },
}

/// Error type returned when a connector setting is rejected.
#[derive(Debug, Error, Copy, Clone, PartialEq)]
pub enum ConfigError {
    /// The extremes must satisfy `0 <= min < max`.
    #[error("invalid wait factor extremes: {min} / {max}")]
    WaitFactorExtremes { min: f64, max: f64 },
    /// The increment must be strictly positive.
    #[error("wait factor increment must be strictly positive, got {0}")]
    WaitFactorIncrement(f64),
}

/// Per-submission bookkeeping. Created afresh for every
/// [BrokerConnector::work_on] call.
struct SubmissionState {
    id: u32,
    expected: usize,
    received_current: usize,
    received_older: usize,
    started: Instant,
    first_elapsed: Duration,
    max_allowed: Duration,
    /// Which offsets of the submitted range have returned.
    returned: Vec<bool>,
    retries: usize,
}

impl SubmissionState {
    fn complete(&self) -> bool {
        self.received_current == self.expected
    }
}

/// What [classify] decided about a popped item.
enum Arrival {
    /// First return for an offset of the current submission.
    Current(usize),
    /// Already-seen offset of the current submission.
    Duplicate,
    /// Anything else: earlier submissions, unstamped items.
    Older,
}

fn classify<T: WorkItem>(item: &T, state: &SubmissionState, start: usize) -> Arrival {
    match item.courtier_id() {
        Some(id) if id.submission == state.id => {
            let offset = (id.position as usize).wrapping_sub(start);
            if offset < state.expected && !state.returned[offset] {
                Arrival::Current(offset)
            } else {
                Arrival::Duplicate
            }
        }
        _ => Arrival::Older,
    }
}

/// Scale a measured duration by a wait factor, saturating instead of
/// overflowing on pathological inputs.
fn scaled_wait(base: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(MAX_SCALED_WAIT)
}

/// Submission gateway for one algorithm. Owns its buffer port; the
/// broker's consumers serve the other side.
pub struct BrokerConnector<T> {
    wait_factor: f64,
    min_wait_factor: f64,
    max_wait_factor: f64,
    wait_factor_increment: f64,
    boundless_wait: bool,
    max_resubmissions: usize,
    /// Whether the previous submission's collection phase ended
    /// without running into the timeout.
    all_items_returned: bool,
    /// Fraction of the timeout budget the previous submission needed.
    fraction_of_timeout_needed: f64,
    submission_counter: u32,
    /// Deadline for the first item of a submission; zero disables it.
    first_timeout: Duration,
    do_logging: bool,
    arrival_times: Vec<Vec<u32>>,
    port: Arc<BufferPort<T>>,
}

impl<T: WorkItem + Clone + Send + 'static> BrokerConnector<T> {
    /// Create a connector and enroll its buffer port with the given
    /// broker.
    pub fn new(broker: &Broker<T>) -> Self {
        let connector = Self::from_port(Arc::new(BufferPort::new(DEFAULT_PORT_CAPACITY)));
        broker.enroll(&connector.port);
        connector
    }

    /// Create a connector over an existing port whose consumer side
    /// is managed by the caller.
    pub fn from_port(port: Arc<BufferPort<T>>) -> Self {
        BrokerConnector {
            wait_factor: DEFAULT_WAIT_FACTOR,
            min_wait_factor: DEFAULT_MIN_WAIT_FACTOR,
            max_wait_factor: DEFAULT_MAX_WAIT_FACTOR,
            wait_factor_increment: DEFAULT_WAIT_FACTOR_INCREMENT,
            boundless_wait: false,
            max_resubmissions: DEFAULT_MAX_RESUBMISSIONS,
            all_items_returned: true,
            fraction_of_timeout_needed: 0.0,
            submission_counter: 0,
            first_timeout: Duration::ZERO,
            do_logging: false,
            arrival_times: Vec::new(),
            port,
        }
    }

    /// A shared handle to the connector's port, e.g. for attaching
    /// custom consumers.
    pub fn port(&self) -> Arc<BufferPort<T>> {
        Arc::clone(&self.port)
    }

    /// Set the deadline for the first item of each submission.
    /// [Duration::ZERO] disables the deadline (wait forever).
    pub fn set_first_timeout(&mut self, timeout: Duration) {
        self.first_timeout = timeout;
    }

    /// The configured first-item deadline.
    pub fn first_timeout(&self) -> Duration {
        self.first_timeout
    }

    /// Set the boundaries within which the wait factor is adapted.
    pub fn set_wait_factor_extremes(&mut self, min: f64, max: f64) -> Result<(), ConfigError> {
        if min < 0.0 || min >= max {
            return Err(ConfigError::WaitFactorExtremes { min, max });
        }
        self.min_wait_factor = min;
        self.max_wait_factor = max;
        Ok(())
    }

    /// The lower boundary of the wait factor adaption.
    pub fn min_wait_factor(&self) -> f64 {
        self.min_wait_factor
    }

    /// The upper boundary of the wait factor adaption.
    pub fn max_wait_factor(&self) -> f64 {
        self.max_wait_factor
    }

    /// Set the amount by which the wait factor is raised or lowered
    /// during automatic adaption.
    pub fn set_wait_factor_increment(&mut self, increment: f64) -> Result<(), ConfigError> {
        if increment <= 0.0 {
            return Err(ConfigError::WaitFactorIncrement(increment));
        }
        self.wait_factor_increment = increment;
        Ok(())
    }

    /// The current wait factor.
    pub fn wait_factor(&self) -> f64 {
        self.wait_factor
    }

    /// When enabled, arrivals are awaited indefinitely and the wait
    /// factor adaption is suspended.
    pub fn set_boundless_wait(&mut self, boundless: bool) {
        self.boundless_wait = boundless;
    }

    /// Whether arrivals are awaited indefinitely.
    pub fn boundless_wait(&self) -> bool {
        self.boundless_wait
    }

    /// Set how often missing items are resubmitted in
    /// [SubmissionMode::ExpectFull].
    pub fn set_max_resubmissions(&mut self, max: usize) {
        self.max_resubmissions = max;
    }

    /// The configured resubmission cap.
    pub fn max_resubmissions(&self) -> usize {
        self.max_resubmissions
    }

    /// Whether the previous submission's collection phase ended
    /// without running into the timeout.
    pub fn all_items_returned(&self) -> bool {
        self.all_items_returned
    }

    /// Enable or disable logging of arrival times. Only arrivals of
    /// the current submission are recorded.
    pub fn set_logging(&mut self, enabled: bool) {
        self.do_logging = enabled;
    }

    /// Whether arrival-time logging is active.
    pub fn logging_enabled(&self) -> bool {
        self.do_logging
    }

    /// Retrieve and clear the recorded arrival times, one inner
    /// vector per logged submission, in milliseconds since the
    /// submission started.
    pub fn get_logging_results(&mut self) -> Vec<Vec<u32>> {
        std::mem::take(&mut self.arrival_times)
    }

    /// Submit the items in `[start, end)` for processing and collect
    /// their returns.
    ///
    /// In the incomplete-return modes, items of the current
    /// submission that arrived in time are inserted back at `start`
    /// in unspecified order, items that did not return are dropped
    /// from the sequence, and stragglers from earlier submissions are
    /// kept ([SubmissionMode::AcceptOlder]) or discarded
    /// ([SubmissionMode::RejectOlder]).
    ///
    /// In [SubmissionMode::ExpectFull], a `true` return guarantees
    /// that every position of the range holds its processed original,
    /// in position order; on `false`, the range is untouched and the
    /// resubmission cap was exhausted.
    ///
    /// The return value is `true` exactly if every item of the
    /// current submission came back in time.
    pub fn work_on(
        &mut self,
        items: &mut Vec<T>,
        start: usize,
        end: usize,
        mode: SubmissionMode,
    ) -> Result<bool, ConnectorError> {
        assert!(
            start < end && end <= items.len(),
            "invalid work range {start}..{end} for {} items",
            items.len()
        );
        match mode {
            SubmissionMode::AcceptOlder => self.work_on_incomplete_allowed(items, start, end, true),
            SubmissionMode::RejectOlder => {
                self.work_on_incomplete_allowed(items, start, end, false)
            }
            SubmissionMode::ExpectFull => self.work_on_full_return(items, start, end),
        }
    }

    /// Incomplete-return modes: submitted items are moved out of the
    /// sequence; whatever returns in time is inserted back at the
    /// range anchor.
    fn work_on_incomplete_allowed(
        &mut self,
        items: &mut Vec<T>,
        start: usize,
        end: usize,
        accept_older: bool,
    ) -> Result<bool, ConnectorError> {
        let mut state = self.begin_submission(end - start);

        for (offset, mut item) in items.drain(start..end).enumerate() {
            item.set_courtier_id(CourtierId {
                submission: state.id,
                position: (start + offset) as u32,
            });
            self.port.push_raw(item);
        }

        // Wait for the first item of the current submission. Items
        // from earlier submissions may arrive first; they do not end
        // this phase.
        loop {
            let item = match self.retrieve_first(&mut state) {
                Ok(item) => item,
                Err(e) => {
                    // A timed-out submission still consumes its id,
                    // so late stragglers cannot collide with the
                    // next submission.
                    self.submission_counter += 1;
                    return Err(e);
                }
            };
            match classify(&item, &state, start) {
                Arrival::Current(offset) => {
                    state.returned[offset] = true;
                    state.received_current += 1;
                    items.insert(start, item);
                    break;
                }
                Arrival::Duplicate | Arrival::Older => {
                    state.received_older += 1;
                    if accept_older {
                        items.insert(start, item);
                    }
                }
            }
        }

        // Collect further arrivals until the set is complete or the
        // time budget runs out.
        while !state.complete() {
            let Some(item) = self.retrieve(&mut state) else {
                break;
            };
            match classify(&item, &state, start) {
                Arrival::Current(offset) => {
                    state.returned[offset] = true;
                    state.received_current += 1;
                    items.insert(start, item);
                }
                Arrival::Duplicate | Arrival::Older => {
                    state.received_older += 1;
                    if accept_older {
                        items.insert(start, item);
                    }
                }
            }
        }

        Ok(self.finish_submission(&state))
    }

    /// Full-return mode: the originals stay in place while clones
    /// travel through the port, so missing items can be resubmitted
    /// and a failed call leaves the range untouched.
    fn work_on_full_return(
        &mut self,
        items: &mut Vec<T>,
        start: usize,
        end: usize,
    ) -> Result<bool, ConnectorError> {
        let mut state = self.begin_submission(end - start);

        // The originals stay untouched; stamped clones travel. This
        // way a failed call leaves the caller's range byte for byte
        // as it was, including the routing ids.
        for pos in start..end {
            self.submit_stamped_clone(&items[pos], state.id, pos);
        }

        // Holds (position, item) pairs of the current submission.
        let mut returned_items: Vec<(u32, T)> = Vec::with_capacity(state.expected);

        // First-item phase; earlier-submission stragglers are
        // discarded in this mode.
        loop {
            let item = match self.retrieve_first(&mut state) {
                Ok(item) => item,
                Err(e) => {
                    // A timed-out submission still consumes its id,
                    // so late stragglers cannot collide with the
                    // next submission.
                    self.submission_counter += 1;
                    return Err(e);
                }
            };
            match classify(&item, &state, start) {
                Arrival::Current(offset) => {
                    state.returned[offset] = true;
                    state.received_current += 1;
                    returned_items.push(((start + offset) as u32, item));
                    break;
                }
                Arrival::Duplicate | Arrival::Older => {
                    state.received_older += 1;
                }
            }
        }

        // Arrival phase with resubmission on every timeout, until
        // the set is complete or the retry cap is spent.
        while !state.complete() {
            match self.retrieve(&mut state) {
                Some(item) => match classify(&item, &state, start) {
                    Arrival::Current(offset) => {
                        state.returned[offset] = true;
                        state.received_current += 1;
                        returned_items.push(((start + offset) as u32, item));
                    }
                    Arrival::Duplicate | Arrival::Older => {
                        state.received_older += 1;
                    }
                },
                None => {
                    if state.retries >= self.max_resubmissions {
                        break;
                    }
                    // Timed out: resubmit everything that is still
                    // missing and grant one more budget window.
                    let mut resubmitted = 0;
                    for offset in 0..state.expected {
                        if !state.returned[offset] {
                            self.submit_stamped_clone(&items[start + offset], state.id, start + offset);
                            resubmitted += 1;
                        }
                    }
                    self.prolong_timeout(&mut state);
                    state.retries += 1;
                    debug!(
                        "submission {}: resubmitted {resubmitted} missing items (retry {}/{})",
                        state.id, state.retries, self.max_resubmissions
                    );
                }
            }
        }

        if state.complete() {
            debug_assert_eq!(returned_items.len(), state.expected);
            for (offset, (position, item)) in returned_items
                .into_iter()
                .sorted_by_key(|(position, _)| *position)
                .enumerate()
            {
                debug_assert_eq!(position as usize, start + offset);
                items[start + offset] = item;
            }
        }

        Ok(self.finish_submission(&state))
    }

    /// Push a stamped copy of an item, leaving the original alone.
    fn submit_stamped_clone(&self, item: &T, submission: u32, position: usize) {
        let mut clone = item.clone();
        clone.set_courtier_id(CourtierId {
            submission,
            position: position as u32,
        });
        self.port.push_raw(clone);
    }

    /// Open a new submission: adapt the wait factor from the
    /// previous submission's outcome, then reset the per-submission
    /// flags.
    fn begin_submission(&mut self, expected: usize) -> SubmissionState {
        if self.do_logging {
            self.arrival_times.push(Vec::new());
        }

        // Snapshot the previous submission's outcome before any
        // reset, so one late submission is counted exactly once.
        let prev_complete = self.all_items_returned;
        let prev_fraction = self.fraction_of_timeout_needed;

        // Adapting the wait factor only makes sense with bounded
        // waits, and only once a previous submission exists.
        if !self.boundless_wait && self.submission_counter > 0 {
            if !prev_complete {
                self.wait_factor =
                    (self.wait_factor + self.wait_factor_increment).min(self.max_wait_factor);
            } else if prev_fraction < MIN_PERCENTAGE_OF_TIMEOUT {
                self.wait_factor =
                    (self.wait_factor - self.wait_factor_increment).max(self.min_wait_factor);
            }
        }

        // Assume the best for the new submission; the first timed-out
        // pop falsifies this.
        self.all_items_returned = true;
        self.fraction_of_timeout_needed = 0.0;

        SubmissionState {
            id: self.submission_counter,
            expected,
            received_current: 0,
            received_older: 0,
            started: Instant::now(),
            first_elapsed: Duration::ZERO,
            max_allowed: Duration::ZERO,
            returned: vec![false; expected],
            retries: 0,
        }
    }

    /// Close a submission: emit accounting, bump the counter, and
    /// report completeness.
    fn finish_submission(&mut self, state: &SubmissionState) -> bool {
        debug!(
            "submission {}: {}/{} current items returned, {} older, {} retries, wait factor {:.2}",
            state.id,
            state.received_current,
            state.expected,
            state.received_older,
            state.retries,
            self.wait_factor
        );
        self.submission_counter += 1;
        state.complete()
    }

    /// Pop one item during the first-item phase. Each call waits up
    /// to the configured first-item deadline (or forever if the
    /// deadline is disabled) and refreshes the submission's time
    /// budget, so the budget ends up measured against the first item
    /// of the *current* submission.
    fn retrieve_first(&mut self, state: &mut SubmissionState) -> Result<T, ConnectorError> {
        let item = if self.first_timeout.is_zero() {
            self.port.pop_processed_blocking()
        } else {
            match self.port.pop_processed_timed(self.first_timeout) {
                Some(item) => item,
                None => {
                    return Err(ConnectorError::FirstItemTimeout {
                        submission: state.id,
                        timeout: self.first_timeout,
                    })
                }
            }
        };

        state.first_elapsed = state.started.elapsed();
        state.max_allowed = scaled_wait(state.first_elapsed, self.wait_factor + 1.0);
        self.record_arrival(state.first_elapsed);
        Ok(item)
    }

    /// Pop one item during the arrival phase. Returns `None` once the
    /// submission's time budget is spent, which also marks the
    /// submission as incomplete for the wait factor adaption.
    fn retrieve(&mut self, state: &mut SubmissionState) -> Option<T> {
        if self.boundless_wait {
            let item = self.port.pop_processed_blocking();
            self.record_arrival(state.started.elapsed());
            return Some(item);
        }

        let elapsed = state.started.elapsed();
        if elapsed >= state.max_allowed {
            self.all_items_returned = false;
            return None;
        }
        match self.port.pop_processed_timed(state.max_allowed - elapsed) {
            None => {
                self.all_items_returned = false;
                None
            }
            Some(item) => {
                let elapsed = state.started.elapsed();
                debug_assert!(!state.max_allowed.is_zero());
                self.fraction_of_timeout_needed =
                    (elapsed.as_secs_f64() / state.max_allowed.as_secs_f64()).clamp(0.0, 1.0);
                self.record_arrival(elapsed);
                Some(item)
            }
        }
    }

    /// Grant one more budget window after a resubmission, again
    /// proportional to the first item's turn-around time.
    fn prolong_timeout(&mut self, state: &mut SubmissionState) {
        state.max_allowed = state
            .max_allowed
            .checked_add(scaled_wait(state.first_elapsed, self.wait_factor + 1.0))
            .unwrap_or(MAX_SCALED_WAIT);
    }

    fn record_arrival(&mut self, elapsed: Duration) {
        if self.do_logging {
            if let Some(current) = self.arrival_times.last_mut() {
                current.push(u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX));
            }
        }
    }
}
