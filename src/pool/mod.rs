/*! A fire-and-wait worker pool with post-join error surfacing

Thin wrapper around [threadpool::ThreadPool]: jobs are scheduled
individually and awaited collectively. Anything that panics out of a
job is captured and reported after the join instead of tearing down a
worker, so one failing fitness computation never aborts an iteration.
*/

use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;

/// Fire-and-wait scheduler over a fixed number of worker threads.
pub struct ThreadPool {
    inner: threadpool::ThreadPool,
    errors_tx: Sender<String>,
    errors_rx: Receiver<String>,
}

impl ThreadPool {
    /// Create a pool with `n_threads` workers; `0` selects the
    /// hardware concurrency.
    pub fn new(n_threads: usize) -> Self {
        let n = if n_threads == 0 {
            num_cpus::get()
        } else {
            n_threads
        };
        let (errors_tx, errors_rx) = unbounded();
        ThreadPool {
            inner: threadpool::ThreadPool::new(n),
            errors_tx,
            errors_rx,
        }
    }

    /// The number of worker threads.
    pub fn n_threads(&self) -> usize {
        self.inner.max_count()
    }

    /// Schedule a job for asynchronous execution. Panics escaping the
    /// job are captured and surfaced via [ThreadPool::drain_errors]
    /// after the next [ThreadPool::wait].
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let errors = self.errors_tx.clone();
        self.inner.execute(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                let message = match payload.downcast_ref::<&str>() {
                    Some(s) => (*s).to_owned(),
                    None => payload
                        .downcast_ref::<String>()
                        .cloned()
                        .unwrap_or_else(|| "opaque panic payload".to_owned()),
                };
                error!("pool worker panicked: {message}");
                // Nobody listens once the pool itself is gone.
                let _ = errors.send(message);
            }
        });
    }

    /// Block until all scheduled jobs have finished.
    pub fn wait(&self) {
        self.inner.join();
    }

    /// Whether any job has failed since the last drain.
    pub fn has_errors(&self) -> bool {
        !self.errors_rx.is_empty()
    }

    /// Retrieve and clear the captured job failures.
    pub fn drain_errors(&self) -> Vec<String> {
        self.errors_rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests;
