use std::sync::{Arc, Mutex};

use log::warn;

use super::Evaluation;
use crate::connector::ConnectorError;
use crate::item::{FitnessKind, ReevalPolicy, WorkItem};
use crate::pool::ThreadPool;

/// Evaluates items on a shared worker pool and waits for the drain.
///
/// Worker panics are surfaced as warnings after the join; the
/// affected items simply stay dirty and are re-evaluated on the next
/// sweep.
pub struct MultiThreaded {
    pool: ThreadPool,
}

impl MultiThreaded {
    /// Create a back end with `n_threads` workers; `0` selects the
    /// hardware concurrency.
    pub fn new(n_threads: usize) -> Self {
        MultiThreaded {
            pool: ThreadPool::new(n_threads),
        }
    }

    /// The underlying worker pool.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}

impl<T: WorkItem + Send + 'static> Evaluation<T> for MultiThreaded {
    fn run(
        &mut self,
        population: &mut Vec<T>,
        after_first_iteration: bool,
    ) -> Result<bool, ConnectorError> {
        // Items move into shared cells for the duration of the sweep
        // and are reclaimed, in order, after the join.
        let cells: Vec<Arc<Mutex<T>>> = population
            .drain(..)
            .map(|item| {
                debug_assert!(
                    !after_first_iteration || item.is_dirty(),
                    "evaluation sweep over an item that is not dirty"
                );
                Arc::new(Mutex::new(item))
            })
            .collect();

        for cell in &cells {
            let cell = Arc::clone(cell);
            self.pool.schedule(move || {
                let mut item = match cell.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                item.fitness(FitnessKind::Transformed, ReevalPolicy::Allow);
            });
        }

        self.pool.wait();

        if self.pool.has_errors() {
            for error in self.pool.drain_errors() {
                warn!("fitness worker failed: {error}");
            }
        }

        population.extend(cells.into_iter().map(|cell| {
            let mutex = Arc::try_unwrap(cell)
                .unwrap_or_else(|_| panic!("worker pool still holds work items after wait()"));
            match mutex.into_inner() {
                Ok(item) => item,
                Err(poisoned) => poisoned.into_inner(),
            }
        }));

        Ok(true)
    }
}
