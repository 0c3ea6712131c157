/*! The process-wide fan-out hub between connectors and evaluators

A [Broker] keeps a registry of enrolled [BufferPort]s and runs a pool
of consumer threads. Each consumer round-robins over the registry,
drains raw-out queues, evaluates items via
[WorkItem::process][crate::item::WorkItem::process], and pushes the
results into the owning port's processed-in queue.

The broker holds only weak handles: a port lives exactly as long as
the connector that owns it, and consumers stop serving a port as soon
as its connector is gone.
*/

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

use crate::item::WorkItem;

mod port;

pub use port::BufferPort;


/// How long a consumer waits on one port's raw queue before moving on
/// to the next port.
const DRAIN_PATIENCE: Duration = Duration::from_millis(2);

/// Back-off applied by a consumer when no port is enrolled.
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

struct Registry<T> {
    ports: Mutex<Vec<Weak<BufferPort<T>>>>,
    shutdown: AtomicBool,
}

/// The fan-out hub. Owns the consumer threads; joined on drop.
pub struct Broker<T> {
    registry: Arc<Registry<T>>,
    consumers: Vec<JoinHandle<()>>,
}

impl<T: WorkItem + Send + 'static> Broker<T> {
    /// Start a broker with `n_consumers` worker threads; `0` selects
    /// the hardware concurrency.
    pub fn new(n_consumers: usize) -> Self {
        let n = if n_consumers == 0 {
            num_cpus::get()
        } else {
            n_consumers
        };
        let registry = Arc::new(Registry {
            ports: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        let consumers = (0..n)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || consumer_loop(worker, &registry))
            })
            .collect();
        debug!("broker started with {n} consumers");
        Broker {
            registry,
            consumers,
        }
    }

    /// Enroll a buffer port. The broker keeps a weak handle only; the
    /// port is dropped from the registry once its owning connector is
    /// gone.
    pub fn enroll(&self, port: &Arc<BufferPort<T>>) {
        let mut ports = lock_registry(&self.registry.ports);
        ports.push(Arc::downgrade(port));
        debug!("enrolled buffer port ({} now registered)", ports.len());
    }

    /// The number of consumer threads serving this broker.
    pub fn n_consumers(&self) -> usize {
        self.consumers.len()
    }
}

impl<T> Drop for Broker<T> {
    fn drop(&mut self) {
        self.registry.shutdown.store(true, Ordering::Release);
        for consumer in self.consumers.drain(..) {
            let _ = consumer.join();
        }
    }
}

// Mutex poisoning only matters if a consumer died mid-update; the
// registry itself is always structurally valid.
fn lock_registry<T>(ports: &Mutex<Vec<Weak<BufferPort<T>>>>) -> std::sync::MutexGuard<'_, Vec<Weak<BufferPort<T>>>> {
    match ports.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn consumer_loop<T: WorkItem + Send + 'static>(worker: usize, registry: &Registry<T>) {
    while !registry.shutdown.load(Ordering::Acquire) {
        let ports: Vec<Arc<BufferPort<T>>> = {
            let mut guard = lock_registry(&registry.ports);
            guard.retain(|weak| weak.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };

        if ports.is_empty() {
            thread::sleep(IDLE_BACKOFF);
            continue;
        }

        for port in &ports {
            if registry.shutdown.load(Ordering::Acquire) {
                return;
            }
            if let Some(item) = port.pop_raw_timed(DRAIN_PATIENCE) {
                serve(worker, port, item);
            }
        }
    }
}

/// Evaluate one item and return it through the port. A panicking
/// objective costs the item (the connector's resubmission logic covers
/// the loss) but never the consumer thread.
fn serve<T: WorkItem>(worker: usize, port: &BufferPort<T>, item: T) {
    match panic::catch_unwind(AssertUnwindSafe(move || {
        let mut item = item;
        item.process();
        item
    })) {
        Ok(item) => port.push_processed(item),
        Err(_) => error!("consumer {worker}: work item evaluation panicked, item dropped"),
    }
}
